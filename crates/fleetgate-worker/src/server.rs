use crate::classify::{select_detections, Classifier};
use crate::persist::{PersistJob, PersistQueue};
use crate::session::{ClassifyJob, DeviceSession};
use chrono::Utc;
use fleetgate_core::control_ipc::ControlMsg;
use fleetgate_core::device_codec::classify_payload;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Everything a device connection needs. Shared by every connection to the
/// device port.
pub struct WorkerContext {
    pub session: Mutex<DeviceSession>,
    pub classifier: Arc<dyn Classifier>,
    pub persist: Option<PersistQueue>,
    pub reports: mpsc::Sender<ControlMsg>,
}

impl WorkerContext {
    pub async fn push_command(&self, command: String) {
        let replaced = self.session.lock().await.push_command(command);
        if let Some(stale) = replaced {
            debug!(event = "pending_command_replaced", stale = %stale);
        }
    }
}

pub async fn serve(listener: TcpListener, ctx: Arc<WorkerContext>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(event = "device_accept_failed", error = %err);
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<WorkerContext>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(event = "device_handshake_failed", peer = %peer, error = %err);
            return;
        }
    };
    info!(event = "device_connected", peer = %peer);
    let (mut sink, mut stream) = ws.split();

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "device_read_failed", peer = %peer, error = %err);
                break;
            }
        };
        let payload = match message {
            Message::Text(text) => classify_payload(text.into_bytes(), true),
            Message::Binary(bytes) => classify_payload(bytes, false),
            Message::Close(_) => break,
            _ => continue,
        };

        let (pending, outcome) = {
            let mut session = ctx.session.lock().await;
            let pending = session.take_pending_command();
            (pending, session.handle_payload(payload, Utc::now()))
        };

        if let Some(command) = pending {
            match sink.send(Message::Text(command.clone())).await {
                Ok(()) => debug!(event = "command_flushed", command = %command),
                Err(err) => warn!(
                    event = "command_send_failed",
                    command = %command,
                    error = %err
                ),
            }
        }

        if let Some(record) = outcome.telemetry {
            match &ctx.persist {
                Some(queue) => {
                    queue.enqueue(PersistJob::Telemetry(record));
                }
                None => debug!(event = "telemetry_not_persisted", reason = "no_store"),
            }
        }

        if let Some(job) = outcome.classify {
            spawn_classification(ctx.clone(), job);
        }

        if ctx
            .reports
            .send(ControlMsg::ReportState(outcome.report))
            .await
            .is_err()
        {
            debug!(event = "report_channel_closed");
        }
    }

    info!(event = "device_disconnected", peer = %peer);
}

fn spawn_classification(ctx: Arc<WorkerContext>, job: ClassifyJob) {
    tokio::spawn(async move {
        let predictions = match ctx.classifier.classify(job.image.clone()).await {
            Ok(predictions) => predictions,
            Err(err) => {
                warn!(event = "classify_failed", sensor_id = %job.sensor_id, error = %err);
                return;
            }
        };
        let sampling = ctx.session.lock().await.sampling().clone();
        let detections = select_detections(
            predictions,
            &sampling.entities,
            sampling.score_threshold,
            &job.sensor_id,
            &job.image_base64,
            job.received_at,
        );
        for detection in detections {
            info!(
                event = "object_detected",
                sensor_id = %detection.sensor_id,
                label = %detection.label,
                score = detection.score
            );
            match &ctx.persist {
                Some(queue) => {
                    queue.enqueue(PersistJob::Detection(detection));
                }
                None => debug!(event = "detection_not_persisted", reason = "no_store"),
            }
        }
    });
}
