//! Worker side of the control channel: frames in on stdin, reports out on stdout.

use crate::server::WorkerContext;
use fleetgate_core::control_ipc::{
    encode_frame, ControlEnvelope, ControlMsg, FrameError, NdjsonFrameDecoder,
    DEFAULT_MAX_FRAME_BYTES,
};
use fleetgate_core::DeviceConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Decodes control frames from `reader` until EOF. Malformed lines are
/// logged and skipped.
pub async fn read_control<R>(mut reader: R, tx: mpsc::Sender<ControlEnvelope>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = NdjsonFrameDecoder::<ControlEnvelope>::new(DEFAULT_MAX_FRAME_BYTES);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let (report, eof) = match reader.read(&mut buf).await {
            Ok(0) => (decoder.finish(), true),
            Ok(n) => (decoder.push_chunk(&buf[..n]), false),
            Err(err) => {
                warn!(event = "control_read_failed", error = %err);
                (decoder.finish(), true)
            }
        };
        for err in report.errors {
            warn!(event = "control_frame_invalid", error = %err);
        }
        for frame in report.frames {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
        if eof {
            return;
        }
    }
}

/// Serialises outbound messages onto `writer` until every sender is gone.
pub async fn write_reports<W>(mut writer: W, worker_id: u64, mut rx: mpsc::Receiver<ControlMsg>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let kind = msg.kind();
        let frame = match encode_outbound(worker_id, msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "control_encode_failed", kind, error = %err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).await {
            warn!(event = "control_write_failed", kind, error = %err);
            return;
        }
        if let Err(err) = writer.flush().await {
            warn!(event = "control_write_failed", kind, error = %err);
            return;
        }
    }
}

/// A report too large for one frame goes out without its image rather than
/// not at all.
fn encode_outbound(worker_id: u64, msg: ControlMsg) -> Result<Vec<u8>, FrameError> {
    let mut envelope = ControlEnvelope::new(worker_id, msg);
    let err = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
        Ok(frame) => return Ok(frame),
        Err(err @ FrameError::OversizedFrame { .. }) => err,
        Err(err) => return Err(err),
    };
    let ControlMsg::ReportState(state) = &mut envelope.msg else {
        return Err(err);
    };
    if state.image.take().is_none() {
        return Err(err);
    }
    warn!(event = "report_image_dropped", key = %state.key(), error = %err);
    encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker_id: u64,
    pub device: DeviceConfig,
    /// A command pushed before the assignment arrived.
    pub early_command: Option<String>,
}

/// Waits for `assign_device`. `None` when the channel closes first.
pub async fn wait_for_assignment(rx: &mut mpsc::Receiver<ControlEnvelope>) -> Option<Assignment> {
    let mut early_command = None;
    while let Some(envelope) = rx.recv().await {
        match envelope.msg {
            ControlMsg::AssignDevice(device) => {
                return Some(Assignment {
                    worker_id: envelope.worker_id,
                    device,
                    early_command,
                });
            }
            ControlMsg::PushCommand(payload) => {
                debug!(event = "command_before_assignment", command = %payload.command);
                early_command = Some(payload.command);
            }
            ControlMsg::ReportState(_) => {
                warn!(event = "control_unexpected", kind = "report_state");
            }
        }
    }
    None
}

/// Applies control messages after assignment until the channel closes.
pub async fn run_control(mut rx: mpsc::Receiver<ControlEnvelope>, ctx: &WorkerContext) {
    while let Some(envelope) = rx.recv().await {
        match envelope.msg {
            ControlMsg::PushCommand(payload) => ctx.push_command(payload.command).await,
            ControlMsg::AssignDevice(device) => {
                warn!(event = "reassignment_ignored", key = %device.key);
            }
            ControlMsg::ReportState(_) => {
                warn!(event = "control_unexpected", kind = "report_state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_core::control_ipc::{decode_frame, PushCommandPayload};
    use fleetgate_core::DeviceState;

    fn device() -> DeviceConfig {
        serde_json::from_value(serde_json::json!({"key": "barn", "port": 9100}))
            .expect("device config")
    }

    fn push(command: &str) -> ControlEnvelope {
        ControlEnvelope::new(
            4,
            ControlMsg::PushCommand(PushCommandPayload {
                command: command.to_string(),
            }),
        )
    }

    fn frame(envelope: &ControlEnvelope) -> Vec<u8> {
        encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode")
    }

    #[tokio::test]
    async fn reader_skips_garbage_and_flushes_unterminated_tail() {
        let mut input = frame(&ControlEnvelope::new(4, ControlMsg::AssignDevice(device())));
        input.extend_from_slice(b"{broken json\n");
        let tail = frame(&push("1=on"));
        input.extend_from_slice(&tail[..tail.len() - 1]);

        let (tx, mut rx) = mpsc::channel(8);
        read_control(input.as_slice(), tx).await;

        let first = rx.recv().await.expect("assign");
        assert!(matches!(first.msg, ControlMsg::AssignDevice(ref d) if d.key == "barn"));
        let second = rx.recv().await.expect("push");
        assert_eq!(second.msg, push("1=on").msg);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn assignment_keeps_latest_early_command() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(push("1=on")).await.expect("send");
        tx.send(push("1=off")).await.expect("send");
        tx.send(ControlEnvelope::new(9, ControlMsg::AssignDevice(device())))
            .await
            .expect("send");

        let assignment = wait_for_assignment(&mut rx).await.expect("assignment");
        assert_eq!(assignment.worker_id, 9);
        assert_eq!(assignment.device.port, 9100);
        assert_eq!(assignment.early_command.as_deref(), Some("1=off"));

        drop(tx);
        assert!(wait_for_assignment(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_report() {
        let (tx, rx) = mpsc::channel(8);
        let state = DeviceState::new(device());
        tx.send(ControlMsg::ReportState(state.clone()))
            .await
            .expect("send");
        tx.send(ControlMsg::ReportState(state.clone()))
            .await
            .expect("send");
        drop(tx);

        let mut out = Vec::new();
        write_reports(&mut out, 12, rx).await;

        let lines: Vec<&[u8]> = out.split(|b| *b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        let decoded: ControlEnvelope =
            decode_frame(lines[0], DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded.worker_id, 12);
        assert_eq!(decoded.msg, ControlMsg::ReportState(state));
    }

    #[tokio::test]
    async fn oversized_report_is_sent_without_its_image() {
        let mut state = DeviceState::new(device());
        state.image = Some("A".repeat(DEFAULT_MAX_FRAME_BYTES));
        let (tx, rx) = mpsc::channel(1);
        tx.send(ControlMsg::ReportState(state.clone()))
            .await
            .expect("send");
        drop(tx);

        let mut out = Vec::new();
        write_reports(&mut out, 5, rx).await;

        let decoded: ControlEnvelope = decode_frame(&out, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        state.image = None;
        assert_eq!(decoded.msg, ControlMsg::ReportState(state));
    }
}
