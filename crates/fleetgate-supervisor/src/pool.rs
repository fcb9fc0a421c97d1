//! Worker processes: launch, feed, watch, replace.

use crate::fleet::{FleetState, WorkerHandle, WorkerId};
use anyhow::{Context, Result};
use fleetgate_core::control_ipc::{
    encode_frame, ControlEnvelope, ControlMsg, NdjsonFrameDecoder, DEFAULT_MAX_FRAME_BYTES,
};
use fleetgate_core::DeviceConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const CONTROL_QUEUE: usize = 64;
const READ_CHUNK_BYTES: usize = 64 * 1024;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
/// A worker that lived this long resets the backoff.
const HEALTHY_UPTIME: Duration = Duration::from_secs(30);
const REPORT_DRAIN: Duration = Duration::from_secs(1);

/// How to start a worker. Every worker gets the same `args`, followed by
/// `--device-key <key>`.
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    next_id: AtomicU64,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn spawn(&self, device: &DeviceConfig) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--device-key")
            .arg(&device.key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))
    }
}

/// Keeps one worker alive for `device` until `shutdown` flips to true.
pub async fn supervise_device(
    fleet: Arc<FleetState>,
    launcher: Arc<WorkerLauncher>,
    device: DeviceConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let started = Instant::now();
        match run_worker(&fleet, &launcher, &device, &mut shutdown).await {
            Ok(Some(status)) => {
                warn!(event = "worker_exited", key = %device.key, status = %status);
            }
            Ok(None) => break,
            Err(err) => {
                error!(event = "worker_launch_failed", key = %device.key, error = %err);
            }
        }

        if started.elapsed() >= HEALTHY_UPTIME {
            backoff = INITIAL_BACKOFF;
        }
        info!(
            event = "worker_respawn_scheduled",
            key = %device.key,
            backoff_ms = backoff.as_millis() as u64
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = next_backoff(backoff);
    }
    debug!(event = "supervision_stopped", key = %device.key);
}

/// Runs one worker to completion. `Ok(None)` means we stopped it for shutdown.
async fn run_worker(
    fleet: &Arc<FleetState>,
    launcher: &WorkerLauncher,
    device: &DeviceConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<String>> {
    let worker_id = launcher.next_worker_id();
    let mut child = launcher.spawn(device)?;
    let stdin = child.stdin.take().context("worker stdin not piped")?;
    let stdout = child.stdout.take().context("worker stdout not piped")?;

    let (control_tx, control_rx) = mpsc::channel::<ControlMsg>(CONTROL_QUEUE);
    let writer = tokio::spawn(write_control(stdin, worker_id, control_rx));
    let reader = tokio::spawn(read_reports(stdout, fleet.clone(), worker_id));

    control_tx
        .send(ControlMsg::AssignDevice(device.clone()))
        .await
        .context("worker control channel closed before assignment")?;
    let held = fleet
        .attach_worker(
            device.port,
            WorkerHandle {
                worker_id,
                control: control_tx.clone(),
            },
        )
        .await;
    info!(
        event = "worker_assigned",
        worker_id = %worker_id,
        key = %device.key,
        port = device.port,
        pid = child.id().unwrap_or_default()
    );
    if let Some(command) = held {
        info!(event = "held_command_flushed", worker_id = %worker_id, command = %command);
    }
    drop(control_tx);

    let outcome = tokio::select! {
        status = child.wait() => {
            Some(match status {
                Ok(status) => status.to_string(),
                Err(err) => format!("wait failed: {err}"),
            })
        }
        _ = shutdown.changed() => {
            if let Err(err) = child.kill().await {
                warn!(event = "worker_kill_failed", worker_id = %worker_id, error = %err);
            }
            None
        }
    };

    fleet.detach_worker(device.port, worker_id).await;
    writer.abort();
    // A grandchild may still hold the pipe open.
    let mut reader = reader;
    if tokio::time::timeout(REPORT_DRAIN, &mut reader).await.is_err() {
        reader.abort();
    }
    Ok(outcome)
}

async fn write_control<W>(mut stdin: W, worker_id: WorkerId, mut rx: mpsc::Receiver<ControlMsg>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let kind = msg.kind();
        let envelope = ControlEnvelope::new(worker_id.0, msg);
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "control_encode_failed", worker_id = %worker_id, kind, error = %err);
                continue;
            }
        };
        if let Err(err) = stdin.write_all(&frame).await {
            warn!(event = "control_write_failed", worker_id = %worker_id, kind, error = %err);
            return;
        }
        let _ = stdin.flush().await;
    }
}

/// Applies every `report_state` from a worker's stdout until EOF.
pub async fn read_reports<R>(mut stdout: R, fleet: Arc<FleetState>, worker_id: WorkerId)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = NdjsonFrameDecoder::<ControlEnvelope>::new(DEFAULT_MAX_FRAME_BYTES);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let (report, eof) = match stdout.read(&mut buf).await {
            Ok(0) => (decoder.finish(), true),
            Ok(n) => (decoder.push_chunk(&buf[..n]), false),
            Err(err) => {
                warn!(event = "worker_read_failed", worker_id = %worker_id, error = %err);
                (decoder.finish(), true)
            }
        };
        for err in report.errors {
            warn!(event = "worker_frame_invalid", worker_id = %worker_id, error = %err);
        }
        for envelope in report.frames {
            match envelope.msg {
                ControlMsg::ReportState(state) => {
                    fleet.apply_report(worker_id, state).await;
                }
                other => {
                    warn!(event = "worker_frame_unexpected", worker_id = %worker_id, kind = other.kind());
                }
            }
        }
        if eof {
            return;
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_core::DeviceState;

    #[test]
    fn backoff_doubles_up_to_ten_seconds() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn worker_ids_increase_per_launch() {
        let launcher = WorkerLauncher::new("fleetgate-worker", Vec::new());
        assert_eq!(launcher.next_worker_id(), WorkerId(1));
        assert_eq!(launcher.next_worker_id(), WorkerId(2));
    }

    #[tokio::test]
    async fn reports_from_stdout_update_the_registry() {
        let device: DeviceConfig =
            serde_json::from_value(serde_json::json!({"key": "A", "port": 9001}))
                .expect("device");
        let fleet = Arc::new(FleetState::new(vec![device.clone()], false));

        let mut state = DeviceState::new(device);
        state.image = Some("aW1n".to_string());
        let mut stream = encode_frame(
            &ControlEnvelope::new(3, ControlMsg::ReportState(state.clone())),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        stream.extend_from_slice(b"garbage line\n");

        read_reports(stream.as_slice(), fleet.clone(), WorkerId(3)).await;
        assert_eq!(fleet.device_state("A").await, Some(state));
    }
}
