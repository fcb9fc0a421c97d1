//! Bounded write-behind queue in front of the telemetry store.
//!
//! One blocking thread owns the store. Producers never wait: a full queue
//! drops the record and counts it.

use fleetgate_core::{Detection, TelemetryRecord};
use fleetgate_storage::TelemetryStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistJob {
    Telemetry(TelemetryRecord),
    Detection(Detection),
}

impl PersistJob {
    fn kind(&self) -> &'static str {
        match self {
            PersistJob::Telemetry(_) => "telemetry",
            PersistJob::Detection(_) => "detection",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<Counters>,
}

impl PersistQueue {
    /// Starts the writer. The returned handle resolves once every sender is
    /// gone and the queue has drained.
    pub fn spawn<S>(store: S, capacity: usize) -> (Self, JoinHandle<PersistStats>)
    where
        S: TelemetryStore + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<PersistJob>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let writer_counters = counters.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let kind = job.kind();
                let result = match &job {
                    PersistJob::Telemetry(record) => store.append(record),
                    PersistJob::Detection(detection) => store.append_detection(detection),
                };
                match result {
                    Ok(()) => {
                        writer_counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        let failed = writer_counters.failed.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(event = "persist_failed", kind, failed, error = %err);
                    }
                }
            }
            snapshot(&writer_counters)
        });

        (Self { tx, counters }, handle)
    }

    /// Never blocks. Returns false when the job was not queued.
    pub fn enqueue(&self, job: PersistJob) -> bool {
        let kind = job.kind();
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(event = "persist_queue_full", kind, dropped);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(event = "persist_queue_closed", kind);
                false
            }
        }
    }

    pub fn stats(&self) -> PersistStats {
        snapshot(&self.counters)
    }
}

fn snapshot(counters: &Counters) -> PersistStats {
    PersistStats {
        written: counters.written.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
    }
}
