//! The audit recorder: a bounded queue in front of the durable store.
//!
//! The bridge hands records to [`AuditRecorder::record`], which never
//! blocks: records go into a bounded channel and a worker task writes them.
//! A failed insert is retried once after a short delay, then dropped with
//! an error log and a counter bump. Losing an audit row under sustained
//! store failure is the accepted trade for never stalling request handling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use switchboard_types::messages::AuditRecord;
use switchboard_types::traits::{AuditSink, AuditStore};

/// Default queue depth between the bridge and the store worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Non-blocking front for audit persistence.
pub struct AuditRecorder {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
}

impl AuditRecorder {
    /// Spawn the store worker and return the recorder plus its handle.
    ///
    /// The worker exits when the recorder (and every clone of its sender)
    /// is dropped, after draining the queue.
    pub fn spawn(store: Arc<dyn AuditStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let worker_dropped = Arc::clone(&dropped);

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(first) = store.insert(&record).await {
                    warn!(record_id = %record.id, error = %first, "audit insert failed, retrying once");
                    tokio::time::sleep(RETRY_DELAY).await;
                    if let Err(second) = store.insert(&record).await {
                        worker_dropped.fetch_add(1, Ordering::Relaxed);
                        error!(
                            record_id = %record.id,
                            user = %record.user_id,
                            error = %second,
                            "audit record dropped after retry"
                        );
                    }
                }
            }
        });

        (Self { tx, dropped }, handle)
    }

    /// Records lost to a full queue or a persistently failing store.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for AuditRecorder {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "audit queue full, record dropped");
        }
    }
}
