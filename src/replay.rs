//! Offline replayer: periodically sweeps the durable store, oldest record
//! first, and re-uploads through the same compressed-POST path as live
//! batches. A record is deleted only after the server's explicit 201.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{OfflineStore, StoreError};
use crate::upload::{compress_envelope, BatchSender};

const PER_FILE_PACING: Duration = Duration::from_secs(1);

pub struct OfflineReplayer {
    store: Arc<OfflineStore>,
    sender: Arc<dyn BatchSender>,
    period: Duration,
    file_retry_cap: u32,
    /// Consecutive failed sweeps per record; past the cap the file is
    /// skipped so one bad record cannot block the queue head.
    failures: HashMap<PathBuf, u32>,
    /// Zero-byte files seen once get a grace sweep before deletion; a
    /// writer may still be flushing them.
    zero_byte_seen: HashSet<PathBuf>,
}

impl OfflineReplayer {
    pub fn new(
        store: Arc<OfflineStore>,
        sender: Arc<dyn BatchSender>,
        period: Duration,
        file_retry_cap: u32,
    ) -> Self {
        Self {
            store,
            sender,
            period,
            file_retry_cap,
            failures: HashMap::new(),
            zero_byte_seen: HashSet::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(period_s = self.period.as_secs(), "offline replayer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {
                    self.sweep(&cancel).await;
                }
            }
        }
        debug!("offline replayer stopped");
    }

    pub async fn sweep(&mut self, cancel: &CancellationToken) {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not list offline records");
                return;
            }
        };
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "replaying offline records");

        // Forget bookkeeping for records that no longer exist.
        self.failures.retain(|path, _| records.contains(path));
        self.zero_byte_seen.retain(|path| records.contains(path));

        let total = records.len();
        for (index, path) in records.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return;
            }
            self.replay_one(path).await;
            if index + 1 < total {
                // Pace the link between files.
                tokio::time::sleep(PER_FILE_PACING).await;
            }
        }
    }

    async fn replay_one(&mut self, path: PathBuf) {
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            if self.zero_byte_seen.remove(&path) {
                // Still empty a sweep later: nothing will ever fill it in.
                warn!(path = %path.display(), "deleting zero-byte offline record");
                if let Err(e) = self.store.delete(&path) {
                    warn!(error = %e, "could not delete zero-byte record");
                }
            } else {
                self.zero_byte_seen.insert(path);
            }
            return;
        }

        let fail_count = self.failures.get(&path).copied().unwrap_or(0);
        if fail_count >= self.file_retry_cap {
            debug!(path = %path.display(), fail_count, "skipping record past its retry cap");
            return;
        }

        let envelope = match self.store.read(&path) {
            Ok(envelope) => envelope,
            Err(StoreError::Malformed(e)) => {
                warn!(path = %path.display(), error = %e, "unparseable offline record");
                if let Err(e) = self.store.quarantine(&path) {
                    warn!(error = %e, "quarantine failed");
                }
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read offline record");
                return;
            }
        };

        let body = match compress_envelope(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not compress offline record");
                return;
            }
        };

        // No recursive deferral: a failed replay leaves the record on disk
        // for the next sweep.
        match self.sender.send_compressed(body).await {
            Ok(()) => {
                info!(path = %path.display(), points = envelope.payload.len(),
                    "offline record delivered");
                if let Err(e) = self.store.delete(&path) {
                    warn!(error = %e, "delivered record could not be deleted");
                }
                self.failures.remove(&path);
            }
            Err(e) => {
                let count = self.failures.entry(path.clone()).or_insert(0);
                *count += 1;
                warn!(path = %path.display(), error = %e, failures = *count,
                    "offline replay failed, record kept");
            }
        }
    }
}
