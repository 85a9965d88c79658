//! Entry accounting for a running pack job and the heartbeat that persists
//! it into the job record.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{with_progress, Metadata};
use crate::store::{Conditions, ObjectStore};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.processed as f64 / self.total as f64)
    }
}

/// Shared between the merge (writer) and the heartbeat (reader).
#[derive(Debug, Default)]
pub struct ProgressCounters {
    inner: Mutex<ProgressSnapshot>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_total(&self, entries: u64) {
        let mut counts = self.lock();
        counts.total = counts.total.saturating_add(entries);
    }

    /// Counts one entry as handled. Never moves past `total`.
    pub fn record_processed(&self) {
        let mut counts = self.lock();
        if counts.processed < counts.total {
            counts.processed += 1;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodic progress writer for one job record.
///
/// Every write is made while holding the finish gate and only while the
/// gate's flag is unset. [`Heartbeat::finish`] sets the flag and hands the
/// gate to the caller, who keeps it for the duration of the terminal write.
pub struct Heartbeat {
    gate: Arc<AsyncMutex<bool>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn(
        store: Arc<dyn ObjectStore>,
        object: String,
        base_metadata: Metadata,
        counters: Arc<ProgressCounters>,
        interval: Duration,
    ) -> Self {
        let gate = Arc::new(AsyncMutex::new(false));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat(
            store,
            object,
            base_metadata,
            counters,
            interval,
            gate.clone(),
            cancel.clone(),
        ));

        Self {
            gate,
            cancel,
            task: Some(task),
        }
    }

    /// Stops the heartbeat. The returned guard blocks any further heartbeat
    /// write until it is dropped, and after that every write is a no-op.
    pub async fn finish(mut self) -> OwnedMutexGuard<bool> {
        let mut guard = self.gate.clone().lock_owned().await;
        *guard = true;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        guard
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_heartbeat(
    store: Arc<dyn ObjectStore>,
    object: String,
    base_metadata: Metadata,
    counters: Arc<ProgressCounters>,
    interval: Duration,
    gate: Arc<AsyncMutex<bool>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let finished = gate.lock().await;
        if *finished {
            break;
        }

        let snapshot = counters.snapshot();
        let metadata = with_progress(base_metadata.clone(), snapshot.processed, snapshot.total);
        if let Err(err) = store
            .update_metadata(&object, metadata, Conditions::none())
            .await
        {
            log::warn!("Heartbeat update for {} failed: {}", object, err);
        } else {
            log::debug!(
                "Heartbeat {}: {}/{} entries",
                object,
                snapshot.processed,
                snapshot.total
            );
        }
        drop(finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{status_metadata, JobStatus, PROCESSED_KEY, TOTAL_KEY};
    use crate::store::{MemoryObjectStore, ObjectBody};

    #[test]
    fn processed_is_clamped_to_total() {
        let counters = ProgressCounters::new();
        counters.record_processed();
        assert_eq!(counters.snapshot(), ProgressSnapshot::default());

        counters.add_total(2);
        counters.record_processed();
        counters.record_processed();
        counters.record_processed();
        assert_eq!(
            counters.snapshot(),
            ProgressSnapshot {
                processed: 2,
                total: 2
            }
        );
        assert_eq!(counters.snapshot().fraction(), Some(1.0));
        assert_eq!(ProgressSnapshot::default().fraction(), None);
    }

    async fn seeded_store() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        store
            .put(
                "job.zip",
                ObjectBody::empty(),
                status_metadata(JobStatus::Processing),
                Conditions::none(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_writes_progress_until_finished() {
        let store = seeded_store().await;
        let counters = Arc::new(ProgressCounters::new());
        counters.add_total(4);
        counters.record_processed();

        let heartbeat = Heartbeat::spawn(
            store.clone(),
            "job.zip".to_string(),
            status_metadata(JobStatus::Processing),
            counters.clone(),
            Duration::from_secs(5),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        let attrs = store.stat("job.zip").await.unwrap().unwrap();
        assert_eq!(attrs.metadata.get(TOTAL_KEY).unwrap(), "4");
        assert_eq!(attrs.metadata.get(PROCESSED_KEY).unwrap(), "1");

        let guard = heartbeat.finish().await;
        let metageneration = store.stat("job.zip").await.unwrap().unwrap().metageneration;
        counters.record_processed();
        drop(guard);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let attrs = store.stat("job.zip").await.unwrap().unwrap();
        assert_eq!(attrs.metageneration, metageneration);
        assert_eq!(attrs.metadata.get(PROCESSED_KEY).unwrap(), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_does_not_write_before_first_interval() {
        let store = seeded_store().await;
        let before = store.stat("job.zip").await.unwrap().unwrap();

        let heartbeat = Heartbeat::spawn(
            store.clone(),
            "job.zip".to_string(),
            status_metadata(JobStatus::Processing),
            Arc::new(ProgressCounters::new()),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(heartbeat.finish().await);

        let after = store.stat("job.zip").await.unwrap().unwrap();
        assert_eq!(before.metageneration, after.metageneration);
    }
}
