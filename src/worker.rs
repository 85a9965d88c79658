//! The pack worker: claims an accepted job record, builds the archive and
//! records the outcome.
//!
//! A job record moves `accepted -> processing -> succeeded | failed`. The
//! claim is a metadata update conditioned on the generation and
//! metageneration just read, so among concurrent workers exactly one gets
//! past it; the rest exit without writing anything.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::archive::{PackSummary, Packer};
use crate::error::PackError;
use crate::job::{raw_status, status_metadata_since, timestamp_now, with_progress, JobStatus};
use crate::progress::{Heartbeat, ProgressCounters, DEFAULT_HEARTBEAT_INTERVAL};
use crate::store::{Conditions, ObjectBody, ObjectLocation, ObjectStore};

pub const DEFAULT_PACK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Parameters of one worker invocation, as handed over by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackJob {
    pub dest: ObjectLocation,
    pub source: Option<ObjectLocation>,
    pub domain: Option<String>,
    pub timeout: Option<Duration>,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub cache_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub default_timeout: Duration,
    pub client: reqwest::Client,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("citypack-cache"),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            default_timeout: DEFAULT_PACK_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(PackSummary),
    /// The record was not in `accepted` state.
    Skipped { status: String },
    /// Another worker claimed the record first.
    ClaimLost,
}

pub struct Worker {
    store: Arc<dyn ObjectStore>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(store: Arc<dyn ObjectStore>, settings: WorkerSettings) -> Self {
        Self { store, settings }
    }

    /// Runs one job to completion. An `Err` after a successful claim means a
    /// `failed` status has been written (or the write was attempted and
    /// logged). Errors before the claim leave the record untouched.
    pub async fn run(&self, job: PackJob) -> Result<JobOutcome, PackError> {
        let dest = self
            .store
            .object_name(&job.dest)
            .map_err(|err| PackError::InvalidLocation(err.to_string()))?;
        let source = job
            .source
            .as_ref()
            .map(|location| self.store.object_name(location))
            .transpose()
            .map_err(|err| PackError::InvalidLocation(err.to_string()))?;

        let timeout = job
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.settings.default_timeout);
        log::info!("Packing {} (timeout {:?})", job.dest, timeout);

        let attrs = self
            .store
            .stat(&dest)
            .await
            .map_err(|err| PackError::store("failed to read job record", err))?
            .ok_or(PackError::NotFound)?;

        let status = raw_status(&attrs.metadata);
        if status != JobStatus::Accepted.as_str() {
            log::info!("Skipped {}: already exists (status={})", dest, status);
            return Ok(JobOutcome::Skipped {
                status: status.to_string(),
            });
        }

        let started_at = timestamp_now();
        if let Err(err) = self
            .store
            .update_metadata(
                &dest,
                status_metadata_since(JobStatus::Processing, &started_at),
                Conditions::matching(&attrs),
            )
            .await
        {
            if err.is_precondition_failed() {
                log::info!("Skipped {}: someone else is processing", dest);
                return Ok(JobOutcome::ClaimLost);
            }
            // Ownership is unknown here, so the record is left alone.
            log::error!("Failed to claim {}: {}", dest, err);
            return Err(PackError::store("failed to claim job", err));
        }

        let counters = Arc::new(ProgressCounters::new());
        let heartbeat = Heartbeat::spawn(
            self.store.clone(),
            dest.clone(),
            status_metadata_since(JobStatus::Processing, &started_at),
            counters.clone(),
            self.settings.heartbeat_interval,
        );

        let built = self
            .build(&job, source.as_deref(), counters.clone(), timeout)
            .await;

        // Held until the terminal write returns.
        let _finished = heartbeat.finish().await;

        let (summary, scratch) = match built {
            Ok(built) => built,
            Err(err) => {
                log::error!("Pack {} failed: {}", dest, err);
                self.mark_failed(&dest, &started_at).await;
                return Err(err);
            }
        };

        let snapshot = counters.snapshot();
        let metadata = with_progress(
            status_metadata_since(JobStatus::Succeeded, &started_at),
            snapshot.processed,
            snapshot.total,
        );
        let uploaded = self
            .store
            .put(
                &dest,
                ObjectBody::File(scratch.path().to_path_buf()),
                metadata,
                Conditions::none(),
            )
            .await;

        match uploaded {
            Ok(attrs) => {
                log::info!(
                    "Packed {} ({} entries written, {} skipped, {} bytes)",
                    dest,
                    summary.entries.written,
                    summary.entries.skipped,
                    attrs.size
                );
                Ok(JobOutcome::Succeeded(summary))
            }
            Err(err) => {
                let err = PackError::store("failed to upload archive", err);
                log::error!("Pack {} failed: {}", dest, err);
                self.mark_failed(&dest, &started_at).await;
                Err(err)
            }
        }
    }

    /// Resolves sources and merges them, bounded by `timeout`.
    async fn build(
        &self,
        job: &PackJob,
        source: Option<&str>,
        counters: Arc<ProgressCounters>,
        timeout: Duration,
    ) -> Result<(PackSummary, tempfile::NamedTempFile), PackError> {
        tokio::fs::create_dir_all(&self.settings.cache_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(".citypack-")
            .suffix(".zip")
            .tempfile_in(&self.settings.cache_dir)?;

        // Blocking merge work outlives the future dropped by the deadline;
        // the guard tells it to stop as soon as this function returns.
        let cancel = CancellationToken::new();
        let _stop_merge = cancel.clone().drop_guard();

        let packer = Packer::new(
            self.settings.client.clone(),
            self.settings.cache_dir.clone(),
            job.domain.clone(),
            counters,
            cancel,
        );

        let work = async {
            let urls = resolve_urls(self.store.as_ref(), &job.urls, source).await?;
            log::info!("Resolved {} urls", urls.len());
            for url in &urls {
                log::debug!("  {}", url);
            }
            packer.pack(&urls, scratch.path()).await
        };

        let summary = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| PackError::Timeout(timeout))??;
        Ok((summary, scratch))
    }

    /// Writes the `failed` status. Runs without a deadline; a failure here is
    /// only logged.
    async fn mark_failed(&self, dest: &str, started_at: &str) {
        if let Err(err) = self
            .store
            .update_metadata(
                dest,
                status_metadata_since(JobStatus::Failed, started_at),
                Conditions::none(),
            )
            .await
        {
            log::error!(
                "Failed to update status of {} (to={}): {}",
                dest,
                JobStatus::Failed,
                err
            );
        }
    }
}

/// The inline list when there is no overflow object, otherwise the overflow
/// object's non-blank lines.
pub async fn resolve_urls(
    store: &dyn ObjectStore,
    inline: &[String],
    source: Option<&str>,
) -> Result<Vec<String>, PackError> {
    let Some(source) = source else {
        return Ok(inline.to_vec());
    };

    let stream = store
        .read(source)
        .await
        .map_err(|err| PackError::store("failed to open source list", err))?;
    let reader = StreamReader::new(stream);
    let mut lines = tokio::io::BufReader::new(reader).lines();

    let mut urls = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        urls.push(line.to_string());
    }
    Ok(urls)
}
