//! Fire-and-forget hand-off of admitted jobs to a worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::worker::{JobOutcome, PackJob, Worker};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("url cannot be passed to the worker: {0}")]
    UnsupportedUrl(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Starts a worker for an admitted job. Returning `Ok` only means the job
/// was handed over; its outcome is observed through the job record.
#[async_trait]
pub trait BuildDispatcher: Send + Sync {
    async fn dispatch(&self, job: PackJob) -> Result<(), DispatchError>;
}

/// Runs the worker as a task on the current runtime.
pub struct InProcessDispatcher {
    worker: Arc<Worker>,
}

impl InProcessDispatcher {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl BuildDispatcher for InProcessDispatcher {
    async fn dispatch(&self, job: PackJob) -> Result<(), DispatchError> {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let dest = job.dest.to_string();
            match worker.run(job).await {
                Ok(JobOutcome::Succeeded(_)) => log::info!("Job {} succeeded", dest),
                Ok(outcome) => log::debug!("Job {} not run: {:?}", dest, outcome),
                Err(err) => log::warn!("Job {} failed: {}", dest, err),
            }
        });
        Ok(())
    }
}

/// Spawns `<program> pack ...` as a detached child process.
pub struct CommandDispatcher {
    program: PathBuf,
}

impl CommandDispatcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The current executable, so `serve` hands jobs to its own `pack`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

/// Argument list of the `pack` subcommand for a job. The inline URL list is
/// passed comma-joined as the final positional argument.
pub fn command_args(job: &PackJob) -> Result<Vec<String>, DispatchError> {
    if let Some(url) = job.urls.iter().find(|url| url.contains(',')) {
        return Err(DispatchError::UnsupportedUrl(url.clone()));
    }

    let mut args = vec![
        "pack".to_string(),
        "--dest".to_string(),
        job.dest.to_string(),
    ];
    if let Some(domain) = job.domain.as_deref().filter(|d| !d.is_empty()) {
        args.push("--domain".to_string());
        args.push(domain.to_string());
    }
    if let Some(timeout) = job.timeout {
        args.push("--timeout".to_string());
        args.push(timeout.as_secs().to_string());
    }
    if let Some(source) = &job.source {
        args.push("--source".to_string());
        args.push(source.to_string());
    }
    if !job.urls.is_empty() {
        args.push(job.urls.join(","));
    }
    Ok(args)
}

#[async_trait]
impl BuildDispatcher for CommandDispatcher {
    async fn dispatch(&self, job: PackJob) -> Result<(), DispatchError> {
        let args = command_args(&job)?;
        let program = self.program.display().to_string();

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                program: program.clone(),
                source,
            })?;
        log::info!(
            "Dispatched {} to {} (pid {:?})",
            job.dest,
            program,
            child.id()
        );

        let dest = job.dest.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => log::debug!("Worker for {} exited", dest),
                Ok(status) => log::warn!("Worker for {} exited with {}", dest, status),
                Err(err) => log::warn!("Failed to wait for worker of {}: {}", dest, err),
            }
        });
        Ok(())
    }
}
