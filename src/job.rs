//! Job record status and the metadata fields stored alongside the archive.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const STATUS_KEY: &str = "status";
pub const STARTED_AT_KEY: &str = "startedAt";
pub const TOTAL_KEY: &str = "total";
pub const PROCESSED_KEY: &str = "processed";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Accepted,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

pub fn status_metadata(status: JobStatus) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(STATUS_KEY.to_string(), status.as_str().to_string());
    metadata
}

pub fn status_metadata_since(status: JobStatus, started_at: &str) -> Metadata {
    let mut metadata = status_metadata(status);
    metadata.insert(STARTED_AT_KEY.to_string(), started_at.to_string());
    metadata
}

pub fn with_progress(mut metadata: Metadata, processed: u64, total: u64) -> Metadata {
    metadata.insert(TOTAL_KEY.to_string(), total.to_string());
    metadata.insert(PROCESSED_KEY.to_string(), processed.to_string());
    metadata
}

/// Raw status string as stored; may be absent or unknown on foreign objects.
pub fn raw_status(metadata: &Metadata) -> &str {
    metadata.get(STATUS_KEY).map(String::as_str).unwrap_or("")
}

/// `processed / total`, when both fields are present, parse and total is non-zero.
pub fn progress_of(metadata: &Metadata) -> Option<f64> {
    let total: u64 = metadata.get(TOTAL_KEY)?.parse().ok()?;
    let processed: u64 = metadata.get(PROCESSED_KEY)?.parse().ok()?;
    if total == 0 {
        return None;
    }
    Some(processed as f64 / total as f64)
}

/// Current time in the format persisted under `startedAt`.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
