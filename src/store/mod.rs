//! Object storage with conditional writes.
//!
//! Job records, overflow source lists and finished archives all live in one
//! bucket. Mutual exclusion between admitters and between workers relies
//! entirely on the two preconditions this trait exposes: create-if-absent
//! and update-if-generation-matches. Implementations must enforce them
//! atomically; nothing above this layer re-checks them.

pub mod fs;
pub mod memory;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Metadata;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object name: {0}")]
    InvalidName(String),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("signing error: {0}")]
    Signing(String),
    #[error("lock timeout on {0}")]
    LockTimeout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StoreError::PreconditionFailed)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Attributes of a stored object. `generation` changes whenever the content
/// is rewritten; `metageneration` whenever only the metadata changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttrs {
    pub name: String,
    pub size: u64,
    pub generation: i64,
    pub metageneration: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    pub does_not_exist: bool,
    pub generation_match: Option<i64>,
    pub metageneration_match: Option<i64>,
}

impl Conditions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn does_not_exist() -> Self {
        Self {
            does_not_exist: true,
            ..Self::default()
        }
    }

    /// Matches exactly the version described by `attrs`.
    pub fn matching(attrs: &ObjectAttrs) -> Self {
        Self {
            does_not_exist: false,
            generation_match: Some(attrs.generation),
            metageneration_match: Some(attrs.metageneration),
        }
    }

    pub fn check(&self, current: Option<&ObjectAttrs>) -> Result<(), StoreError> {
        if self.does_not_exist && current.is_some() {
            return Err(StoreError::PreconditionFailed);
        }
        if let Some(generation) = self.generation_match {
            match current {
                Some(attrs) if attrs.generation == generation => {}
                _ => return Err(StoreError::PreconditionFailed),
            }
        }
        if let Some(metageneration) = self.metageneration_match {
            match current {
                Some(attrs) if attrs.metageneration == metageneration => {}
                _ => return Err(StoreError::PreconditionFailed),
            }
        }
        Ok(())
    }
}

pub enum ObjectBody {
    Bytes(Bytes),
    File(PathBuf),
}

impl ObjectBody {
    pub fn empty() -> Self {
        ObjectBody::Bytes(Bytes::new())
    }
}

/// `<scheme>://<bucket>/<name>`, the form objects are referenced by in
/// worker invocation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub scheme: String,
    pub bucket: String,
    pub name: String,
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.name)
    }
}

impl FromStr for ObjectLocation {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidLocation(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (bucket, name) = rest.split_once('/').ok_or_else(invalid)?;
        let name = name.trim_start_matches('/');
        if scheme.is_empty() || bucket.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            name: name.to_string(),
        })
    }
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    fn scheme(&self) -> &str;

    fn bucket(&self) -> &str;

    fn location(&self, name: &str) -> ObjectLocation {
        ObjectLocation {
            scheme: self.scheme().to_string(),
            bucket: self.bucket().to_string(),
            name: name.to_string(),
        }
    }

    /// Name of the object a location points at, if the location belongs to
    /// this store.
    fn object_name(&self, location: &ObjectLocation) -> Result<String, StoreError> {
        if location.scheme != self.scheme() || location.bucket != self.bucket() {
            return Err(StoreError::InvalidLocation(format!(
                "{location} (expected {}://{}/...)",
                self.scheme(),
                self.bucket()
            )));
        }
        Ok(location.name.clone())
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttrs>, StoreError>;

    /// Writes content and metadata together. Either both land or neither.
    async fn put(
        &self,
        name: &str,
        body: ObjectBody,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError>;

    /// Merges `metadata` into the object's metadata; keys not mentioned are
    /// kept.
    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError>;

    async fn read(&self, name: &str) -> Result<ByteStream, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Short-lived URL granting read access to one object.
    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<String, StoreError>;
}

pub(crate) fn validate_object_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(generation: i64, metageneration: i64) -> ObjectAttrs {
        ObjectAttrs {
            name: "a.zip".to_string(),
            size: 0,
            generation,
            metageneration,
            metadata: Metadata::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn does_not_exist_condition() {
        let cond = Conditions::does_not_exist();
        assert!(cond.check(None).is_ok());
        assert!(cond.check(Some(&attrs(1, 1))).unwrap_err().is_precondition_failed());
    }

    #[test]
    fn generation_condition() {
        let current = attrs(7, 2);
        let cond = Conditions::matching(&current);
        assert!(cond.check(Some(&current)).is_ok());
        assert!(cond.check(Some(&attrs(7, 3))).is_err());
        assert!(cond.check(Some(&attrs(8, 2))).is_err());
        assert!(cond.check(None).is_err());
        assert!(Conditions::none().check(None).is_ok());
    }

    #[test]
    fn location_round_trip() {
        let location: ObjectLocation = "fs://packs/abc.zip".parse().unwrap();
        assert_eq!(location.scheme, "fs");
        assert_eq!(location.bucket, "packs");
        assert_eq!(location.name, "abc.zip");
        assert_eq!(location.to_string(), "fs://packs/abc.zip");

        assert!("packs/abc.zip".parse::<ObjectLocation>().is_err());
        assert!("fs://packs".parse::<ObjectLocation>().is_err());
        assert!("fs:///abc.zip".parse::<ObjectLocation>().is_err());
    }

    #[test]
    fn object_names_are_flat() {
        assert!(validate_object_name("0f3a.zip").is_ok());
        assert!(validate_object_name("a-b_c.txt").is_ok());
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name(".hidden").is_err());
        assert!(validate_object_name("../etc/passwd").is_err());
        assert!(validate_object_name("a/b").is_err());
    }
}
