use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{
    validate_object_name, ByteStream, Conditions, ObjectAttrs, ObjectBody, ObjectStore, StoreError,
};
use crate::job::Metadata;
use crate::signing::UrlSigner;

pub const FS_SCHEME: &str = "fs";

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const LOCKS_DIR: &str = "locks";
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Directory-backed bucket shared by the API server and worker processes.
///
/// Layout under `<root>/<bucket>/`:
/// - `objects/<name>`: content
/// - `meta/<name>.json`: [`ObjectAttrs`]
/// - `locks/<name>.lock`: per-object lock, created with `O_EXCL`
///
/// Conditions are evaluated while holding the lock file, so they hold across
/// processes sharing the directory. Content is staged in a temp sibling
/// before the lock is taken; the lock only covers the condition check and
/// the renames, so it is never held for the duration of a large copy. Attrs
/// are written last, so an object only becomes visible once its content is
/// complete.
pub struct FsObjectStore {
    bucket: String,
    bucket_dir: PathBuf,
    signer: Option<Arc<UrlSigner>>,
}

/// A held lock file. The file carries a random token so that a holder whose
/// lock was broken as stale never removes the lock of the next holder.
struct ObjectLock {
    path: PathBuf,
    token: String,
}

impl ObjectLock {
    fn still_held(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .map(|contents| contents == self.token)
            .unwrap_or(false)
    }
}

impl Drop for ObjectLock {
    fn drop(&mut self) {
        if !self.still_held() {
            log::warn!("Lock {} was taken over; leaving it", self.path.display());
            return;
        }
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to release lock {}: {error}", self.path.display());
            }
        }
    }
}

/// Content written to a temp sibling, waiting to be renamed into place.
struct StagedData {
    temp_path: PathBuf,
    size: u64,
}

impl StagedData {
    async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.temp_path).await;
    }
}

impl FsObjectStore {
    pub fn open(root: impl AsRef<Path>, bucket: impl Into<String>) -> io::Result<Self> {
        let bucket = bucket.into();
        validate_object_name(&bucket)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let bucket_dir = root.as_ref().join(&bucket);
        for dir in [OBJECTS_DIR, META_DIR, LOCKS_DIR] {
            std::fs::create_dir_all(bucket_dir.join(dir))?;
        }
        Ok(Self {
            bucket,
            bucket_dir,
            signer: None,
        })
    }

    pub fn with_signer(mut self, signer: Arc<UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.bucket_dir.join(OBJECTS_DIR).join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.bucket_dir.join(META_DIR).join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.bucket_dir.join(LOCKS_DIR).join(format!("{name}.lock"))
    }

    async fn lock(&self, name: &str) -> Result<ObjectLock, StoreError> {
        let path = self.lock_path(name);
        let token = format!("{}:{:016x}", std::process::id(), rand::random::<u64>());
        let deadline = Instant::now() + LOCK_WAIT;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let written = match file.write_all(token.as_bytes()).await {
                        Ok(()) => file.flush().await,
                        Err(error) => Err(error),
                    };
                    if let Err(error) = written {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(error.into());
                    }
                    return Ok(ObjectLock { path, token });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        log::warn!("Breaking stale lock {}", path.display());
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(name.to_string()));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn read_attrs(&self, name: &str) -> Result<Option<ObjectAttrs>, StoreError> {
        match tokio::fs::read(self.meta_path(name)).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write_attrs(&self, attrs: &ObjectAttrs) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(attrs)?;
        let meta_path = self.meta_path(&attrs.name);
        let temp_path = temp_sibling(&meta_path);
        tokio::fs::write(&temp_path, contents).await?;
        if let Err(error) = tokio::fs::rename(&temp_path, &meta_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error.into());
        }
        Ok(())
    }

    async fn stage_data(&self, name: &str, body: ObjectBody) -> Result<StagedData, StoreError> {
        let temp_path = temp_sibling(&self.data_path(name));

        let written = match body {
            ObjectBody::Bytes(bytes) => write_bytes(&temp_path, &bytes).await,
            ObjectBody::File(source) => tokio::fs::copy(&source, &temp_path).await,
        };
        match written {
            Ok(size) => Ok(StagedData { temp_path, size }),
            Err(error) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(error.into())
            }
        }
    }

    async fn commit_data(&self, name: &str, staged: StagedData) -> Result<u64, StoreError> {
        if let Err(error) = tokio::fs::rename(&staged.temp_path, self.data_path(name)).await {
            staged.discard().await;
            return Err(error.into());
        }
        Ok(staged.size)
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    fn scheme(&self) -> &str {
        FS_SCHEME
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttrs>, StoreError> {
        validate_object_name(name)?;
        self.read_attrs(name).await
    }

    async fn put(
        &self,
        name: &str,
        body: ObjectBody,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError> {
        validate_object_name(name)?;
        let staged = self.stage_data(name, body).await?;
        let _lock = match self.lock(name).await {
            Ok(lock) => lock,
            Err(error) => {
                staged.discard().await;
                return Err(error);
            }
        };

        let current = match self.read_attrs(name).await {
            Ok(current) => current,
            Err(error) => {
                staged.discard().await;
                return Err(error);
            }
        };
        if let Err(error) = conditions.check(current.as_ref()) {
            staged.discard().await;
            return Err(error);
        }

        let size = self.commit_data(name, staged).await?;
        let now = Utc::now();
        let previous_generation = current.map(|attrs| attrs.generation).unwrap_or(0);
        let attrs = ObjectAttrs {
            name: name.to_string(),
            size,
            generation: now.timestamp_micros().max(previous_generation + 1),
            metageneration: 1,
            metadata,
            updated_at: now,
        };
        self.write_attrs(&attrs).await?;
        Ok(attrs)
    }

    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError> {
        validate_object_name(name)?;
        let _lock = self.lock(name).await?;

        let mut attrs = self
            .read_attrs(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        conditions.check(Some(&attrs))?;

        attrs.metadata.extend(metadata);
        attrs.metageneration += 1;
        attrs.updated_at = Utc::now();
        self.write_attrs(&attrs).await?;
        Ok(attrs)
    }

    async fn read(&self, name: &str) -> Result<ByteStream, StoreError> {
        validate_object_name(name)?;
        if self.read_attrs(name).await?.is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let file = match tokio::fs::File::open(self.data_path(name)).await {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(error) => return Err(error.into()),
        };
        Ok(Box::pin(ReaderStream::with_capacity(file, READ_BUFFER_SIZE)))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_object_name(name)?;
        let _lock = self.lock(name).await?;

        match tokio::fs::remove_file(self.meta_path(name)).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(error) => return Err(error.into()),
        }
        match tokio::fs::remove_file(self.data_path(name)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<String, StoreError> {
        validate_object_name(name)?;
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| StoreError::Signing("no url signer configured".to_string()))?;
        Ok(signer.sign(name, ttl))
    }
}

async fn write_bytes(path: &Path, bytes: &Bytes) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(bytes.len() as u64)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{:016x}.tmp", rand::random::<u64>()))
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}
