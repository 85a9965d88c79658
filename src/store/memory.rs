use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use super::{
    validate_object_name, ByteStream, Conditions, ObjectAttrs, ObjectBody, ObjectStore, StoreError,
};
use crate::job::Metadata;
use crate::signing::UrlSigner;

pub const MEMORY_SCHEME: &str = "mem";

struct StoredObject {
    attrs: ObjectAttrs,
    data: Bytes,
}

/// Process-local store. Conditions are checked and applied under one lock,
/// so it gives the same guarantees as a remote store within a process.
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    next_generation: AtomicI64,
    signer: Option<Arc<UrlSigner>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
            next_generation: AtomicI64::new(1),
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<UrlSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Content of an object, if present.
    pub fn object_bytes(&self, name: &str) -> Option<Bytes> {
        self.lock().get(name).map(|object| object.data.clone())
    }

    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttrs>, StoreError> {
        validate_object_name(name)?;
        Ok(self.lock().get(name).map(|object| object.attrs.clone()))
    }

    async fn put(
        &self,
        name: &str,
        body: ObjectBody,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError> {
        validate_object_name(name)?;
        let data = match body {
            ObjectBody::Bytes(bytes) => bytes,
            ObjectBody::File(path) => Bytes::from(tokio::fs::read(&path).await?),
        };

        let mut objects = self.lock();
        conditions.check(objects.get(name).map(|object| &object.attrs))?;

        let attrs = ObjectAttrs {
            name: name.to_string(),
            size: data.len() as u64,
            generation: self.next_generation.fetch_add(1, Ordering::AcqRel),
            metageneration: 1,
            metadata,
            updated_at: Utc::now(),
        };
        objects.insert(
            name.to_string(),
            StoredObject {
                attrs: attrs.clone(),
                data,
            },
        );
        Ok(attrs)
    }

    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        conditions: Conditions,
    ) -> Result<ObjectAttrs, StoreError> {
        validate_object_name(name)?;
        let mut objects = self.lock();
        let object = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        conditions.check(Some(&object.attrs))?;

        object.attrs.metadata.extend(metadata);
        object.attrs.metageneration += 1;
        object.attrs.updated_at = Utc::now();
        Ok(object.attrs.clone())
    }

    async fn read(&self, name: &str) -> Result<ByteStream, StoreError> {
        validate_object_name(name)?;
        let data = self
            .object_bytes(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::pin(futures_util::stream::once(async move { Ok(data) })))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_object_name(name)?;
        self.lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
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
