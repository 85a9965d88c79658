//! Admission of pack requests: key derivation, the create-if-absent job
//! record, the overflow source list and dispatch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::cache_key::{archive_object_name, derive, source_object_name};
use crate::dispatch::BuildDispatcher;
use crate::error::PackError;
use crate::job::{status_metadata, JobStatus, Metadata};
use crate::store::{Conditions, ObjectBody, ObjectStore};
use crate::worker::PackJob;

/// Above this many URLs the list is stored as a side object instead of being
/// passed inline.
pub const MAX_INLINE_URLS: usize = 100;

pub struct PackService {
    store: Arc<dyn ObjectStore>,
    dispatcher: Arc<dyn BuildDispatcher>,
    domain: Option<String>,
    timeout: Option<Duration>,
}

impl PackService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dispatcher: Arc<dyn BuildDispatcher>,
        domain: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            domain: domain.filter(|d| !d.is_empty()),
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Admits a request and returns its cache key. Submitting a URL set that
    /// was already admitted returns the same key without dispatching again.
    pub async fn submit(&self, urls: &[String]) -> Result<String, PackError> {
        let (key, normalized) = derive(urls, self.domain.as_deref())?;
        let record = archive_object_name(&key);

        match self
            .store
            .put(
                &record,
                ObjectBody::empty(),
                status_metadata(JobStatus::Accepted),
                Conditions::does_not_exist(),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_precondition_failed() => {
                log::debug!("Pack {} already admitted", key);
                return Ok(key);
            }
            Err(err) => return Err(PackError::store("failed to write metadata", err)),
        }

        let url_count = normalized.len();
        let mut job = PackJob {
            dest: self.store.location(&record),
            source: None,
            domain: self.domain.clone(),
            timeout: self.timeout,
            urls: normalized,
        };

        if job.urls.len() > MAX_INLINE_URLS {
            let list_name = source_object_name(&key);
            let mut list = job.urls.join("\n");
            list.push('\n');

            if let Err(err) = self
                .store
                .put(
                    &list_name,
                    ObjectBody::Bytes(Bytes::from(list)),
                    Metadata::new(),
                    Conditions::none(),
                )
                .await
            {
                self.release(&record).await;
                return Err(PackError::store("failed to write source list", err));
            }

            job.source = Some(self.store.location(&list_name));
            job.urls = Vec::new();
        }

        if let Err(err) = self.dispatcher.dispatch(job).await {
            log::error!("Failed to dispatch pack {}: {}", key, err);
            self.release(&record).await;
            return Err(err.into());
        }

        log::info!("Accepted pack {} ({} urls)", key, url_count);
        Ok(key)
    }

    /// Deletes a record this admitter created but could not hand over, so a
    /// retry can admit it again.
    async fn release(&self, record: &str) {
        if let Err(err) = self.store.delete(record).await {
            log::error!("Failed to delete job record {}: {}", record, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::cache_key;
    use crate::dispatch::DispatchError;
    use crate::store::MemoryObjectStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<PackJob>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BuildDispatcher for Recorder {
        async fn dispatch(&self, job: PackJob) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::UnsupportedUrl("x".to_string()));
            }
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    fn urls(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("https://example.com/assets/ab/1/{i:03}_x.zip"))
            .collect()
    }

    #[tokio::test]
    async fn test_second_submission_does_not_dispatch() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder::default());
        let service = PackService::new(store.clone(), recorder.clone(), None, None);

        let mut reversed = urls(3);
        let first = service.submit(&urls(3)).await.unwrap();
        reversed.reverse();
        let second = service.submit(&reversed).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(recorder.jobs.lock().unwrap().len(), 1);
        let record = store.stat(&format!("{first}.zip")).await.unwrap().unwrap();
        assert_eq!(record.metadata.get("status").unwrap(), "accepted");
        assert_eq!(record.size, 0);
    }

    #[tokio::test]
    async fn test_duplicates_are_collapsed_before_dispatch() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder::default());
        let service = PackService::new(store.clone(), recorder.clone(), None, None);

        let mut doubled = urls(3);
        doubled.extend(urls(3));
        service.submit(&doubled).await.unwrap();

        let jobs = recorder.jobs.lock().unwrap();
        assert_eq!(jobs[0].urls, urls(3));
    }

    #[tokio::test]
    async fn test_overflow_list_is_stored() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder::default());
        let service = PackService::new(store.clone(), recorder.clone(), None, None);

        let key = service.submit(&urls(101)).await.unwrap();
        let jobs = recorder.jobs.lock().unwrap();
        assert!(jobs[0].urls.is_empty());
        assert_eq!(
            jobs[0].source.as_ref().unwrap().to_string(),
            format!("mem://packs/{key}.txt")
        );

        let list = store.object_bytes(&format!("{key}.txt")).unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&list).unwrap().lines().collect();
        assert_eq!(lines.len(), 101);
        assert_eq!(key, cache_key(&urls(101)));
    }

    #[tokio::test]
    async fn test_exactly_max_urls_stay_inline() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder::default());
        let service = PackService::new(store.clone(), recorder.clone(), None, None);

        let key = service.submit(&urls(MAX_INLINE_URLS)).await.unwrap();
        assert_eq!(recorder.jobs.lock().unwrap()[0].urls.len(), MAX_INLINE_URLS);
        assert!(store.object_bytes(&format!("{key}.txt")).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_releases_record() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let service = PackService::new(store.clone(), recorder, None, None);

        let result = service.submit(&urls(2)).await;
        assert!(matches!(result, Err(PackError::Dispatch(_))));
        assert!(store.object_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_has_no_side_effects() {
        let store = Arc::new(MemoryObjectStore::new("packs"));
        let recorder = Arc::new(Recorder::default());
        let service = PackService::new(
            store.clone(),
            recorder.clone(),
            Some("example.com".to_string()),
            None,
        );

        assert!(service.submit(&[]).await.is_err());
        let err = service
            .submit(&["https://other.com/assets/a/b/c.zip".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(store.object_names().is_empty());
        assert!(recorder.jobs.lock().unwrap().is_empty());
    }
}
