pub mod key;
pub mod pack;
pub mod serve;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{Config, StoreKind};
use crate::signing::{load_signing_key, UrlSigner};
use crate::store::{FsObjectStore, MemoryObjectStore, ObjectStore};
use crate::ui;
use crate::worker::WorkerSettings;

/// Opens the configured store together with the signer its URLs are issued
/// with.
pub(crate) fn open_store(config: &Config) -> Result<(Arc<dyn ObjectStore>, Arc<UrlSigner>)> {
    let signer = Arc::new(match &config.signing_key_path {
        Some(path) => UrlSigner::new(load_signing_key(path)?, config.public_url()),
        None => {
            log::debug!("No signing key configured; using an ephemeral key");
            UrlSigner::ephemeral(config.public_url())
        }
    });

    let store: Arc<dyn ObjectStore> = match config.store {
        StoreKind::Memory => {
            ui::warn("Using the in-memory store; jobs and archives are lost on exit");
            Arc::new(MemoryObjectStore::new(config.bucket.clone()).with_signer(signer.clone()))
        }
        StoreKind::Fs => Arc::new(
            FsObjectStore::open(&config.store_dir, config.bucket.clone())
                .with_context(|| {
                    format!("Failed to open store at {}", config.store_dir.display())
                })?
                .with_signer(signer.clone()),
        ),
    };

    Ok((store, signer))
}

pub(crate) fn worker_settings(config: &Config) -> WorkerSettings {
    WorkerSettings {
        cache_dir: config.cache_dir.clone(),
        heartbeat_interval: config.heartbeat_interval(),
        ..WorkerSettings::default()
    }
}
