use std::sync::Arc;

use crate::admission::PackService;
use crate::signing::UrlSigner;
use crate::store::ObjectStore;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PackService>,
    pub store: Arc<dyn ObjectStore>,
    /// Verifies URLs the store handed out for `GET /objects/{key}`.
    pub signer: Arc<UrlSigner>,
}

impl AppState {
    pub fn new(service: Arc<PackService>, signer: Arc<UrlSigner>) -> Self {
        let store = service.store().clone();
        Self {
            service,
            store,
            signer,
        }
    }
}
