use anyhow::Result;
use std::sync::Arc;

use crate::admission::PackService;
use crate::commands::{open_store, worker_settings};
use crate::config::{Config, DispatchMode};
use crate::dispatch::{BuildDispatcher, CommandDispatcher, InProcessDispatcher};
use crate::serve::state::AppState;
use crate::worker::Worker;

pub async fn execute(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let (store, signer) = open_store(&config)?;

    let dispatcher: Arc<dyn BuildDispatcher> = match config.dispatch {
        DispatchMode::InProcess => {
            let worker = Worker::new(store.clone(), worker_settings(&config));
            Arc::new(InProcessDispatcher::new(Arc::new(worker)))
        }
        DispatchMode::Command => match &config.worker_bin {
            Some(program) => Arc::new(CommandDispatcher::new(program.clone())),
            None => Arc::new(CommandDispatcher::current_exe()?),
        },
    };
    log::info!("Dispatch mode: {:?}", config.dispatch);

    let service = Arc::new(PackService::new(
        store,
        dispatcher,
        config.domain(),
        config.packer_timeout(),
    ));

    crate::serve::run_server(AppState::new(service, signer), config.host, config.port).await
}
