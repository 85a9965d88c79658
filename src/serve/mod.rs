pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::serve::state::AppState;

pub async fn run_server(state: AppState, host: String, port: u16) -> Result<()> {
    let router = routes::build_router(state.clone());
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    eprintln!("citypack listening on {addr}");
    eprintln!(
        "  Store: {}://{}/",
        state.store.scheme(),
        state.store.bucket()
    );
    eprintln!("  Signed URLs: {}/objects/{{key}}", state.signer.base_url());
    eprintln!("  Submit: POST http://{addr}/pack {{\"urls\": [...]}}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                log::warn!("Failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    eprintln!("\nShutting down...");
}
