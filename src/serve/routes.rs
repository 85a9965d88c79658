use axum::routing::{get, post};
use axum::Router;

use crate::serve::handlers;
use crate::serve::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pack", post(handlers::submit_pack))
        .route("/pack/{id}", get(handlers::download_pack))
        .route("/pack/{id}/status", get(handlers::pack_status))
        .route("/objects/{key}", get(handlers::get_object))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
