use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache_key::{archive_object_name, is_valid_key};
use crate::error::PackError;
use crate::job::{progress_of, raw_status, JobStatus, Metadata, STARTED_AT_KEY};
use crate::serve::error::ApiError;
use crate::serve::state::AppState;
use crate::store::ObjectAttrs;

/// Lifetime of the URL a download redirects to.
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Deserialize)]
pub struct PackRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PackResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl StatusResponse {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let status = raw_status(metadata);
        let progress = match status.parse::<JobStatus>() {
            Ok(JobStatus::Succeeded) => Some(1.0),
            Ok(JobStatus::Processing) => progress_of(metadata),
            _ => None,
        };
        Self {
            status: status.to_string(),
            started_at: metadata.get(STARTED_AT_KEY).cloned(),
            progress,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

pub async fn submit_pack(
    State(state): State<AppState>,
    payload: Result<Json<PackRequest>, JsonRejection>,
) -> Result<Json<PackResponse>, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let id = state.service.submit(&request.urls).await?;
    Ok(Json(PackResponse { id }))
}

pub async fn pack_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let attrs = load_record(&state, &id).await?;
    Ok(Json(StatusResponse::from_metadata(&attrs.metadata)))
}

/// `GET /pack/{id}.zip`: redirects to a short-lived URL once the archive is
/// built.
pub async fn download_pack(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let id = file.strip_suffix(".zip").ok_or_else(ApiError::not_found)?;
    let attrs = load_record(&state, id).await?;

    let status = raw_status(&attrs.metadata);
    if status != JobStatus::Succeeded.as_str() {
        return Err(PackError::InvalidStatus(status.to_string()).into());
    }

    let url = state
        .store
        .signed_url(&attrs.name, DOWNLOAD_URL_TTL)
        .await
        .map_err(|err| {
            log::error!("Failed to sign url for {}: {}", attrs.name, err);
            ApiError::internal("failed to issue download url")
        })?;

    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// Serves an object to holders of a valid signed URL.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature.as_deref()) else {
        return Err(ApiError::forbidden("missing signature"));
    };
    state
        .signer
        .verify(&key, expires, signature)
        .map_err(|err| ApiError::forbidden(err.to_string()))?;

    let attrs = match state.store.stat(&key).await {
        Ok(Some(attrs)) => attrs,
        Ok(None) => return Err(ApiError::not_found()),
        Err(err) if err.is_not_found() => return Err(ApiError::not_found()),
        Err(err) => return Err(ApiError::internal(err.to_string())),
    };
    let stream = state.store.read(&key).await.map_err(|err| {
        if err.is_not_found() {
            ApiError::not_found()
        } else {
            ApiError::internal(err.to_string())
        }
    })?;

    let content_type = if key.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, attrs.size.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn load_record(state: &AppState, id: &str) -> Result<ObjectAttrs, ApiError> {
    if !is_valid_key(id) {
        return Err(ApiError::not_found());
    }
    let name = archive_object_name(id);
    match state.store.stat(&name).await {
        Ok(Some(attrs)) => Ok(attrs),
        Ok(None) => Err(ApiError::not_found()),
        Err(err) => {
            log::error!("Failed to read job record {}: {}", name, err);
            Err(ApiError::internal("failed to read job record"))
        }
    }
}
