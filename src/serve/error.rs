use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::error::PackError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// The job exists but is not in a state that allows the operation.
    pub fn invalid_status(status: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": "invalid status", "status": status }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<PackError> for ApiError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::InvalidRequest { message, url } => {
                let mut body = json!({ "error": message });
                if let Some(url) = url {
                    body["url"] = Value::String(url);
                }
                Self {
                    status: StatusCode::BAD_REQUEST,
                    body,
                }
            }
            PackError::NotFound => Self::not_found(),
            PackError::InvalidStatus(status) => Self::invalid_status(&status),
            other if other.is_client_error() => Self::bad_request(other.to_string()),
            other => {
                log::error!("Request failed: {}", other);
                Self::internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self.body).unwrap_or_default();
        (self.status, [("Content-Type", "application/json")], body).into_response()
    }
}
