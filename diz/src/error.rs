use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use libdiz::DizError;
use oci_spec::distribution::{ErrorCode, ErrorInfo, ErrorInfoBuilder, ErrorResponseBuilder};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Blob unknown: {0}")]
    BlobUnknown(String), // Contains the digest

    #[error("Manifest unknown: {0}")]
    ManifestUnknown(String), // Contains the reference (tag or digest)

    #[error("Repository not known to registry: {0}")]
    NameUnknown(String),

    #[error("{0} not found")]
    NotFound(String),

    // Internal Errors
    #[error("archive error: {0}")]
    Archive(#[from] DizError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] axum::http::Error),

    #[error("task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status_code, error_info) = match &self {
            Self::BlobUnknown(digest) => (
                StatusCode::NOT_FOUND,
                oci_error(ErrorCode::BlobUnknown, "blob unknown", json!({ "digest": digest })),
            ),
            Self::ManifestUnknown(reference) => (
                StatusCode::NOT_FOUND,
                oci_error(
                    ErrorCode::ManifestUnknown,
                    "manifest unknown",
                    json!({ "reference": reference }),
                ),
            ),
            Self::NameUnknown(name) => (
                StatusCode::NOT_FOUND,
                oci_error(
                    ErrorCode::NameUnknown,
                    "repository not known to registry",
                    json!({ "name": name }),
                ),
            ),
            Self::NotFound(path) => {
                tracing::debug!("not found: {path}");
                return (StatusCode::NOT_FOUND, "not found").into_response();
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                oci_error(ErrorCode::Unsupported, "an internal server error occurred", json!({})),
            ),
        };

        if status_code.is_server_error() {
            tracing::error!("Generating response for AppError: {:?}", self);
        } else {
            tracing::debug!("Generating response for AppError: {:?}", self);
        }

        let error_response = error_info
            .and_then(|info| ErrorResponseBuilder::default().errors(vec![info]).build().ok());
        match error_response {
            Some(body) => (status_code, Json(body)).into_response(),
            None => (status_code, self.to_string()).into_response(),
        }
    }
}

fn oci_error(
    code: ErrorCode,
    message: impl Into<String>,
    detail: serde_json::Value,
) -> Option<ErrorInfo> {
    let detail = serde_json::to_string_pretty(&detail).ok()?;
    ErrorInfoBuilder::default()
        .code(code)
        .message(message.into())
        .detail(detail)
        .build()
        .ok()
}
