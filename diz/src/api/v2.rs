use crate::error::AppError;
use crate::service::blob::{get_blob_handler, head_blob_handler};
use crate::service::manifest::{get_manifest_handler, head_manifest_handler};
use crate::utils::state::AppState;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use std::sync::Arc;

pub fn create_v2_router() -> Router<Arc<AppState>> {
    Router::new()
        // Determine support
        .route("/v2", get(ping).fallback(super::not_found))
        .route("/v2/", get(ping).fallback(super::not_found))
        .route("/v2/{*tail}", any(dispatch_handler))
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

/// Only GET and HEAD are served; any other method is a miss like an unknown
/// path.
async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(tail): Path<String>,
    method: Method,
    uri: Uri,
) -> Result<Response, AppError> {
    let segments: Vec<&str> = tail.split('/').collect();

    match segments.as_slice() {
        // tail: /{name}/manifests/{reference}
        [name @ .., "manifests", reference] if !name.is_empty() => {
            let path = Path((name.join("/"), reference.to_string()));
            match method {
                Method::GET => get_manifest_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                Method::HEAD => head_manifest_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                _ => Err(AppError::NotFound(format!("{method} {}", uri.path()))),
            }
        }
        // tail: /{name}/blobs/{digest}
        [name @ .., "blobs", digest] if !name.is_empty() => {
            let path = Path((name.join("/"), digest.to_string()));
            match method {
                Method::GET => get_blob_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                Method::HEAD => head_blob_handler(State(state), path)
                    .await
                    .map(IntoResponse::into_response),
                _ => Err(AppError::NotFound(format!("{method} {}", uri.path()))),
            }
        }
        _ => Err(AppError::NotFound(format!("/v2/{tail}"))),
    }
}
