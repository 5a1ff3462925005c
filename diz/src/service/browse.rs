use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Response, StatusCode, header};

use crate::error::AppError;
use crate::service::stream_body;
use crate::utils::state::AppState;

/// GET /get/<path>
///
/// Streams the container entry named `path` as-is. A `path` ending in `/`
/// yields a zip of every entry below it with the prefix stripped, built
/// while the response is sent.
pub async fn get_path_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response<Body>, AppError> {
    browse(state, path).await
}

/// GET /get/ - the whole container, re-packed.
pub async fn get_root_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response<Body>, AppError> {
    browse(state, String::new()).await
}

async fn browse(state: Arc<AppState>, path: String) -> Result<Response<Body>, AppError> {
    let lookup = path.clone();
    let blob = tokio::task::spawn_blocking(move || {
        state.archive.read(&lookup, state.workers.clone())
    })
    .await??;
    let Some(blob) = blob else {
        return Err(AppError::NotFound(path));
    };

    let content_type = if path.is_empty() || path.ends_with('/') {
        "application/zip"
    } else {
        "application/octet-stream"
    };
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(size) = blob.size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }
    Ok(builder.body(stream_body(blob.reader))?)
}
