use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Response, StatusCode, header};

use crate::error::AppError;
use crate::service::manifest::{lookup_manifest, manifest_response};
use crate::service::stream_body;
use crate::utils::state::AppState;
use crate::utils::validation::{is_valid_digest, is_valid_name};

/// GET /v2/<name>/blobs/<digest>
pub async fn get_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest)): Path<(String, String)>,
) -> Result<Response<Body>, AppError> {
    serve_blob(state, name, digest, true).await
}

/// HEAD /v2/<name>/blobs/<digest>
pub async fn head_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, digest)): Path<(String, String)>,
) -> Result<Response<Body>, AppError> {
    serve_blob(state, name, digest, false).await
}

async fn serve_blob(
    state: Arc<AppState>,
    name: String,
    digest: String,
    with_body: bool,
) -> Result<Response<Body>, AppError> {
    if !is_valid_name(&name) {
        return Err(AppError::NameUnknown(name));
    }
    if !is_valid_digest(&digest) {
        return Err(AppError::BlobUnknown(digest));
    }
    serve_digest(state, name, digest, with_body).await
}

/// Serves a manifest when `digest` is a manifest digest, otherwise the
/// container entry whose content hash it carries. The repository name plays
/// no part in the lookup: every image shares one archive.
pub(crate) async fn serve_digest(
    state: Arc<AppState>,
    name: String,
    digest: String,
    with_body: bool,
) -> Result<Response<Body>, AppError> {
    if state.tag_for_digest(&digest).is_some() {
        let manifest = lookup_manifest(state, name, digest).await?;
        return manifest_response(manifest, with_body);
    }

    let Some(hash) = digest.strip_prefix("sha256:") else {
        return Err(AppError::BlobUnknown(digest));
    };
    let Some(size) = state
        .archive
        .reader()
        .entry_by_hash(hash)
        .map(|entry| entry.uncompressed_size)
    else {
        return Err(AppError::BlobUnknown(digest));
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header("Docker-Content-Digest", &digest);
    if !with_body {
        return Ok(builder.body(Body::empty())?);
    }

    let hash = hash.to_string();
    let lookup = state.clone();
    let blob = tokio::task::spawn_blocking(move || lookup.archive.open_blob(&hash)).await??;
    let blob = blob.ok_or(AppError::BlobUnknown(digest))?;
    Ok(builder.body(stream_body(blob.reader))?)
}
