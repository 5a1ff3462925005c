use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Response, StatusCode, header};
use libdiz::archive::{MANIFEST_MEDIA_TYPE, RegistryManifest};

use crate::error::AppError;
use crate::service::blob::serve_digest;
use crate::utils::state::AppState;
use crate::utils::validation::{is_valid_digest, is_valid_name, is_valid_reference};

/// Handles `GET /v2/<name>/manifests/<reference>`.
///
/// A tag is resolved through the normalized reference index, so `app`,
/// `library/app` and `docker.io/library/app` all find an archive tag `app`.
/// A digest that names no manifest falls through to the blob with that
/// content hash.
pub async fn get_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<Response<Body>, AppError> {
    serve_manifest(state, name, reference, true).await
}

/// Handles `HEAD /v2/<name>/manifests/<reference>`.
pub async fn head_manifest_handler(
    State(state): State<Arc<AppState>>,
    Path((name, reference)): Path<(String, String)>,
) -> Result<Response<Body>, AppError> {
    serve_manifest(state, name, reference, false).await
}

async fn serve_manifest(
    state: Arc<AppState>,
    name: String,
    reference: String,
    with_body: bool,
) -> Result<Response<Body>, AppError> {
    if !is_valid_name(&name) {
        return Err(AppError::NameUnknown(name));
    }
    if !is_valid_reference(&reference) {
        return Err(AppError::ManifestUnknown(reference));
    }
    if is_valid_digest(&reference) {
        return serve_digest(state, name, reference, with_body).await;
    }
    let manifest = lookup_manifest(state, name, reference).await?;
    manifest_response(manifest, with_body)
}

pub(crate) async fn lookup_manifest(
    state: Arc<AppState>,
    name: String,
    reference: String,
) -> Result<RegistryManifest, AppError> {
    let lookup = reference.clone();
    let manifest = tokio::task::spawn_blocking(move || state.manifest(&name, &lookup)).await??;
    manifest.ok_or(AppError::ManifestUnknown(reference))
}

pub(crate) fn manifest_response(
    manifest: RegistryManifest,
    with_body: bool,
) -> Result<Response<Body>, AppError> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
        .header(header::CONTENT_LENGTH, manifest.body.len())
        .header("Docker-Content-Digest", manifest.digest);
    let body = if with_body {
        Body::from(manifest.body)
    } else {
        Body::empty()
    };
    Ok(builder.body(body)?)
}
