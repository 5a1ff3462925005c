pub mod v2;

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, Uri};
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::service::browse::{get_path_handler, get_root_handler};
use crate::utils::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(v2::create_v2_router())
        .merge(browse_router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn browse_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/get/", get(get_root_handler).fallback(not_found))
        .route("/get/{*path}", get(get_path_handler).fallback(not_found))
}

/// Misses never surface as anything but 404, whatever the method.
async fn not_found(method: Method, uri: Uri) -> AppError {
    AppError::NotFound(format!("{method} {}", uri.path()))
}
