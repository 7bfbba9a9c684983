use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, post},
};
use tracing::error;

use handsign_engine::photos::MAX_PHOTO_BYTES;
use handsign_engine::{EngineError, VerificationEngine};

pub mod middleware;
pub mod review;
pub mod verification;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub engine: Arc<VerificationEngine>,
    pub jwt_secret: String,
}

/// Authenticated verification and review routes. The caller nests or merges
/// them next to its public routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/verification",
            post(verification::initiate).get(verification::status),
        )
        .route(
            "/verification/photo",
            post(verification::submit_photo).layer(DefaultBodyLimit::max(MAX_PHOTO_BYTES + 1024)),
        )
        .route("/review/pending", get(review::pending))
        .route("/review/{id}/approve", post(review::approve))
        .route("/review/{id}/reject", post(review::reject))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}

/// Map an engine failure onto an HTTP status, logging the ones that are ours.
pub(crate) fn engine_status(e: EngineError) -> StatusCode {
    match e {
        EngineError::InvalidPhoto(_) | EngineError::EmptyReason => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::NoPendingRequest | EngineError::NoPhotoSubmitted => StatusCode::CONFLICT,
        EngineError::UserNotFound | EngineError::RequestNotFound => StatusCode::NOT_FOUND,
        EngineError::NotReviewer => StatusCode::FORBIDDEN,
        EngineError::Store(_) | EngineError::PhotoStorage(_) | EngineError::Transport(_) => {
            error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
