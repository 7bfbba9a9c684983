use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use handsign_engine::ReviewOutcome;
use handsign_types::api::{Claims, PendingReview, RejectRequest, ReviewResponse};

use crate::{AppState, engine_status};

fn review_response(request_id: Uuid, outcome: ReviewOutcome) -> ReviewResponse {
    let outcome = match outcome {
        ReviewOutcome::Applied(_) => "applied",
        ReviewOutcome::AlreadyHandled(_) => "already_handled",
    };
    ReviewResponse {
        request_id,
        outcome: outcome.to_string(),
    }
}

pub async fn pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    state.engine.reviewer(claims.sub).await.map_err(engine_status)?;
    let reviews = state.engine.pending_reviews().await.map_err(engine_status)?;
    let reviews: Vec<PendingReview> = reviews
        .into_iter()
        .map(|(request, user)| PendingReview { request, user })
        .collect();
    Ok(Json(reviews))
}

/// Web reviewers have no chat card, so there is no origin message to edit.
pub async fn approve(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let reviewer = state.engine.reviewer(claims.sub).await.map_err(engine_status)?;
    let outcome = state
        .engine
        .approve(request_id, &reviewer, None)
        .await
        .map_err(engine_status)?;
    Ok(Json(review_response(request_id, outcome)))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let reviewer = state.engine.reviewer(claims.sub).await.map_err(engine_status)?;
    let outcome = state
        .engine
        .reject(request_id, &reviewer, &req.reason, None)
        .await
        .map_err(engine_status)?;
    Ok(Json(review_response(request_id, outcome)))
}
