use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use tracing::debug;

use handsign_types::api::{Claims, InitiateResponse, SubmitPhotoResponse};

use crate::{AppState, engine_status};

/// Start (or resume) verification for the signed-in user.
pub async fn initiate(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let initiation = state
        .engine
        .initiate_verification(claims.sub)
        .await
        .map_err(engine_status)?;

    let status = if initiation.is_new {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(InitiateResponse {
            user: initiation.user,
            request: initiation.request,
            is_new: initiation.is_new,
        }),
    ))
}

/// Raw image bytes in the body.
pub async fn submit_photo(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    debug!("{} ({}) uploading {} byte photo", claims.name, claims.sub, body.len());
    let request = state
        .engine
        .submit_photo_bytes(claims.sub, &body)
        .await
        .map_err(engine_status)?;
    Ok(Json(SubmitPhotoResponse { request }))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let snapshot = state.engine.get_status(claims.sub).await.map_err(engine_status)?;
    Ok(Json(snapshot))
}
