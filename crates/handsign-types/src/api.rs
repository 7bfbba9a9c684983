use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Role, User, VerificationRequest};

// -- JWT Claims --

/// JWT claims shared across handsign-api (REST middleware) and handsign-gateway
/// (WebSocket authentication). Tokens are minted by the storefront's login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub role: Role,
    pub exp: usize,
}

// -- Verification --

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub user: User,
    pub request: Option<VerificationRequest>,
    pub is_new: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitPhotoResponse {
    pub request: VerificationRequest,
}

// -- Review --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub request_id: Uuid,
    /// `applied` or `already_handled`
    pub outcome: String,
}

#[derive(Debug, Serialize)]
pub struct PendingReview {
    pub request: VerificationRequest,
    pub user: User,
}
