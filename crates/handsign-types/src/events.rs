use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{RequestStatus, Role, User, VerificationRequest};

/// Verification lifecycle events published to web sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationEvent {
    /// A photo was submitted and is waiting for review
    New,
    Approved,
    Rejected,
}

impl VerificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "verification:new",
            Self::Approved => "verification:approved",
            Self::Rejected => "verification:rejected",
        }
    }
}

/// Body of a verification realtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub gesture: String,
    pub status: RequestStatus,
    pub rejection_reason: Option<String>,
    pub reviewer_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl VerificationPayload {
    pub fn new(request: &VerificationRequest, user: &User) -> Self {
        Self {
            request_id: request.id,
            user_id: user.id,
            display_name: user.display_name.clone(),
            gesture: request.gesture.clone(),
            status: request.status,
            rejection_reason: request.rejection_reason.clone(),
            reviewer_id: request.reviewer_id,
            timestamp: request
                .reviewed_at
                .or(request.submitted_at)
                .unwrap_or(request.created_at),
        }
    }
}

/// Frames sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, role: Role },

    /// A named application event, e.g. `verification:approved`
    Publish {
        name: String,
        payload: serde_json::Value,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },
}
