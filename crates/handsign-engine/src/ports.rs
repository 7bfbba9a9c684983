//! Collaborator interfaces the engine is wired against.
//!
//! Production implementations live in `sqlite` (store), `photos` (validation
//! and disk storage), handsign-telegram (transport) and handsign-gateway
//! (realtime publisher).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use handsign_types::models::{RequestStatus, Role, User, VerificationRequest};

use crate::error::{PhotoError, StoreResult, TransportResult};

// -- Transport --

/// An inline keyboard button attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    Callback { text: String, data: String },
    Url { text: String, url: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    /// Inline keyboard rows.
    pub buttons: Vec<Vec<Button>>,
    /// Ask the client to open a reply box targeting the sent message.
    pub force_reply: bool,
    pub reply_to: Option<i64>,
    /// When editing: the target is a media caption rather than a text message.
    pub caption: bool,
}

impl MessageOptions {
    pub fn with_buttons(buttons: Vec<Vec<Button>>) -> Self {
        Self {
            buttons,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoSource {
    /// A file the transport already holds.
    FileId(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackAnswer {
    pub text: Option<String>,
    pub show_alert: bool,
}

impl CallbackAnswer {
    pub fn toast(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            show_alert: false,
        }
    }

    pub fn alert(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            show_alert: true,
        }
    }
}

/// Chat-bot send/receive primitives. Errors must be classified as client
/// (never retried) or transient (retried).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the id of the sent message.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64>;

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: &PhotoSource,
        caption: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<()>;

    async fn acknowledge_callback(
        &self,
        callback_id: &str,
        answer: &CallbackAnswer,
    ) -> TransportResult<()>;

    async fn download_file(&self, file_ref: &str) -> TransportResult<Vec<u8>>;
}

// -- Store --

#[derive(Debug, Clone)]
pub struct NewUser {
    pub telegram_id: i64,
    pub display_name: String,
    pub role: Role,
}

/// Fields a caller may change on a user outside of verification transitions.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub display_name: Option<String>,
}

/// A change applied to a request only while it still has the expected status.
/// Implementations mirror the resulting status onto the owning user in the
/// same atomic write.
#[derive(Debug, Clone)]
pub enum RequestUpdate {
    AttachPhoto {
        photo_ref: String,
        photo_file_id: Option<String>,
        submitted_at: DateTime<Utc>,
    },
    Approve {
        reviewer_id: Uuid,
        reviewed_at: DateTime<Utc>,
    },
    Reject {
        reviewer_id: Uuid,
        reason: String,
        reviewed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub enum CreateRequestOutcome {
    Created(VerificationRequest),
    /// The user already has a pending request.
    PendingExists,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user_by_identity(&self, telegram_id: i64) -> StoreResult<Option<User>>;

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;

    /// Fails with `StoreError::Conflict` when the telegram id is taken.
    async fn create_user(&self, new_user: NewUser) -> StoreResult<User>;

    async fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreResult<()>;

    async fn find_pending_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>>;

    async fn find_latest_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>>;

    async fn find_request(&self, id: Uuid) -> StoreResult<Option<VerificationRequest>>;

    /// Create a pending request and set the owner's status to `pending`,
    /// clearing any previous rejection reason on the user.
    async fn create_verification_request(
        &self,
        user_id: Uuid,
        gesture: &str,
    ) -> StoreResult<CreateRequestOutcome>;

    /// Atomic conditional update. Returns the number of affected rows: zero
    /// means the request no longer had `expected` status.
    async fn update_verification_request_if_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        update: RequestUpdate,
    ) -> StoreResult<u64>;

    async fn list_privileged_users(&self) -> StoreResult<Vec<User>>;

    /// Pending requests with a photo attached, oldest submission first.
    async fn list_pending_requests(&self, limit: u32) -> StoreResult<Vec<VerificationRequest>>;
}

// -- Realtime --

/// Pub/sub towards browser sessions.
#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    async fn publish_to_user(
        &self,
        user_id: Uuid,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn publish_to_role(
        &self,
        role: Role,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;
}

// -- Photos --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

pub trait PhotoValidator: Send + Sync {
    fn validate(&self, bytes: &[u8]) -> Result<ImageFormat, PhotoError>;
}

/// Binary storage for submitted photos.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Stores the bytes and returns the reference to keep on the request.
    async fn put(&self, bytes: &[u8]) -> anyhow::Result<String>;

    async fn get(&self, photo_ref: &str) -> anyhow::Result<Vec<u8>>;
}
