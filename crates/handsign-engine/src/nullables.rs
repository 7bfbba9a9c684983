//! In-memory stand-ins for the engine's collaborators.
//!
//! They honour the same contracts as the real adapters (conditional updates,
//! single pending request per user, error classification) and record what
//! they were asked to do so tests can assert on it. Nothing here touches the
//! network or the filesystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use handsign_types::models::{RequestStatus, Role, User, VerificationRequest, VerificationStatus};

use crate::error::{StoreError, StoreResult, TransportError, TransportResult};
use crate::ports::{
    CallbackAnswer, CreateRequestOutcome, MessageOptions, NewUser, PhotoSource, PhotoStore,
    RealtimePublisher, RequestUpdate, Store, Transport, UserUpdate,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A JPEG-looking payload of `len` bytes.
pub fn jpeg(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    let magic = [0xFF, 0xD8, 0xFF, 0xE0];
    let n = magic.len().min(len);
    bytes[..n].copy_from_slice(&magic[..n]);
    bytes
}

// -- Store --

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    requests: Vec<VerificationRequest>,
}

/// Store backed by two vectors behind one mutex, so every write is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    privileged_queries: AtomicUsize,
    fail_privileged: AtomicBool,
    fail_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, telegram_id: i64, display_name: &str, role: Role) -> User {
        let user = new_user_record(telegram_id, display_name, role);
        lock(&self.tables).users.push(user.clone());
        user
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        lock(&self.tables).users.iter().find(|u| u.id == id).cloned()
    }

    pub fn request(&self, id: Uuid) -> Option<VerificationRequest> {
        lock(&self.tables).requests.iter().find(|r| r.id == id).cloned()
    }

    pub fn requests_for(&self, user_id: Uuid) -> Vec<VerificationRequest> {
        lock(&self.tables)
            .requests
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self, user_id: Uuid) -> usize {
        self.requests_for(user_id).iter().filter(|r| r.is_pending()).count()
    }

    /// How many times the privileged-user list was read.
    pub fn privileged_queries(&self) -> usize {
        self.privileged_queries.load(Ordering::SeqCst)
    }

    pub fn fail_privileged_queries(&self, fail: bool) {
        self.fail_privileged.store(fail, Ordering::SeqCst);
    }

    /// Make every conditional request update fail with a backend error.
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

fn new_user_record(telegram_id: i64, display_name: &str, role: Role) -> User {
    User {
        id: Uuid::new_v4(),
        telegram_id,
        display_name: display_name.to_string(),
        role,
        verification_status: VerificationStatus::None,
        gesture: None,
        rejection_reason: None,
        verified_by: None,
        created_at: Utc::now(),
        submitted_at: None,
        verified_at: None,
        reviewed_at: None,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_identity(&self, telegram_id: i64) -> StoreResult<Option<User>> {
        Ok(lock(&self.tables)
            .users
            .iter()
            .find(|u| u.telegram_id == telegram_id)
            .cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.user(id))
    }

    async fn create_user(&self, new_user: NewUser) -> StoreResult<User> {
        let mut tables = lock(&self.tables);
        if tables.users.iter().any(|u| u.telegram_id == new_user.telegram_id) {
            return Err(StoreError::Conflict(format!(
                "telegram id {} already registered",
                new_user.telegram_id
            )));
        }
        let user = new_user_record(new_user.telegram_id, &new_user.display_name, new_user.role);
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn update_user(&self, id: Uuid, update: UserUpdate) -> StoreResult<()> {
        let mut tables = lock(&self.tables);
        if let Some(user) = tables.users.iter_mut().find(|u| u.id == id) {
            if let Some(name) = update.display_name {
                user.display_name = name;
            }
        }
        Ok(())
    }

    async fn find_pending_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>> {
        Ok(lock(&self.tables)
            .requests
            .iter()
            .find(|r| r.user_id == user_id && r.is_pending())
            .cloned())
    }

    async fn find_latest_request_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Option<VerificationRequest>> {
        // Insertion order doubles as creation order.
        Ok(lock(&self.tables)
            .requests
            .iter()
            .rev()
            .find(|r| r.user_id == user_id)
            .cloned())
    }

    async fn find_request(&self, id: Uuid) -> StoreResult<Option<VerificationRequest>> {
        Ok(self.request(id))
    }

    async fn create_verification_request(
        &self,
        user_id: Uuid,
        gesture: &str,
    ) -> StoreResult<CreateRequestOutcome> {
        let mut tables = lock(&self.tables);
        if tables.requests.iter().any(|r| r.user_id == user_id && r.is_pending()) {
            return Ok(CreateRequestOutcome::PendingExists);
        }
        let now = Utc::now();
        let Some(user) = tables.users.iter_mut().find(|u| u.id == user_id) else {
            return Err(StoreError::Conflict(format!("no user {}", user_id)));
        };
        user.verification_status = VerificationStatus::Pending;
        user.gesture = Some(gesture.to_string());
        user.rejection_reason = None;
        user.submitted_at = None;

        let request = VerificationRequest {
            id: Uuid::new_v4(),
            user_id,
            gesture: gesture.to_string(),
            photo_ref: None,
            photo_file_id: None,
            status: RequestStatus::Pending,
            created_at: now,
            submitted_at: None,
            reviewed_at: None,
            reviewer_id: None,
            rejection_reason: None,
        };
        tables.requests.push(request.clone());
        Ok(CreateRequestOutcome::Created(request))
    }

    async fn update_verification_request_if_status(
        &self,
        id: Uuid,
        expected: RequestStatus,
        update: RequestUpdate,
    ) -> StoreResult<u64> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("disk I/O error")));
        }

        let mut tables = lock(&self.tables);
        let Tables { users, requests } = &mut *tables;
        let Some(request) = requests.iter_mut().find(|r| r.id == id && r.status == expected) else {
            return Ok(0);
        };
        let Some(user) = users.iter_mut().find(|u| u.id == request.user_id) else {
            return Ok(0);
        };

        match update {
            RequestUpdate::AttachPhoto {
                photo_ref,
                photo_file_id,
                submitted_at,
            } => {
                request.photo_ref = Some(photo_ref);
                request.photo_file_id = photo_file_id;
                request.submitted_at = Some(submitted_at);
                user.submitted_at = Some(submitted_at);
            }
            RequestUpdate::Approve {
                reviewer_id,
                reviewed_at,
            } => {
                request.status = RequestStatus::Approved;
                request.reviewer_id = Some(reviewer_id);
                request.reviewed_at = Some(reviewed_at);
                user.verification_status = VerificationStatus::Verified;
                user.verified_at = Some(reviewed_at);
                user.reviewed_at = Some(reviewed_at);
                user.verified_by = Some(reviewer_id);
                user.rejection_reason = None;
            }
            RequestUpdate::Reject {
                reviewer_id,
                reason,
                reviewed_at,
            } => {
                request.status = RequestStatus::Rejected;
                request.reviewer_id = Some(reviewer_id);
                request.reviewed_at = Some(reviewed_at);
                request.rejection_reason = Some(reason.clone());
                user.verification_status = VerificationStatus::Rejected;
                user.reviewed_at = Some(reviewed_at);
                user.rejection_reason = Some(reason);
            }
        }
        Ok(1)
    }

    async fn list_privileged_users(&self) -> StoreResult<Vec<User>> {
        self.privileged_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_privileged.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow::anyhow!("database is locked")));
        }
        Ok(lock(&self.tables)
            .users
            .iter()
            .filter(|u| u.role.is_privileged())
            .cloned()
            .collect())
    }

    async fn list_pending_requests(&self, limit: u32) -> StoreResult<Vec<VerificationRequest>> {
        let mut pending: Vec<_> = lock(&self.tables)
            .requests
            .iter()
            .filter(|r| r.is_pending() && r.has_photo())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

// -- Transport --

/// An outgoing message or photo, as the transport saw it.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub photo: Option<PhotoSource>,
    pub options: MessageOptions,
}

#[derive(Debug, Clone)]
pub struct EditedMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub options: MessageOptions,
}

/// Transport that records every call and hands out increasing message ids.
pub struct RecordingTransport {
    next_message_id: AtomicI64,
    sent: Mutex<Vec<SentMessage>>,
    edits: Mutex<Vec<EditedMessage>>,
    acks: Mutex<Vec<(String, CallbackAnswer)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicUsize,
    failing_chats: Mutex<HashMap<i64, TransportError>>,
    fail_edits: AtomicBool,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            next_message_id: AtomicI64::new(1000),
            sent: Mutex::default(),
            edits: Mutex::default(),
            acks: Mutex::default(),
            files: Mutex::default(),
            downloads: AtomicUsize::new(0),
            failing_chats: Mutex::default(),
            fail_edits: AtomicBool::new(false),
        }
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `download_file(file_ref)` return these bytes.
    pub fn add_file(&self, file_ref: &str, bytes: Vec<u8>) {
        lock(&self.files).insert(file_ref.to_string(), bytes);
    }

    /// How many times `download_file` was called.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Every send into `chat_id` fails with `error` from now on.
    pub fn fail_chat(&self, chat_id: i64, error: TransportError) {
        lock(&self.failing_chats).insert(chat_id, error);
    }

    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<SentMessage> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn last_to(&self, chat_id: i64) -> Option<SentMessage> {
        self.sent_to(chat_id).pop()
    }

    pub fn edits(&self) -> Vec<EditedMessage> {
        lock(&self.edits).clone()
    }

    pub fn acks(&self) -> Vec<(String, CallbackAnswer)> {
        lock(&self.acks).clone()
    }

    fn record(
        &self,
        chat_id: i64,
        text: &str,
        photo: Option<PhotoSource>,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        if let Some(err) = lock(&self.failing_chats).get(&chat_id) {
            return Err(err.clone());
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.sent).push(SentMessage {
            chat_id,
            message_id,
            text: text.to_string(),
            photo,
            options: options.clone(),
        });
        Ok(message_id)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        self.record(chat_id, text, None, options)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: &PhotoSource,
        caption: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        self.record(chat_id, caption, Some(photo.clone()), options)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(TransportError::from_status(
                400,
                "Bad Request: message to edit not found",
                None,
            ));
        }
        lock(&self.edits).push(EditedMessage {
            chat_id,
            message_id,
            text: text.to_string(),
            options: options.clone(),
        });
        Ok(())
    }

    async fn acknowledge_callback(
        &self,
        callback_id: &str,
        answer: &CallbackAnswer,
    ) -> TransportResult<()> {
        lock(&self.acks).push((callback_id.to_string(), answer.clone()));
        Ok(())
    }

    async fn download_file(&self, file_ref: &str) -> TransportResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        lock(&self.files)
            .get(file_ref)
            .cloned()
            .ok_or_else(|| TransportError::from_status(400, "Bad Request: invalid file_id", None))
    }
}

// -- Realtime --

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    User(Uuid),
    Role(Role),
}

#[derive(Debug, Clone)]
pub struct Published {
    pub audience: Audience,
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    /// Event names delivered to `audience`, in order.
    pub fn events_for(&self, audience: &Audience) -> Vec<String> {
        lock(&self.published)
            .iter()
            .filter(|p| &p.audience == audience)
            .map(|p| p.event.clone())
            .collect()
    }
}

#[async_trait]
impl RealtimePublisher for RecordingPublisher {
    async fn publish_to_user(
        &self,
        user_id: Uuid,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        lock(&self.published).push(Published {
            audience: Audience::User(user_id),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn publish_to_role(
        &self,
        role: Role,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        lock(&self.published).push(Published {
            audience: Audience::Role(role),
            event: event.to_string(),
            payload,
        });
        Ok(())
    }
}

// -- Photos --

#[derive(Default)]
pub struct MemoryPhotoStore {
    photos: Mutex<HashMap<String, Vec<u8>>>,
    next: AtomicUsize,
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.photos).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn put(&self, bytes: &[u8]) -> anyhow::Result<String> {
        let photo_ref = format!("photo-{}", self.next.fetch_add(1, Ordering::SeqCst));
        lock(&self.photos).insert(photo_ref.clone(), bytes.to_vec());
        Ok(photo_ref)
    }

    async fn get(&self, photo_ref: &str) -> anyhow::Result<Vec<u8>> {
        lock(&self.photos)
            .get(photo_ref)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no photo {}", photo_ref))
    }
}
