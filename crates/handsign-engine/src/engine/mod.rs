//! The verification state machine.
//!
//! A request starts `pending` and moves once, to `approved` or `rejected`.
//! Every transition is a conditional update at the store, so two reviewers
//! racing on one request cannot both win; the loser sees zero affected rows
//! and is answered as "already handled".

mod chat;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use handsign_types::events::VerificationEvent;
use handsign_types::models::{
    RequestStatus, StatusSnapshot, User, VerificationRequest, VerificationStatus,
};

use crate::admin_directory::AdminDirectory;
use crate::config::EngineConfig;
use crate::conversation::{ConversationStore, MessageRef, RejectionState};
use crate::error::{EngineError, StoreError};
use crate::events::Sender;
use crate::fanout::{NotificationFanout, ReviewContext};
use crate::gestures::{self, default_gestures};
use crate::outbox::Outbox;
use crate::ports::{
    CreateRequestOutcome, NewUser, PhotoStore, PhotoValidator, RealtimePublisher, RequestUpdate,
    Store, Transport, UserUpdate,
};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;

/// External collaborators the engine is built from.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn Transport>,
    pub publisher: Arc<dyn RealtimePublisher>,
    pub photos: Arc<dyn PhotoStore>,
    pub validator: Arc<dyn PhotoValidator>,
}

/// Result of asking to start verification.
#[derive(Debug, Clone)]
pub struct Initiation {
    pub user: User,
    /// The pending request, or for verified users their approved one.
    pub request: Option<VerificationRequest>,
    /// Whether this call created the request.
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Applied(VerificationRequest),
    /// The request had already left `pending`, possibly a moment ago by
    /// another reviewer. Carries the status it is in now.
    AlreadyHandled(RequestStatus),
}

#[derive(Debug, Clone)]
pub enum RejectionPrompt {
    /// The reviewer was asked for a reason; nothing has been written yet.
    Prompted { prompt: MessageRef },
    AlreadyHandled(RequestStatus),
}

pub struct VerificationEngine {
    store: Arc<dyn Store>,
    photos: Arc<dyn PhotoStore>,
    validator: Arc<dyn PhotoValidator>,
    outbox: Outbox,
    limiter: RateLimiter,
    admins: Arc<AdminDirectory>,
    rejections: ConversationStore<RejectionState>,
    fanout: NotificationFanout,
    config: EngineConfig,
}

impl VerificationEngine {
    /// `cancel` interrupts retry backoff, normally on shutdown.
    pub fn new(deps: Collaborators, mut config: EngineConfig, cancel: CancellationToken) -> Self {
        if config.gestures.is_empty() {
            warn!("No gestures configured, using the default set");
            config.gestures = default_gestures();
        }

        let outbox = Outbox::new(deps.transport, RetryExecutor::new(cancel));
        let admins = Arc::new(AdminDirectory::new(deps.store.clone(), config.admin_cache_ttl));
        let fanout = NotificationFanout::new(
            outbox.clone(),
            deps.publisher,
            admins.clone(),
            deps.photos.clone(),
            config.shop_url.clone(),
        );

        Self {
            store: deps.store,
            photos: deps.photos,
            validator: deps.validator,
            outbox,
            limiter: RateLimiter::new(),
            admins,
            rejections: ConversationStore::new(config.rejection_ttl),
            fanout,
            config,
        }
    }

    pub fn admins(&self) -> &Arc<AdminDirectory> {
        &self.admins
    }

    /// Drop expired conversation state and idle rate-limit windows.
    /// Returns `(conversations, rate windows)` evicted.
    pub fn sweep(&self) -> (usize, usize) {
        let conversations = self.rejections.sweep();
        let windows = self.limiter.sweep();
        if conversations > 0 {
            debug!("Expired {} pending rejection(s)", conversations);
        }
        (conversations, windows)
    }

    // -- Users --

    /// Find the user behind a transport identity, registering them on first
    /// contact.
    pub async fn ensure_user(&self, sender: &Sender) -> Result<User, EngineError> {
        if let Some(mut user) = self.store.find_user_by_identity(sender.telegram_id).await? {
            if !sender.display_name.is_empty() && user.display_name != sender.display_name {
                let update = UserUpdate {
                    display_name: Some(sender.display_name.clone()),
                };
                match self.store.update_user(user.id, update).await {
                    Ok(()) => user.display_name = sender.display_name.clone(),
                    Err(e) => warn!("Could not refresh display name of {}: {}", user.id, e),
                }
            }
            return Ok(user);
        }

        let new_user = NewUser {
            telegram_id: sender.telegram_id,
            display_name: sender.display_name.clone(),
            role: handsign_types::models::Role::User,
        };
        match self.store.create_user(new_user).await {
            Ok(user) => {
                info!("Registered {} ({})", user.display_name, user.telegram_id);
                Ok(user)
            }
            // Two first messages from one person raced; the other one won.
            Err(StoreError::Conflict(_)) => self
                .store
                .find_user_by_identity(sender.telegram_id)
                .await?
                .ok_or(EngineError::UserNotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn user(&self, user_id: Uuid) -> Result<User, EngineError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .ok_or(EngineError::UserNotFound)
    }

    /// The user, if they may review requests.
    pub async fn reviewer(&self, user_id: Uuid) -> Result<User, EngineError> {
        let user = self.user(user_id).await?;
        if user.role.is_privileged() {
            Ok(user)
        } else {
            Err(EngineError::NotReviewer)
        }
    }

    // -- Initiate --

    pub async fn initiate_verification(&self, user_id: Uuid) -> Result<Initiation, EngineError> {
        let user = self.user(user_id).await?;
        self.initiate_for(user).await
    }

    pub async fn initiate_for_identity(&self, sender: &Sender) -> Result<Initiation, EngineError> {
        let user = self.ensure_user(sender).await?;
        self.initiate_for(user).await
    }

    async fn initiate_for(&self, mut user: User) -> Result<Initiation, EngineError> {
        if let Some(pending) = self.store.find_pending_request_for_user(user.id).await? {
            return Ok(Initiation {
                user,
                request: Some(pending),
                is_new: false,
            });
        }

        if user.verification_status == VerificationStatus::Verified {
            let latest = self.store.find_latest_request_for_user(user.id).await?;
            return Ok(Initiation {
                user,
                request: latest,
                is_new: false,
            });
        }

        let gesture = self.assign_gesture();
        match self.store.create_verification_request(user.id, &gesture).await? {
            CreateRequestOutcome::Created(request) => {
                info!(
                    request_id = %request.id,
                    user = user.telegram_id,
                    "Verification started, gesture {}", gesture
                );
                user.verification_status = VerificationStatus::Pending;
                user.gesture = Some(gesture);
                user.rejection_reason = None;
                user.submitted_at = None;
                Ok(Initiation {
                    user,
                    request: Some(request),
                    is_new: true,
                })
            }
            // A concurrent start created it first.
            CreateRequestOutcome::PendingExists => {
                let pending = self
                    .store
                    .find_pending_request_for_user(user.id)
                    .await?
                    .ok_or(EngineError::NoPendingRequest)?;
                Ok(Initiation {
                    user,
                    request: Some(pending),
                    is_new: false,
                })
            }
        }
    }

    fn assign_gesture(&self) -> String {
        gestures::pick(&self.config.gestures)
            .map(|g| g.label())
            .unwrap_or_else(|| "✋ (open palm)".to_string())
    }

    // -- Submit photo --

    pub async fn submit_photo_bytes(
        &self,
        user_id: Uuid,
        bytes: &[u8],
    ) -> Result<VerificationRequest, EngineError> {
        let user = self.user(user_id).await?;
        let pending = self
            .store
            .find_pending_request_for_user(user.id)
            .await?
            .ok_or(EngineError::NoPendingRequest)?;
        self.attach_photo(user, pending, bytes, None).await
    }

    /// Validate, store and attach a photo to the pending request, then tell
    /// every reviewer about it.
    async fn attach_photo(
        &self,
        mut user: User,
        mut request: VerificationRequest,
        bytes: &[u8],
        photo_file_id: Option<String>,
    ) -> Result<VerificationRequest, EngineError> {
        let format = self.validator.validate(bytes)?;
        let photo_ref = self.photos.put(bytes).await.map_err(EngineError::PhotoStorage)?;
        let submitted_at = Utc::now();

        let update = RequestUpdate::AttachPhoto {
            photo_ref: photo_ref.clone(),
            photo_file_id: photo_file_id.clone(),
            submitted_at,
        };
        let rows = self
            .store
            .update_verification_request_if_status(request.id, RequestStatus::Pending, update)
            .await?;
        if rows == 0 {
            // Resolved between our read and the write.
            return Err(EngineError::NoPendingRequest);
        }

        request.photo_ref = Some(photo_ref);
        request.photo_file_id = photo_file_id;
        request.submitted_at = Some(submitted_at);
        user.submitted_at = Some(submitted_at);
        info!(
            request_id = %request.id,
            user = user.telegram_id,
            "Photo submitted ({:?}, {} bytes)", format, bytes.len()
        );

        self.fanout
            .announce(VerificationEvent::New, &request, &user, None)
            .await;
        Ok(request)
    }

    // -- Status --

    pub async fn get_status(&self, user_id: Uuid) -> Result<StatusSnapshot, EngineError> {
        let user = self.user(user_id).await?;
        let latest = self.store.find_latest_request_for_user(user.id).await?;
        Ok(snapshot(&user, latest.as_ref()))
    }

    /// Submitted requests waiting for a decision, oldest first, with their owners.
    pub async fn pending_reviews(&self) -> Result<Vec<(VerificationRequest, User)>, EngineError> {
        let requests = self
            .store
            .list_pending_requests(self.config.pending_list_limit)
            .await?;
        let mut reviews = Vec::with_capacity(requests.len());
        for request in requests {
            match self.store.find_user_by_id(request.user_id).await? {
                Some(user) => reviews.push((request, user)),
                None => warn!(request_id = %request.id, "Pending request without an owner"),
            }
        }
        Ok(reviews)
    }

    // -- Decisions --

    pub async fn approve(
        &self,
        request_id: Uuid,
        reviewer: &User,
        origin: Option<MessageRef>,
    ) -> Result<ReviewOutcome, EngineError> {
        let (request, user) = match self.load_pending(request_id).await? {
            Ok(found) => found,
            Err(status) => return Ok(ReviewOutcome::AlreadyHandled(status)),
        };

        let reviewed_at = Utc::now();
        let update = RequestUpdate::Approve {
            reviewer_id: reviewer.id,
            reviewed_at,
        };
        if let Some(status) = self.apply_decision(request_id, update).await? {
            return Ok(ReviewOutcome::AlreadyHandled(status));
        }

        let approved = VerificationRequest {
            status: RequestStatus::Approved,
            reviewed_at: Some(reviewed_at),
            reviewer_id: Some(reviewer.id),
            ..request
        };
        let user = User {
            verification_status: VerificationStatus::Verified,
            verified_at: Some(reviewed_at),
            reviewed_at: Some(reviewed_at),
            verified_by: Some(reviewer.id),
            rejection_reason: None,
            ..user
        };
        info!(request_id = %request_id, reviewer = reviewer.telegram_id, "Verification approved");

        let review = ReviewContext { reviewer, origin };
        self.fanout
            .announce(VerificationEvent::Approved, &approved, &user, Some(review))
            .await;
        Ok(ReviewOutcome::Applied(approved))
    }

    pub async fn reject(
        &self,
        request_id: Uuid,
        reviewer: &User,
        reason: &str,
        origin: Option<MessageRef>,
    ) -> Result<ReviewOutcome, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::EmptyReason);
        }

        let (request, user) = match self.load_pending(request_id).await? {
            Ok(found) => found,
            Err(status) => return Ok(ReviewOutcome::AlreadyHandled(status)),
        };

        let reviewed_at = Utc::now();
        let update = RequestUpdate::Reject {
            reviewer_id: reviewer.id,
            reason: reason.to_string(),
            reviewed_at,
        };
        if let Some(status) = self.apply_decision(request_id, update).await? {
            return Ok(ReviewOutcome::AlreadyHandled(status));
        }

        let rejected = VerificationRequest {
            status: RequestStatus::Rejected,
            reviewed_at: Some(reviewed_at),
            reviewer_id: Some(reviewer.id),
            rejection_reason: Some(reason.to_string()),
            ..request
        };
        let user = User {
            verification_status: VerificationStatus::Rejected,
            reviewed_at: Some(reviewed_at),
            rejection_reason: Some(reason.to_string()),
            ..user
        };
        info!(
            request_id = %request_id,
            reviewer = reviewer.telegram_id,
            "Verification rejected: {}", reason
        );

        let review = ReviewContext { reviewer, origin };
        self.fanout
            .announce(VerificationEvent::Rejected, &rejected, &user, Some(review))
            .await;
        Ok(ReviewOutcome::Applied(rejected))
    }

    /// First half of a chat rejection: remember what the reviewer is
    /// rejecting and ask them for a reason. The request is not touched.
    pub async fn begin_rejection(
        &self,
        request_id: Uuid,
        reviewer: &User,
        origin: Option<MessageRef>,
    ) -> Result<RejectionPrompt, EngineError> {
        let (request, user) = match self.load_pending(request_id).await? {
            Ok(found) => found,
            Err(status) => return Ok(RejectionPrompt::AlreadyHandled(status)),
        };
        let prompt = self.prompt_for_reason(&request, &user, reviewer, origin).await?;
        Ok(RejectionPrompt::Prompted { prompt })
    }

    /// The request and its owner while the request is still pending with a
    /// photo attached, otherwise the status it has moved on to.
    async fn load_pending(
        &self,
        request_id: Uuid,
    ) -> Result<Result<(VerificationRequest, User), RequestStatus>, EngineError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or(EngineError::RequestNotFound)?;
        if !request.is_pending() {
            debug!(request_id = %request_id, "Request already {}", request.status.as_str());
            return Ok(Err(request.status));
        }
        // Nothing to judge until the photo is in.
        if !request.has_photo() {
            debug!(request_id = %request_id, "Review refused, no photo submitted");
            return Err(EngineError::NoPhotoSubmitted);
        }
        let user = self.user(request.user_id).await?;
        Ok(Ok((request, user)))
    }

    /// Run the conditional update. `Some(status)` means the race was lost and
    /// the request is now in `status`.
    async fn apply_decision(
        &self,
        request_id: Uuid,
        update: RequestUpdate,
    ) -> Result<Option<RequestStatus>, EngineError> {
        let rows = self
            .store
            .update_verification_request_if_status(request_id, RequestStatus::Pending, update)
            .await?;
        if rows > 0 {
            return Ok(None);
        }

        let current = self
            .store
            .find_request(request_id)
            .await?
            .ok_or(EngineError::RequestNotFound)?;
        let status = current.status.as_str();
        warn!(request_id = %request_id, "Lost a review race, request is {}", status);
        Ok(Some(current.status))
    }
}

fn snapshot(user: &User, latest: Option<&VerificationRequest>) -> StatusSnapshot {
    StatusSnapshot {
        user_id: user.id,
        status: user.verification_status,
        gesture: latest.map(|r| r.gesture.clone()).or_else(|| user.gesture.clone()),
        request_id: latest.map(|r| r.id),
        photo_submitted: latest.is_some_and(|r| r.has_photo()),
        rejection_reason: user.rejection_reason.clone(),
        submitted_at: user.submitted_at,
        verified_at: user.verified_at,
    }
}
