//! Inbound chat handlers. None of them fail: errors end up in the log and,
//! where someone is waiting, as a reply.

use tracing::{debug, error, warn};

use handsign_types::models::{User, VerificationRequest, VerificationStatus};

use super::{RejectionPrompt, ReviewOutcome, VerificationEngine, snapshot};
use crate::conversation::{MessageRef, RejectionState, UserSnapshot};
use crate::error::{EngineError, PhotoError};
use crate::events::{CallbackEvent, CommandEvent, PhotoEvent, ReviewAction, TextEvent};
use crate::fanout::{review_buttons, review_card};
use crate::photos::MAX_PHOTO_BYTES;
use crate::ports::{Button, CallbackAnswer, MessageOptions};

const TRY_AGAIN: &str = "⚠️ Something went wrong on our side. Please try again in a moment.";

impl VerificationEngine {
    pub async fn on_command(&self, event: CommandEvent) {
        self.sweep_conversations();
        if !self.limiter.allow(event.from.telegram_id, self.config.command_limit) {
            self.reply(event.chat_id, "⏳ Too many requests. Please wait a minute and try again.")
                .await;
            return;
        }

        if let Err(e) = self.handle_command(&event).await {
            self.report(event.chat_id, &format!("/{}", event.command), &e).await;
        }
    }

    pub async fn on_photo(&self, event: PhotoEvent) {
        self.sweep_conversations();
        if !self.limiter.allow(event.from.telegram_id, self.config.photo_limit) {
            let text = "⏳ Too many photos. Please wait a minute before sending another.";
            self.reply(event.chat_id, text).await;
            return;
        }

        if let Err(e) = self.handle_photo(&event).await {
            self.report(event.chat_id, "photo", &e).await;
        }
    }

    pub async fn on_callback(&self, event: CallbackEvent) {
        self.sweep_conversations();
        let answer = match self.handle_callback(&event).await {
            Ok(answer) => answer,
            Err(e) if e.is_validation() => {
                debug!("Refused callback {} from {}: {}", event.data, event.from.telegram_id, e);
                CallbackAnswer::alert(failure_message(&e))
            }
            Err(e) => {
                error!("Callback {} from {} failed: {}", event.data, event.from.telegram_id, e);
                CallbackAnswer::alert(TRY_AGAIN)
            }
        };
        if let Err(e) = self.outbox.acknowledge(&event.callback_id, &answer).await {
            warn!("Could not acknowledge callback {}: {}", event.callback_id, e);
        }
    }

    pub async fn on_text(&self, event: TextEvent) {
        self.sweep_conversations();
        if let Err(e) = self.handle_text(&event).await {
            self.report(event.chat_id, "text", &e).await;
        }
    }

    fn sweep_conversations(&self) {
        let expired = self.rejections.sweep();
        if expired > 0 {
            debug!("Expired {} pending rejection(s)", expired);
        }
    }

    // -- Commands --

    async fn handle_command(&self, event: &CommandEvent) -> Result<(), EngineError> {
        match event.command.as_str() {
            "start" => self.command_start(event).await,
            "status" => self.command_status(event).await,
            "help" => self.command_help(event).await,
            "cancel" => self.command_cancel(event).await,
            "pending" => self.command_pending(event).await,
            other => {
                debug!("Unknown command /{} from {}", other, event.from.telegram_id);
                self.reply(event.chat_id, "Unknown command. Send /help to see what I can do.")
                    .await;
                Ok(())
            }
        }
    }

    async fn command_start(&self, event: &CommandEvent) -> Result<(), EngineError> {
        let initiation = self.initiate_for_identity(&event.from).await?;
        let user = &initiation.user;

        if user.verification_status == VerificationStatus::Verified {
            let text = format!(
                "✅ You're already verified, {}. Enjoy the shop!",
                user.display_name
            );
            self.outbox.send(event.chat_id, &text, &self.shop_button()).await?;
            return Ok(());
        }

        let Some(request) = &initiation.request else {
            return Err(EngineError::NoPendingRequest);
        };
        let text = if initiation.is_new {
            format!(
                "👋 Welcome, {}!\n\n\
                 To verify your account, send a photo of yourself showing this hand gesture:\n\n\
                 {}\n\n\
                 Make sure your face and hand are clearly visible.",
                user.display_name, request.gesture
            )
        } else if request.has_photo() {
            format!(
                "⏳ Your photo for gesture {} is waiting for review. You'll hear from us soon.",
                request.gesture
            )
        } else {
            format!(
                "You already have a verification in progress.\n\n\
                 Gesture: {}\n\nSend a photo of yourself showing it.",
                request.gesture
            )
        };
        self.outbox.send_plain(event.chat_id, &text).await?;
        Ok(())
    }

    async fn command_status(&self, event: &CommandEvent) -> Result<(), EngineError> {
        let user = self.ensure_user(&event.from).await?;
        let latest = self.store.find_latest_request_for_user(user.id).await?;
        let status = snapshot(&user, latest.as_ref());

        let gesture = status.gesture.as_deref().unwrap_or("-");
        let text = match status.status {
            VerificationStatus::None => {
                "You haven't started verification yet. Send /start to begin.".to_string()
            }
            VerificationStatus::Pending if status.photo_submitted => {
                format!("⏳ Your photo for gesture {} is waiting for review.", gesture)
            }
            VerificationStatus::Pending => format!(
                "⏳ Verification in progress.\n\n\
                 Gesture: {}\n\nSend a photo of yourself showing it.",
                gesture
            ),
            VerificationStatus::Verified => "✅ You're verified.".to_string(),
            VerificationStatus::Rejected => format!(
                "❌ Your last verification was not approved.\n\n\
                 Reason: {}\n\nSend /start to try again.",
                status.rejection_reason.as_deref().unwrap_or("not given")
            ),
        };
        self.outbox.send_plain(event.chat_id, &text).await?;
        Ok(())
    }

    async fn command_help(&self, event: &CommandEvent) -> Result<(), EngineError> {
        let mut text = String::from(
            "/start - get your verification gesture\n\
             /status - check your verification\n\
             /help - show this message",
        );
        if self.admins.is_reviewer(event.from.telegram_id).await? {
            text.push_str(
                "\n\nReviewers:\n\
                 /pending - list requests waiting for review\n\
                 /cancel - abort a rejection in progress",
            );
        }
        self.outbox.send_plain(event.chat_id, &text).await?;
        Ok(())
    }

    async fn command_cancel(&self, event: &CommandEvent) -> Result<(), EngineError> {
        let text = match self.rejections.delete(event.from.telegram_id) {
            Some(state) => {
                debug!(
                    request_id = %state.request_id,
                    "Rejection cancelled by {}", event.from.telegram_id
                );
                format!(
                    "Rejection cancelled. The request from {} is still pending.",
                    state.user.display_name
                )
            }
            None => "Nothing to cancel.".to_string(),
        };
        self.outbox.send_plain(event.chat_id, &text).await?;
        Ok(())
    }

    async fn command_pending(&self, event: &CommandEvent) -> Result<(), EngineError> {
        if !self.admins.is_reviewer(event.from.telegram_id).await? {
            self.outbox
                .send_plain(event.chat_id, "This command is for reviewers only.")
                .await?;
            return Ok(());
        }

        let reviews = self.pending_reviews().await?;
        if reviews.is_empty() {
            self.outbox.send_plain(event.chat_id, "🎉 Nothing waiting for review.").await?;
            return Ok(());
        }

        let header = format!("📋 {} request(s) waiting for review:", reviews.len());
        self.outbox.send_plain(event.chat_id, &header).await?;
        for (request, user) in &reviews {
            let options = MessageOptions::with_buttons(review_buttons(request));
            self.outbox
                .send(event.chat_id, &review_card(request, user), &options)
                .await?;
        }
        Ok(())
    }

    // -- Photos --

    async fn handle_photo(&self, event: &PhotoEvent) -> Result<(), EngineError> {
        let user = self.ensure_user(&event.from).await?;
        let Some(pending) = self.store.find_pending_request_for_user(user.id).await? else {
            return Err(EngineError::NoPendingRequest);
        };
        // Telegram reports the size up front, so oversize files are never fetched.
        let announced = event.file_size.map(|size| usize::try_from(size).unwrap_or(usize::MAX));
        if let Some(size) = announced.filter(|&size| size > MAX_PHOTO_BYTES) {
            return Err(PhotoError::TooLarge {
                size,
                max: MAX_PHOTO_BYTES,
            }
            .into());
        }

        let bytes = self.outbox.download(&event.file_ref).await?;
        self.attach_photo(user, pending, &bytes, Some(event.file_ref.clone()))
            .await?;
        Ok(())
    }

    // -- Review buttons --

    async fn handle_callback(&self, event: &CallbackEvent) -> Result<CallbackAnswer, EngineError> {
        let Some(action) = ReviewAction::parse(&event.data) else {
            debug!("Ignoring callback data {:?}", event.data);
            return Ok(CallbackAnswer::toast("This button is no longer valid."));
        };
        let Some(reviewer) = self.admins.find(event.from.telegram_id).await? else {
            warn!("Non-reviewer {} pressed a review button", event.from.telegram_id);
            return Ok(CallbackAnswer::alert("Only reviewers can do that."));
        };

        let answer = match action {
            ReviewAction::Approve(id) => match self.approve(id, &reviewer, event.message).await? {
                ReviewOutcome::Applied(_) => CallbackAnswer::toast("✅ Approved"),
                ReviewOutcome::AlreadyHandled(status) => already_handled(status.as_str()),
            },
            ReviewAction::Reject(id) => match self
                .begin_rejection(id, &reviewer, event.message)
                .await?
            {
                RejectionPrompt::Prompted { .. } => {
                    CallbackAnswer::toast("Reply to my message with the reason.")
                }
                RejectionPrompt::AlreadyHandled(status) => already_handled(status.as_str()),
            },
        };
        Ok(answer)
    }

    /// Ask the reviewer for a rejection reason with a force-reply prompt and
    /// remember the prompt as the only message a reason may reply to.
    pub(super) async fn prompt_for_reason(
        &self,
        request: &VerificationRequest,
        user: &User,
        reviewer: &User,
        origin: Option<MessageRef>,
    ) -> Result<MessageRef, EngineError> {
        let chat_id = origin.map_or(reviewer.telegram_id, |o| o.chat_id);
        let text = format!(
            "✍️ Why are you rejecting request #{} from {}?\n\n\
             Reply to this message with the reason, or send /cancel.",
            request.short_id(),
            user.display_name
        );
        let options = MessageOptions {
            force_reply: true,
            reply_to: origin.map(|o| o.message_id),
            ..Default::default()
        };
        let message_id = self.outbox.send(chat_id, &text, &options).await?;
        let prompt = MessageRef { chat_id, message_id };

        let state = RejectionState {
            request_id: request.id,
            user: UserSnapshot {
                id: user.id,
                telegram_id: user.telegram_id,
                display_name: user.display_name.clone(),
            },
            origin,
            prompt,
        };
        if let Some(previous) = self.rejections.put(reviewer.telegram_id, state) {
            debug!(request_id = %previous.request_id, "Superseded an unfinished rejection");
        }
        Ok(prompt)
    }

    // -- Free text --

    async fn handle_text(&self, event: &TextEvent) -> Result<(), EngineError> {
        let Some(state) = self.rejections.get(event.from.telegram_id) else {
            return self.hint(event).await;
        };

        // Only a reply to the prompt itself is a reason. Anything else is
        // ordinary chatter and leaves the rejection waiting.
        if event.chat_id != state.prompt.chat_id
            || event.reply_to != Some(state.prompt.message_id)
        {
            debug!(
                request_id = %state.request_id,
                "Text from {} is not a reply to the reason prompt",
                event.from.telegram_id
            );
            return Ok(());
        }

        let Some(reviewer) = self.admins.find(event.from.telegram_id).await? else {
            self.rejections.delete(event.from.telegram_id);
            let text = "You're no longer a reviewer, so the rejection was dropped.";
            self.outbox.send_plain(event.chat_id, text).await?;
            return Ok(());
        };

        let reply = match self
            .reject(state.request_id, &reviewer, &event.text, state.origin)
            .await
        {
            Ok(ReviewOutcome::Applied(_)) => {
                self.rejections.delete(event.from.telegram_id);
                format!("❌ Rejection sent to {}.", state.user.display_name)
            }
            Ok(ReviewOutcome::AlreadyHandled(status)) => {
                self.rejections.delete(event.from.telegram_id);
                format!(
                    "That request was already {}. Nothing was changed.",
                    status.as_str()
                )
            }
            // The state stays, so the reviewer can reply again.
            Err(EngineError::EmptyReason) => {
                "The reason can't be empty. Reply to my message with a reason, or send /cancel."
                    .to_string()
            }
            Err(e) => return Err(e),
        };
        self.outbox.send_plain(event.chat_id, &reply).await?;
        Ok(())
    }

    /// Stray text from a user: point them at the commands. Reviewers are
    /// left alone, and the hint is throttled like a command.
    async fn hint(&self, event: &TextEvent) -> Result<(), EngineError> {
        if self.admins.is_reviewer(event.from.telegram_id).await? {
            return Ok(());
        }
        if !self.limiter.allow(event.from.telegram_id, self.config.command_limit) {
            return Ok(());
        }
        self.outbox
            .send_plain(
                event.chat_id,
                "Send /start to begin verification, or /help to see what I can do.",
            )
            .await?;
        Ok(())
    }

    // -- Replies --

    fn shop_button(&self) -> MessageOptions {
        match &self.config.shop_url {
            Some(url) => MessageOptions::with_buttons(vec![vec![Button::Url {
                text: "🛍 Open shop".into(),
                url: url.clone(),
            }]]),
            None => MessageOptions::default(),
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.outbox.send_plain(chat_id, text).await {
            warn!("Could not reply in chat {}: {}", chat_id, e);
        }
    }

    /// Tell the actor what went wrong. Validation problems are their doing
    /// and only logged at debug.
    async fn report(&self, chat_id: i64, what: &str, e: &EngineError) {
        if e.is_validation() {
            debug!("Refused {} in chat {}: {}", what, chat_id, e);
        } else {
            error!("Handling {} in chat {} failed: {}", what, chat_id, e);
        }
        self.reply(chat_id, &failure_message(e)).await;
    }
}

fn already_handled(status: &str) -> CallbackAnswer {
    CallbackAnswer::toast(format!("Already {}.", status))
}

fn failure_message(e: &EngineError) -> String {
    match e {
        EngineError::InvalidPhoto(PhotoError::TooSmall { .. }) => {
            "That image is too small. Please send a clear photo of yourself.".into()
        }
        EngineError::InvalidPhoto(PhotoError::TooLarge { max, .. }) => format!(
            "That image is too large. Please keep it under {} MB.",
            max / (1024 * 1024)
        ),
        EngineError::InvalidPhoto(PhotoError::UnsupportedFormat) => {
            "Please send a JPEG, PNG or WebP photo.".into()
        }
        EngineError::NoPendingRequest => {
            "You don't have a verification in progress. Send /start to get your gesture.".into()
        }
        EngineError::EmptyReason => "The reason can't be empty.".into(),
        EngineError::NoPhotoSubmitted => "No photo has been submitted for this request yet.".into(),
        _ => TRY_AGAIN.into(),
    }
}
