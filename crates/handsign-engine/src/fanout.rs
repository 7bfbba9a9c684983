use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use handsign_types::events::{VerificationEvent, VerificationPayload};
use handsign_types::models::{Role, User, VerificationRequest};

use crate::admin_directory::AdminDirectory;
use crate::conversation::MessageRef;
use crate::error::TransportError;
use crate::events::ReviewAction;
use crate::outbox::Outbox;
use crate::ports::{Button, MessageOptions, PhotoSource, PhotoStore, RealtimePublisher};

/// The reviewer behind a decision and the card they acted on, if any.
#[derive(Debug, Clone, Copy)]
pub struct ReviewContext<'a> {
    pub reviewer: &'a User,
    pub origin: Option<MessageRef>,
}

/// Broadcasts a verification outcome over every notification channel.
///
/// Channels run concurrently and independently. A failing channel is logged
/// and skipped; `announce` itself never fails, because by the time it runs the
/// state transition has already been committed.
pub struct NotificationFanout {
    outbox: Outbox,
    publisher: Arc<dyn RealtimePublisher>,
    admins: Arc<AdminDirectory>,
    photos: Arc<dyn PhotoStore>,
    shop_url: Option<String>,
}

impl NotificationFanout {
    pub fn new(
        outbox: Outbox,
        publisher: Arc<dyn RealtimePublisher>,
        admins: Arc<AdminDirectory>,
        photos: Arc<dyn PhotoStore>,
        shop_url: Option<String>,
    ) -> Self {
        Self {
            outbox,
            publisher,
            admins,
            photos,
            shop_url,
        }
    }

    pub async fn announce(
        &self,
        event: VerificationEvent,
        request: &VerificationRequest,
        user: &User,
        review: Option<ReviewContext<'_>>,
    ) {
        debug!(request_id = %request.id, event = event.name(), "Fanning out");
        tokio::join!(
            self.update_origin(event, request, user, review),
            self.notify_user(event, request, user),
            self.notify_reviewers(event, request, user, review),
            self.publish(event, request, user),
        );
    }

    /// Channel 1: rewrite the card the reviewer pressed so the buttons go away.
    async fn update_origin(
        &self,
        event: VerificationEvent,
        request: &VerificationRequest,
        user: &User,
        review: Option<ReviewContext<'_>>,
    ) {
        let Some(ReviewContext {
            reviewer,
            origin: Some(origin),
        }) = review
        else {
            return;
        };
        let text = format!(
            "{}\n\n{}",
            review_card(request, user),
            outcome_line(event, request, reviewer)
        );

        // Cards are usually photos, so try the caption first; a text card
        // (photo unavailable when it was sent) needs a plain text edit.
        let caption = MessageOptions {
            caption: true,
            ..Default::default()
        };
        let edited = match self
            .outbox
            .edit(origin.chat_id, origin.message_id, &text, &caption)
            .await
        {
            Err(TransportError::Client { .. }) => {
                self.outbox
                    .edit(origin.chat_id, origin.message_id, &text, &MessageOptions::default())
                    .await
            }
            other => other,
        };

        if let Err(e) = edited {
            warn!("Could not edit review card {}: {}", origin.message_id, e);
            let follow_up = outcome_line(event, request, reviewer);
            if let Err(e) = self.outbox.send_plain(origin.chat_id, &follow_up).await {
                warn!("Could not send follow-up to reviewer {}: {}", reviewer.telegram_id, e);
            }
        }
    }

    /// Channel 2: tell the submitting user.
    async fn notify_user(
        &self,
        event: VerificationEvent,
        request: &VerificationRequest,
        user: &User,
    ) {
        let (text, options) = match event {
            VerificationEvent::New => (
                "📸 Photo received! A reviewer will check it shortly.\n\n\
                 Use /status to see where things stand."
                    .to_string(),
                MessageOptions::default(),
            ),
            VerificationEvent::Approved => {
                let buttons = match &self.shop_url {
                    Some(url) => vec![vec![Button::Url {
                        text: "🛍 Open shop".into(),
                        url: url.clone(),
                    }]],
                    None => Vec::new(),
                };
                (
                    format!(
                        "✅ You're verified, {}!\n\n\
                         Your account is unlocked. Welcome to the shop.",
                        user.display_name
                    ),
                    MessageOptions::with_buttons(buttons),
                )
            }
            VerificationEvent::Rejected => (
                format!(
                    "❌ Your verification was not approved.\n\n\
                     Reason: {}\n\n\
                     Send /start to try again with a new gesture.",
                    request.rejection_reason.as_deref().unwrap_or("not given")
                ),
                MessageOptions::default(),
            ),
        };

        if let Err(e) = self.outbox.send(user.telegram_id, &text, &options).await {
            warn!("Could not notify user {} of {}: {}", user.telegram_id, event.name(), e);
        }
    }

    /// Channel 3: every reviewer except the one who acted.
    async fn notify_reviewers(
        &self,
        event: VerificationEvent,
        request: &VerificationRequest,
        user: &User,
        review: Option<ReviewContext<'_>>,
    ) {
        let reviewers = match self.admins.list().await {
            Ok(reviewers) => reviewers,
            Err(e) => {
                warn!("Could not load reviewers for {}: {}", event.name(), e);
                return;
            }
        };
        let acting = review.map(|r| r.reviewer.telegram_id);
        let targets: Vec<&User> = reviewers
            .iter()
            .filter(|r| Some(r.telegram_id) != acting)
            .collect();
        if targets.is_empty() {
            return;
        }

        match (event, review) {
            (VerificationEvent::New, _) => {
                let photo = self.card_photo(request).await;
                let card = review_card(request, user);
                let options = MessageOptions::with_buttons(review_buttons(request));
                join_all(
                    targets
                        .iter()
                        .map(|r| self.send_card(r, photo.as_ref(), &card, &options)),
                )
                .await;
            }
            (_, Some(ctx)) => {
                let line = format!(
                    "{}\n{}",
                    outcome_line(event, request, ctx.reviewer),
                    summary(request, user)
                );
                join_all(targets.iter().map(|r| self.send_summary(r, &line))).await;
            }
            (_, None) => {
                let line = format!(
                    "Request #{} is now {}.\n{}",
                    request.short_id(),
                    request.status.as_str(),
                    summary(request, user)
                );
                join_all(targets.iter().map(|r| self.send_summary(r, &line))).await;
            }
        }
    }

    async fn send_card(
        &self,
        reviewer: &User,
        photo: Option<&PhotoSource>,
        card: &str,
        options: &MessageOptions,
    ) {
        let sent = match photo {
            Some(photo) => self.outbox.send_photo(reviewer.telegram_id, photo, card, options).await,
            None => self.outbox.send(reviewer.telegram_id, card, options).await,
        };
        if let Err(e) = sent {
            warn!("Could not send review card to {}: {}", reviewer.telegram_id, e);
        }
    }

    async fn send_summary(&self, reviewer: &User, line: &str) {
        if let Err(e) = self.outbox.send_plain(reviewer.telegram_id, line).await {
            warn!("Could not notify reviewer {}: {}", reviewer.telegram_id, e);
        }
    }

    /// Re-use the transport's copy of the photo when there is one, otherwise
    /// upload the stored bytes. `None` falls back to a text card.
    async fn card_photo(&self, request: &VerificationRequest) -> Option<PhotoSource> {
        if let Some(file_id) = &request.photo_file_id {
            return Some(PhotoSource::FileId(file_id.clone()));
        }
        let photo_ref = request.photo_ref.as_deref()?;
        match self.photos.get(photo_ref).await {
            Ok(bytes) => Some(PhotoSource::Bytes(bytes)),
            Err(e) => {
                warn!("Photo {} unavailable for review card: {}", photo_ref, e);
                None
            }
        }
    }

    /// Channel 4: realtime events for open web sessions.
    async fn publish(&self, event: VerificationEvent, request: &VerificationRequest, user: &User) {
        let payload = match serde_json::to_value(VerificationPayload::new(request, user)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode {} payload: {}", event.name(), e);
                return;
            }
        };

        if let Err(e) = self
            .publisher
            .publish_to_user(user.id, event.name(), payload.clone())
            .await
        {
            warn!("Realtime publish to user {} failed: {}", user.id, e);
        }
        for role in Role::PRIVILEGED {
            if let Err(e) = self
                .publisher
                .publish_to_role(role, event.name(), payload.clone())
                .await
            {
                warn!("Realtime publish to {} failed: {}", role.as_str(), e);
            }
        }
    }
}

/// The review card text shown to reviewers, with the gesture to look for.
pub fn review_card(request: &VerificationRequest, user: &User) -> String {
    let submitted = request
        .submitted_at
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "not yet".into());
    format!(
        "🆕 Verification request #{}\n\nUser: {} (id {})\nGesture: {}\nSubmitted: {}",
        request.short_id(),
        user.display_name,
        user.telegram_id,
        request.gesture,
        submitted
    )
}

pub fn review_buttons(request: &VerificationRequest) -> Vec<Vec<Button>> {
    vec![vec![
        Button::Callback {
            text: "✅ Approve".into(),
            data: ReviewAction::Approve(request.id).encode(),
        },
        Button::Callback {
            text: "❌ Reject".into(),
            data: ReviewAction::Reject(request.id).encode(),
        },
    ]]
}

fn outcome_line(
    event: VerificationEvent,
    request: &VerificationRequest,
    reviewer: &User,
) -> String {
    match event {
        VerificationEvent::Approved => format!("✅ Approved by {}", reviewer.display_name),
        VerificationEvent::Rejected => format!(
            "❌ Rejected by {}: {}",
            reviewer.display_name,
            request.rejection_reason.as_deref().unwrap_or("no reason")
        ),
        VerificationEvent::New => format!("Submitted for review ({})", request.short_id()),
    }
}

fn summary(request: &VerificationRequest, user: &User) -> String {
    format!(
        "Request #{} for {} (gesture {})",
        request.short_id(),
        user.display_name,
        request.gesture
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_directory::DEFAULT_TTL;
    use crate::nullables::{
        Audience, MemoryPhotoStore, MemoryStore, RecordingPublisher, RecordingTransport,
    };
    use crate::ports::Store;
    use crate::retry::RetryExecutor;
    use chrono::Utc;
    use handsign_types::models::RequestStatus;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        publisher: Arc<RecordingPublisher>,
        fanout: NotificationFanout,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let outbox = Outbox::new(transport.clone(), RetryExecutor::new(CancellationToken::new()));
        let admins = Arc::new(AdminDirectory::new(store.clone(), DEFAULT_TTL));
        let fanout = NotificationFanout::new(
            outbox,
            publisher.clone(),
            admins,
            Arc::new(MemoryPhotoStore::new()),
            Some("https://shop.example".into()),
        );
        Harness {
            store,
            transport,
            publisher,
            fanout,
        }
    }

    async fn submitted_request(store: &MemoryStore, user: &User) -> VerificationRequest {
        let crate::ports::CreateRequestOutcome::Created(request) =
            store.create_verification_request(user.id, "✌️ (peace sign)").await.unwrap()
        else {
            panic!("expected a new request");
        };
        store
            .update_verification_request_if_status(
                request.id,
                RequestStatus::Pending,
                crate::ports::RequestUpdate::AttachPhoto {
                    photo_ref: "photo-0".into(),
                    photo_file_id: Some("tg-file-1".into()),
                    submitted_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store.request(request.id).unwrap()
    }

    #[tokio::test]
    async fn new_submission_reaches_every_reviewer_with_buttons() {
        let h = harness();
        let r1 = h.store.add_user(900, "R1", Role::Admin);
        let r2 = h.store.add_user(901, "R2", Role::Staff);
        let user = h.store.add_user(100, "U1", Role::User);
        let request = submitted_request(&h.store, &user).await;

        h.fanout.announce(VerificationEvent::New, &request, &user, None).await;

        for reviewer in [&r1, &r2] {
            let card = h.transport.last_to(reviewer.telegram_id).unwrap();
            assert!(card.text.contains("✌️"));
            assert_eq!(card.photo, Some(PhotoSource::FileId("tg-file-1".into())));
            assert_eq!(card.options.buttons, review_buttons(&request));
        }
        assert!(h.transport.last_to(100).unwrap().text.contains("Photo received"));
        assert_eq!(h.publisher.events_for(&Audience::User(user.id)), vec!["verification:new"]);
        assert_eq!(h.publisher.events_for(&Audience::Role(Role::Staff)), vec!["verification:new"]);
        assert_eq!(h.publisher.events_for(&Audience::Role(Role::Admin)), vec!["verification:new"]);
    }

    #[tokio::test]
    async fn decision_skips_acting_reviewer_and_edits_card() {
        let h = harness();
        let r1 = h.store.add_user(900, "R1", Role::Admin);
        h.store.add_user(901, "R2", Role::Staff);
        let user = h.store.add_user(100, "U1", Role::User);
        let request = submitted_request(&h.store, &user).await;

        let origin = MessageRef {
            chat_id: 900,
            message_id: 55,
        };
        let review = ReviewContext {
            reviewer: &r1,
            origin: Some(origin),
        };
        h.fanout
            .announce(VerificationEvent::Approved, &request, &user, Some(review))
            .await;

        assert!(h.transport.sent_to(900).is_empty());
        assert!(h.transport.last_to(901).unwrap().text.contains("Approved by R1"));

        let edits = h.transport.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].message_id, 55);
        assert!(edits[0].options.caption);
        assert!(edits[0].options.buttons.is_empty());

        let welcome = h.transport.last_to(100).unwrap();
        assert!(welcome.text.contains("verified"));
        assert!(matches!(
            &welcome.options.buttons[0][0],
            Button::Url { url, .. } if url == "https://shop.example"
        ));
    }

    #[tokio::test]
    async fn failed_channel_does_not_block_siblings() {
        let h = harness();
        let r1 = h.store.add_user(900, "R1", Role::Admin);
        h.store.add_user(901, "R2", Role::Staff);
        let user = h.store.add_user(100, "U1", Role::User);
        let request = submitted_request(&h.store, &user).await;

        let blocked =
            TransportError::from_status(403, "Forbidden: bot was blocked by the user", None);
        h.transport.fail_chat(100, blocked);
        h.fanout
            .announce(
                VerificationEvent::Rejected,
                &request,
                &user,
                Some(ReviewContext {
                    reviewer: &r1,
                    origin: None,
                }),
            )
            .await;

        assert!(h.transport.sent_to(100).is_empty());
        assert_eq!(h.transport.sent_to(901).len(), 1);
        assert_eq!(h.publisher.events_for(&Audience::User(user.id)), vec!["verification:rejected"]);
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_follow_up() {
        let h = harness();
        let r1 = h.store.add_user(900, "R1", Role::Admin);
        let user = h.store.add_user(100, "U1", Role::User);
        let request = submitted_request(&h.store, &user).await;
        h.transport.fail_edits(true);

        h.fanout
            .announce(
                VerificationEvent::Approved,
                &request,
                &user,
                Some(ReviewContext {
                    reviewer: &r1,
                    origin: Some(MessageRef {
                        chat_id: 900,
                        message_id: 55,
                    }),
                }),
            )
            .await;

        let follow_up = h.transport.last_to(900).unwrap();
        assert!(follow_up.text.contains("Approved by R1"));
    }
}
