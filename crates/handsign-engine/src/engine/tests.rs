use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use handsign_types::models::Role;

use super::*;
use crate::events::{CallbackEvent, CommandEvent, PhotoEvent, ReviewAction, TextEvent};
use crate::gestures::Gesture;
use crate::nullables::{
    Audience, MemoryPhotoStore, MemoryStore, RecordingPublisher, RecordingTransport, jpeg,
};
use crate::photos::{MAX_PHOTO_BYTES, MagicNumberValidator};
use crate::ports::{Button, CallbackAnswer, PhotoSource};

const U1: i64 = 100;
const R1: i64 = 900;
const R2: i64 = 901;

struct World {
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
    publisher: Arc<RecordingPublisher>,
    photos: Arc<MemoryPhotoStore>,
    engine: Arc<VerificationEngine>,
    r1: User,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let photos = Arc::new(MemoryPhotoStore::new());
    let r1 = store.add_user(R1, "R1", Role::Admin);
    store.add_user(R2, "R2", Role::Staff);

    let config = EngineConfig {
        gestures: vec![Gesture::new("✌️", "peace sign")],
        shop_url: Some("https://shop.example".into()),
        ..Default::default()
    };
    let engine = VerificationEngine::new(
        Collaborators {
            store: store.clone(),
            transport: transport.clone(),
            publisher: publisher.clone(),
            photos: photos.clone(),
            validator: Arc::new(MagicNumberValidator::default()),
        },
        config,
        CancellationToken::new(),
    );

    World {
        store,
        transport,
        publisher,
        photos,
        engine: Arc::new(engine),
        r1,
    }
}

fn sender(telegram_id: i64, name: &str) -> Sender {
    Sender {
        telegram_id,
        display_name: name.into(),
    }
}

fn command(from: i64, name: &str, command: &str) -> CommandEvent {
    CommandEvent {
        chat_id: from,
        from: sender(from, name),
        command: command.into(),
    }
}

fn press(reviewer: i64, name: &str, data: String, card: i64) -> CallbackEvent {
    CallbackEvent {
        callback_id: format!("cb-{}-{}", reviewer, card),
        from: sender(reviewer, name),
        message: Some(MessageRef {
            chat_id: reviewer,
            message_id: card,
        }),
        data,
    }
}

fn reply(reviewer: i64, text: &str, reply_to: Option<i64>) -> TextEvent {
    TextEvent {
        chat_id: reviewer,
        message_id: 5000,
        from: sender(reviewer, "R1"),
        text: text.into(),
        reply_to,
    }
}

impl World {
    async fn u1(&self) -> User {
        self.store.find_user_by_identity(U1).await.unwrap().unwrap()
    }

    async fn pending(&self) -> Option<VerificationRequest> {
        let user = self.u1().await;
        self.store.find_pending_request_for_user(user.id).await.unwrap()
    }

    async fn start(&self) -> VerificationRequest {
        self.engine.on_command(command(U1, "U1", "start")).await;
        self.pending().await.unwrap()
    }

    async fn send_photo(&self, bytes: Vec<u8>) {
        self.transport.add_file("file-u1", bytes);
        self.engine
            .on_photo(PhotoEvent {
                chat_id: U1,
                from: sender(U1, "U1"),
                file_ref: "file-u1".into(),
                file_size: None,
            })
            .await;
    }

    /// Start, submit a valid photo, and return the request plus R1's card id.
    async fn submitted(&self) -> (VerificationRequest, i64) {
        self.start().await;
        self.send_photo(jpeg(4096)).await;
        let request = self.pending().await.unwrap();
        let card = self.transport.last_to(R1).unwrap().message_id;
        (request, card)
    }

    fn last_ack(&self) -> CallbackAnswer {
        self.transport.acks().pop().unwrap().1
    }
}

#[tokio::test]
async fn scenario_approve_end_to_end() {
    let w = world();

    let request = w.start().await;
    assert_eq!(request.gesture, "✌️ (peace sign)");
    assert!(w.transport.last_to(U1).unwrap().text.contains("✌️"));
    assert_eq!(w.u1().await.verification_status, VerificationStatus::Pending);

    w.send_photo(jpeg(4096)).await;
    for reviewer in [R1, R2] {
        let card = w.transport.last_to(reviewer).unwrap();
        assert!(card.text.contains("✌️"));
        assert!(card.photo.is_some());
        assert_eq!(card.options.buttons[0].len(), 2);
    }
    assert_eq!(w.photos.len(), 1);

    let card = w.transport.last_to(R1).unwrap().message_id;
    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Approve(request.id).encode(), card))
        .await;

    let u1 = w.u1().await;
    assert_eq!(u1.verification_status, VerificationStatus::Verified);
    assert_eq!(u1.verified_by, Some(w.r1.id));
    assert_eq!(w.store.request(request.id).unwrap().status, RequestStatus::Approved);

    let welcome = w.transport.last_to(U1).unwrap();
    assert!(welcome.text.contains("verified"));
    assert!(matches!(welcome.options.buttons[0][0], Button::Url { .. }));
    assert!(
        w.publisher
            .events_for(&Audience::User(u1.id))
            .contains(&"verification:approved".to_string())
    );
    assert_eq!(w.last_ack().text.as_deref(), Some("✅ Approved"));
    assert!(w.transport.edits().iter().any(|e| e.message_id == card));
}

#[tokio::test]
async fn scenario_reject_with_reason() {
    let w = world();
    let (request, card) = w.submitted().await;

    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Reject(request.id).encode(), card))
        .await;
    let prompt = w.transport.last_to(R1).unwrap();
    assert!(prompt.options.force_reply);
    assert_eq!(prompt.options.reply_to, Some(card));
    assert!(w.store.request(request.id).unwrap().is_pending());
    assert!(w.engine.rejections.get(R1).is_some());

    w.engine
        .on_text(reply(R1, "blurry photo", Some(prompt.message_id)))
        .await;

    let stored = w.store.request(request.id).unwrap();
    assert_eq!(stored.status, RequestStatus::Rejected);
    assert_eq!(stored.rejection_reason.as_deref(), Some("blurry photo"));
    let u1 = w.u1().await;
    assert_eq!(u1.verification_status, VerificationStatus::Rejected);
    assert_eq!(u1.rejection_reason.as_deref(), Some("blurry photo"));
    assert!(w.transport.last_to(U1).unwrap().text.contains("blurry photo"));
    assert!(w.engine.rejections.get(R1).is_none());
    assert!(
        w.publisher
            .events_for(&Audience::Role(Role::Staff))
            .contains(&"verification:rejected".to_string())
    );
}

#[tokio::test]
async fn scenario_reject_then_cancel() {
    let w = world();
    let (request, card) = w.submitted().await;

    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Reject(request.id).encode(), card))
        .await;
    w.engine.on_command(command(R1, "R1", "cancel")).await;

    assert!(w.engine.rejections.get(R1).is_none());
    assert!(w.transport.last_to(R1).unwrap().text.contains("cancelled"));
    let stored = w.store.request(request.id).unwrap();
    assert!(stored.is_pending());
    assert!(stored.reviewer_id.is_none());
    assert_eq!(w.u1().await.verification_status, VerificationStatus::Pending);
}

#[tokio::test]
async fn approving_twice_applies_once() {
    let w = world();
    let (request, _) = w.submitted().await;

    let first = w.engine.approve(request.id, &w.r1, None).await.unwrap();
    let second = w.engine.approve(request.id, &w.r1, None).await.unwrap();
    assert!(matches!(first, ReviewOutcome::Applied(_)));
    assert!(matches!(second, ReviewOutcome::AlreadyHandled(RequestStatus::Approved)));

    let u1 = w.u1().await;
    let approvals = w
        .publisher
        .events_for(&Audience::User(u1.id))
        .into_iter()
        .filter(|e| e == "verification:approved")
        .count();
    assert_eq!(approvals, 1);
}

#[tokio::test]
async fn duplicate_button_press_is_answered_as_handled() {
    let w = world();
    let (request, card) = w.submitted().await;
    let data = ReviewAction::Approve(request.id).encode();

    w.engine.on_callback(press(R1, "R1", data.clone(), card)).await;
    w.engine.on_callback(press(R1, "R1", data, card)).await;

    assert_eq!(w.last_ack().text.as_deref(), Some("Already approved."));
    assert!(!w.last_ack().show_alert);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_reviewers_resolve_exactly_once() {
    let w = world();
    let (request, _) = w.submitted().await;
    let id = request.id;
    let r2 = w.store.find_user_by_identity(R2).await.unwrap().unwrap();

    let approve = {
        let engine = w.engine.clone();
        let r1 = w.r1.clone();
        tokio::spawn(async move { engine.approve(id, &r1, None).await })
    };
    let reject = {
        let engine = w.engine.clone();
        tokio::spawn(async move { engine.reject(id, &r2, "wrong gesture", None).await })
    };

    let outcomes = [approve.await.unwrap().unwrap(), reject.await.unwrap().unwrap()];
    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, ReviewOutcome::Applied(_)))
        .count();
    assert_eq!(applied, 1);

    // Whichever won, the user mirrors it.
    let stored = w.store.request(request.id).unwrap();
    assert_eq!(w.u1().await.verification_status, stored.status.user_status());
}

#[tokio::test]
async fn start_is_idempotent_while_pending() {
    let w = world();
    let first = w.start().await;
    let second = w.start().await;

    assert_eq!(first.id, second.id);
    assert_eq!(w.store.pending_count(w.u1().await.id), 1);
    assert!(w.transport.last_to(U1).unwrap().text.contains("already have a verification"));
}

#[tokio::test]
async fn restart_after_rejection_opens_a_new_request() {
    let w = world();
    let (request, _) = w.submitted().await;
    w.engine
        .reject(request.id, &w.r1, "blurry photo", None)
        .await
        .unwrap();

    let again = w.start().await;
    assert_ne!(again.id, request.id);

    let u1 = w.u1().await;
    assert_eq!(u1.verification_status, VerificationStatus::Pending);
    assert_eq!(u1.rejection_reason, None);
    assert_eq!(w.store.pending_count(u1.id), 1);
    // The old request keeps its audit trail.
    assert_eq!(
        w.store.request(request.id).unwrap().rejection_reason.as_deref(),
        Some("blurry photo")
    );
}

#[tokio::test]
async fn verified_user_is_not_given_a_new_request() {
    let w = world();
    let (request, _) = w.submitted().await;
    w.engine.approve(request.id, &w.r1, None).await.unwrap();

    w.engine.on_command(command(U1, "U1", "start")).await;

    let u1 = w.u1().await;
    assert!(w.transport.last_to(U1).unwrap().text.contains("already verified"));
    assert_eq!(w.store.requests_for(u1.id).len(), 1);
}

#[tokio::test]
async fn photo_without_pending_request_changes_nothing() {
    let w = world();
    w.send_photo(jpeg(4096)).await;

    assert!(w.transport.last_to(U1).unwrap().text.contains("/start"));
    assert!(w.photos.is_empty());
    assert!(w.transport.sent_to(R1).is_empty());
}

#[tokio::test]
async fn invalid_photo_is_refused_without_mutation() {
    let w = world();
    w.start().await;
    w.send_photo(vec![0u8; 4096]).await;

    assert!(w.transport.last_to(U1).unwrap().text.contains("JPEG, PNG or WebP"));
    assert!(!w.pending().await.unwrap().has_photo());
    assert!(w.transport.sent_to(R1).is_empty());

    w.send_photo(jpeg(100)).await;
    assert!(w.transport.last_to(U1).unwrap().text.contains("too small"));
}

#[tokio::test]
async fn oversize_photo_is_refused_before_download() {
    let w = world();
    w.start().await;
    w.transport.add_file("file-u1", jpeg(4096));
    w.engine
        .on_photo(PhotoEvent {
            chat_id: U1,
            from: sender(U1, "U1"),
            file_ref: "file-u1".into(),
            file_size: Some(MAX_PHOTO_BYTES as u64 + 1),
        })
        .await;

    assert_eq!(w.transport.downloads(), 0);
    assert!(w.transport.last_to(U1).unwrap().text.contains("too large"));
    assert!(!w.pending().await.unwrap().has_photo());
    assert!(w.photos.is_empty());
}

#[tokio::test]
async fn resubmitting_replaces_photo_on_same_request() {
    let w = world();
    let (first, _) = w.submitted().await;
    let first_ref = first.photo_ref.clone().unwrap();

    w.send_photo(jpeg(5000)).await;

    let second = w.pending().await.unwrap();
    assert_eq!(second.id, first.id);
    assert_ne!(second.photo_ref.as_deref(), Some(first_ref.as_str()));
    assert_eq!(w.store.pending_count(w.u1().await.id), 1);
    assert_eq!(w.photos.len(), 2);
    assert_eq!(
        w.publisher.events_for(&Audience::Role(Role::Staff)),
        vec!["verification:new", "verification:new"]
    );
    // Both reviewers get a fresh card for the new photo.
    assert_eq!(w.transport.sent_to(R2).iter().filter(|m| m.photo.is_some()).count(), 2);
}

#[tokio::test]
async fn review_requires_a_submitted_photo() {
    let w = world();
    let request = w.start().await;

    assert!(matches!(
        w.engine.approve(request.id, &w.r1, None).await,
        Err(EngineError::NoPhotoSubmitted)
    ));
    assert!(matches!(
        w.engine.reject(request.id, &w.r1, "no photo", None).await,
        Err(EngineError::NoPhotoSubmitted)
    ));
    assert!(matches!(
        w.engine.begin_rejection(request.id, &w.r1, None).await,
        Err(EngineError::NoPhotoSubmitted)
    ));

    // A stale or forged button press gets an alert, not a decision.
    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Approve(request.id).encode(), 1))
        .await;
    let ack = w.last_ack();
    assert!(ack.show_alert);
    assert!(ack.text.unwrap().contains("No photo"));

    let stored = w.store.request(request.id).unwrap();
    assert!(stored.is_pending());
    assert!(stored.reviewer_id.is_none());
    assert_eq!(w.u1().await.verification_status, VerificationStatus::Pending);
    assert!(w.engine.rejections.get(R1).is_none());
    assert!(w.publisher.published().is_empty());
}

#[tokio::test]
async fn unrelated_reply_is_not_taken_as_reason() {
    let w = world();
    let (request, card) = w.submitted().await;
    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Reject(request.id).encode(), card))
        .await;
    let prompt = w.transport.last_to(R1).unwrap().message_id;

    w.engine.on_text(reply(R1, "lunch at noon?", Some(card))).await;
    w.engine.on_text(reply(R1, "blurry photo", None)).await;

    assert!(w.store.request(request.id).unwrap().is_pending());
    assert!(w.engine.rejections.get(R1).is_some());

    w.engine.on_text(reply(R1, "blurry photo", Some(prompt))).await;
    assert_eq!(w.store.request(request.id).unwrap().status, RequestStatus::Rejected);
}

#[tokio::test]
async fn empty_reason_keeps_the_rejection_open() {
    let w = world();
    let (request, card) = w.submitted().await;
    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Reject(request.id).encode(), card))
        .await;
    let prompt = w.transport.last_to(R1).unwrap().message_id;

    w.engine.on_text(reply(R1, "   ", Some(prompt))).await;

    assert!(w.transport.last_to(R1).unwrap().text.contains("can't be empty"));
    assert!(w.store.request(request.id).unwrap().is_pending());
    assert!(w.engine.rejections.get(R1).is_some());
}

#[tokio::test(start_paused = true)]
async fn expired_rejection_no_longer_captures_replies() {
    let w = world();
    let (request, card) = w.submitted().await;
    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Reject(request.id).encode(), card))
        .await;
    let prompt = w.transport.last_to(R1).unwrap().message_id;

    tokio::time::advance(Duration::from_secs(301)).await;
    w.engine.on_text(reply(R1, "blurry photo", Some(prompt))).await;

    assert!(w.store.request(request.id).unwrap().is_pending());
    assert_eq!(w.engine.rejections.len(), 0);
}

#[tokio::test]
async fn non_reviewer_cannot_use_review_buttons() {
    let w = world();
    let (request, _) = w.submitted().await;

    w.engine
        .on_callback(press(U1, "U1", ReviewAction::Approve(request.id).encode(), 1))
        .await;

    let ack = w.last_ack();
    assert!(ack.show_alert);
    assert_eq!(ack.text.as_deref(), Some("Only reviewers can do that."));
    assert!(w.store.request(request.id).unwrap().is_pending());
}

#[tokio::test]
async fn store_failure_tells_reviewer_to_retry() {
    let w = world();
    let (request, card) = w.submitted().await;
    w.store.fail_updates(true);

    w.engine
        .on_callback(press(R1, "R1", ReviewAction::Approve(request.id).encode(), card))
        .await;

    let ack = w.last_ack();
    assert!(ack.show_alert);
    assert!(ack.text.unwrap().contains("try again"));
    assert!(w.store.request(request.id).unwrap().is_pending());
    assert!(w.publisher.published().iter().all(|p| p.event != "verification:approved"));
}

#[tokio::test(start_paused = true)]
async fn commands_are_rate_limited() {
    let w = world();
    for _ in 0..11 {
        w.engine.on_command(command(U1, "U1", "status")).await;
    }

    let replies = w.transport.sent_to(U1);
    assert_eq!(replies.len(), 11);
    assert!(replies[9].text.contains("haven't started"));
    assert!(replies[10].text.contains("Too many requests"));
}

#[tokio::test]
async fn web_flow_uses_the_same_transitions() {
    let w = world();
    w.engine.on_command(command(U1, "U1", "start")).await;
    let u1 = w.u1().await;

    let request = w.engine.submit_photo_bytes(u1.id, &jpeg(2048)).await.unwrap();
    assert!(request.has_photo());
    // No transport file, so reviewers get the stored bytes.
    assert!(matches!(
        w.transport.last_to(R1).unwrap().photo,
        Some(PhotoSource::Bytes(_))
    ));

    let status = w.engine.get_status(u1.id).await.unwrap();
    assert_eq!(status.status, VerificationStatus::Pending);
    assert!(status.photo_submitted);
    assert_eq!(status.request_id, Some(request.id));

    let pending = w.engine.pending_reviews().await.unwrap();
    assert_eq!(pending.len(), 1);

    assert!(matches!(w.engine.reviewer(u1.id).await, Err(EngineError::NotReviewer)));
    let reviewer = w.engine.reviewer(w.r1.id).await.unwrap();
    assert!(matches!(
        w.engine.reject(request.id, &reviewer, "", None).await,
        Err(EngineError::EmptyReason)
    ));
    w.engine
        .reject(request.id, &reviewer, "face not visible", None)
        .await
        .unwrap();

    let status = w.engine.get_status(u1.id).await.unwrap();
    assert_eq!(status.status, VerificationStatus::Rejected);
    assert_eq!(status.rejection_reason.as_deref(), Some("face not visible"));
}

#[tokio::test]
async fn pending_command_lists_cards_for_reviewers_only() {
    let w = world();
    w.submitted().await;

    w.engine.on_command(command(R2, "R2", "pending")).await;
    let cards = w.transport.sent_to(R2);
    assert!(cards.iter().any(|m| m.text.contains("1 request(s) waiting")));
    assert!(cards.last().unwrap().text.contains("✌️"));

    w.engine.on_command(command(U1, "U1", "pending")).await;
    assert!(w.transport.last_to(U1).unwrap().text.contains("reviewers only"));
}
