use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A message in a chat, as addressed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Who a pending rejection is about, captured when the reviewer pressed reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub id: Uuid,
    pub telegram_id: i64,
    pub display_name: String,
}

/// A reviewer half-way through rejecting a request: the reason is still owed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionState {
    pub request_id: Uuid,
    pub user: UserSnapshot,
    /// The review card the reviewer pressed, edited once the outcome is known.
    pub origin: Option<MessageRef>,
    /// The reason prompt. Only replies to this exact message count as the reason.
    pub prompt: MessageRef,
}

/// Ephemeral per-reviewer state for multi-turn chat interactions.
///
/// Entries expire after the TTL. There is no background timer: `sweep` is
/// meant to run at the top of every inbound event handler, and `get` never
/// returns an expired entry either way.
pub struct ConversationStore<S> {
    ttl: Duration,
    entries: Mutex<HashMap<i64, Entry<S>>>,
}

struct Entry<S> {
    state: S,
    created_at: Instant,
}

impl<S: Clone> ConversationStore<S> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store state for a reviewer, returning whatever it superseded.
    pub fn put(&self, reviewer: i64, state: S) -> Option<S> {
        let entry = Entry {
            state,
            created_at: Instant::now(),
        };
        self.lock()
            .insert(reviewer, entry)
            .filter(|old| !self.expired(old))
            .map(|old| old.state)
    }

    pub fn get(&self, reviewer: i64) -> Option<S> {
        let mut entries = self.lock();
        match entries.get(&reviewer) {
            Some(entry) if self.expired(entry) => {
                entries.remove(&reviewer);
                None
            }
            Some(entry) => Some(entry.state.clone()),
            None => None,
        }
    }

    pub fn delete(&self, reviewer: i64) -> Option<S> {
        self.lock()
            .remove(&reviewer)
            .filter(|entry| !self.expired(entry))
            .map(|entry| entry.state)
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &Entry<S>) -> bool {
        entry.created_at.elapsed() >= self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Entry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
