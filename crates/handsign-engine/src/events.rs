//! Inbound chat events, as handed to the engine by the transport dispatcher.

use uuid::Uuid;

use crate::conversation::MessageRef;

/// Who sent an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub telegram_id: i64,
    pub display_name: String,
}

/// `/start`, `/status` and friends. `command` is lowercase, without the slash
/// or bot mention.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub chat_id: i64,
    pub from: Sender,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct PhotoEvent {
    pub chat_id: i64,
    pub from: Sender,
    pub file_ref: String,
    /// Size as reported by the transport, when known.
    pub file_size: Option<u64>,
}

/// An inline button press.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub callback_id: String,
    pub from: Sender,
    /// The message carrying the pressed button.
    pub message: Option<MessageRef>,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct TextEvent {
    pub chat_id: i64,
    pub message_id: i64,
    pub from: Sender,
    pub text: String,
    /// Id of the message this one replies to.
    pub reply_to: Option<i64>,
}

/// Payload of a review button: `approve:<request id>` or `reject:<request id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve(Uuid),
    Reject(Uuid),
}

impl ReviewAction {
    pub fn encode(&self) -> String {
        match self {
            Self::Approve(id) => format!("approve:{}", id),
            Self::Reject(id) => format!("reject:{}", id),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let (verb, id) = data.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match verb {
            "approve" => Some(Self::Approve(id)),
            "reject" => Some(Self::Reject(id)),
            _ => None,
        }
    }
}
