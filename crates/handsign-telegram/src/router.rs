//! Maps raw Bot API updates onto engine events.

use handsign_engine::conversation::MessageRef;
use handsign_engine::events::{CallbackEvent, CommandEvent, PhotoEvent, Sender, TextEvent};

use crate::types::{Message, TgUser, Update};

#[derive(Debug, Clone)]
pub enum Inbound {
    Command(CommandEvent),
    Photo(PhotoEvent),
    Callback(CallbackEvent),
    Text(TextEvent),
}

/// Returns `None` for updates the bot does not act on: bot senders,
/// anonymous messages, stickers and the like.
pub fn route(update: Update) -> Option<Inbound> {
    if let Some(query) = update.callback_query {
        if query.from.is_bot {
            return None;
        }
        let message = query.message.as_ref().map(|m| MessageRef {
            chat_id: m.chat.id,
            message_id: m.message_id,
        });
        return Some(Inbound::Callback(CallbackEvent {
            callback_id: query.id,
            from: sender(&query.from),
            message,
            data: query.data.unwrap_or_default(),
        }));
    }

    let message = update.message?;
    let from = message.from.as_ref().filter(|u| !u.is_bot)?;
    let from = sender(from);
    route_message(message, from)
}

fn route_message(message: Message, from: Sender) -> Option<Inbound> {
    let chat_id = message.chat.id;

    // Telegram sends several sizes; the last one is the largest.
    if let Some(largest) = message.photo.as_ref().and_then(|sizes| sizes.last()) {
        return Some(Inbound::Photo(PhotoEvent {
            chat_id,
            from,
            file_ref: largest.file_id.clone(),
            file_size: largest.file_size,
        }));
    }

    // Images sent "as file" arrive as documents.
    if let Some(document) = message
        .document
        .as_ref()
        .filter(|d| d.mime_type.as_deref().is_some_and(|m| m.starts_with("image/")))
    {
        return Some(Inbound::Photo(PhotoEvent {
            chat_id,
            from,
            file_ref: document.file_id.clone(),
            file_size: document.file_size,
        }));
    }

    let text = message.text?;
    if let Some(command) = parse_command(&text) {
        return Some(Inbound::Command(CommandEvent { chat_id, from, command }));
    }

    Some(Inbound::Text(TextEvent {
        chat_id,
        message_id: message.message_id,
        from,
        text,
        reply_to: message.reply_to_message.map(|m| m.message_id),
    }))
}

/// `/Start@HandsignBot  foo bar` becomes `"start"`. No command takes
/// arguments, so anything after the name is dropped.
fn parse_command(text: &str) -> Option<String> {
    let rest = text.trim().strip_prefix('/')?;
    let head = rest.split(char::is_whitespace).next().unwrap_or(rest);
    let name = head.split('@').next().unwrap_or(head);
    if name.is_empty() {
        return None;
    }
    Some(name.to_lowercase())
}

fn sender(user: &TgUser) -> Sender {
    Sender {
        telegram_id: user.id,
        display_name: user.display_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("/start"), Some("start".into()));
        assert_eq!(parse_command("/Pending@HandsignBot  now please"), Some("pending".into()));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }

    #[test]
    fn routes_largest_photo() {
        let inbound = route(update(
            r#"{"update_id":1,"message":{"message_id":5,
                "from":{"id":100,"is_bot":false,"first_name":"Ada"},
                "chat":{"id":100},"photo":[{"file_id":"s","width":90,"height":90},
                {"file_id":"l","width":1280,"height":1280,"file_size":5000}]}}"#,
        ));
        match inbound {
            Some(Inbound::Photo(event)) => {
                assert_eq!(event.file_ref, "l");
                assert_eq!(event.file_size, Some(5000));
                assert_eq!(event.from.display_name, "Ada");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn image_documents_count_as_photos() {
        let inbound = route(update(
            r#"{"update_id":1,"message":{"message_id":5,"from":{"id":100,"first_name":"Ada"},
                "chat":{"id":100},"document":{"file_id":"doc","mime_type":"image/png"}}}"#,
        ));
        assert!(matches!(inbound, Some(Inbound::Photo(ref e)) if e.file_ref == "doc"));

        let inbound = route(update(
            r#"{"update_id":1,"message":{"message_id":5,"from":{"id":100,"first_name":"Ada"},
                "chat":{"id":100},"document":{"file_id":"doc","mime_type":"application/pdf"}}}"#,
        ));
        assert!(inbound.is_none());
    }

    #[test]
    fn replies_keep_their_target() {
        let inbound = route(update(
            r#"{"update_id":1,"message":{"message_id":6,"from":{"id":900,"first_name":"Rita"},
                "chat":{"id":900},"text":"blurry photo",
                "reply_to_message":{"message_id":1001,"chat":{"id":900}}}}"#,
        ));
        match inbound {
            Some(Inbound::Text(event)) => {
                assert_eq!(event.reply_to, Some(1001));
                assert_eq!(event.text, "blurry photo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn callbacks_carry_their_message() {
        let inbound = route(update(
            r#"{"update_id":1,"callback_query":{"id":"cb1","from":{"id":900,"first_name":"Rita"},
                "message":{"message_id":77,"chat":{"id":900}},"data":"approve:x"}}"#,
        ));
        match inbound {
            Some(Inbound::Callback(event)) => {
                assert_eq!(event.callback_id, "cb1");
                assert_eq!(event.message, Some(MessageRef { chat_id: 900, message_id: 77 }));
                assert_eq!(event.data, "approve:x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ignores_bots_and_anonymous_messages() {
        assert!(route(update(
            r#"{"update_id":1,"message":{"message_id":5,
                "from":{"id":1,"is_bot":true,"first_name":"B"},
                "chat":{"id":1},"text":"/start"}}"#,
        ))
        .is_none());
        let anonymous = r#"{"update_id":1,"message":{"message_id":5,"chat":{"id":1},"text":"hi"}}"#;
        assert!(route(update(anonymous)).is_none());
    }
}
