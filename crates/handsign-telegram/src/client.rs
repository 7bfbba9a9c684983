use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};

use handsign_engine::error::{TransportError, TransportResult};
use handsign_engine::ports::{Button, CallbackAnswer, MessageOptions, PhotoSource, Transport};

use crate::types::{
    AnswerCallbackQuery, ApiResponse, EditMessageCaption, EditMessageText, File, GetFile,
    GetUpdates, Message, ReplyParameters, SendMessage, SendPhoto, Update,
};

/// Seconds a `getUpdates` call may hang waiting for updates.
pub const LONG_POLL_SECS: u64 = 25;

/// Bot API client. The token only ever appears in request URLs, never in logs.
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            // Long polls hold the request open; leave room on top of them.
            .timeout(Duration::from_secs(LONG_POLL_SECS + 15))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.token, file_path)
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        body: &B,
    ) -> TransportResult<T> {
        trace!("Bot API {}", method);
        let response = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| network_error(method, e))?;
        read_response(method, response).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> TransportResult<T> {
        trace!("Bot API {} (multipart)", method);
        let response = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(method, e))?;
        read_response(method, response).await
    }

    /// Fetch updates after `offset`, waiting up to `timeout_secs` for some to arrive.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> TransportResult<Vec<Update>> {
        let body = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["message", "callback_query"],
        };
        self.call("getUpdates", &body).await
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        let body = SendMessage {
            chat_id,
            text,
            reply_markup: reply_markup(options),
            reply_parameters: reply_parameters(options),
        };
        let message: Message = self.call("sendMessage", &body).await?;
        Ok(message.message_id)
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo: &PhotoSource,
        caption: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        let message: Message = match photo {
            PhotoSource::FileId(file_id) => {
                let body = SendPhoto {
                    chat_id,
                    photo: file_id,
                    caption,
                    reply_markup: reply_markup(options),
                    reply_parameters: reply_parameters(options),
                };
                self.call("sendPhoto", &body).await?
            }
            PhotoSource::Bytes(bytes) => {
                // Forms are consumed by sending, so build one per attempt.
                let mut form = Form::new()
                    .text("chat_id", chat_id.to_string())
                    .text("caption", caption.to_string())
                    .part("photo", Part::bytes(bytes.clone()).file_name("photo.jpg"));
                if let Some(markup) = reply_markup(options) {
                    form = form.text("reply_markup", markup.to_string());
                }
                self.call_multipart("sendPhoto", form).await?
            }
        };
        Ok(message.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<()> {
        // An empty inline keyboard removes the buttons.
        let markup = reply_markup(options).unwrap_or_else(|| json!({ "inline_keyboard": [] }));
        let result: TransportResult<serde_json::Value> = if options.caption {
            let body = EditMessageCaption {
                chat_id,
                message_id,
                caption: text,
                reply_markup: markup,
            };
            self.call("editMessageCaption", &body).await
        } else {
            let body = EditMessageText {
                chat_id,
                message_id,
                text,
                reply_markup: markup,
            };
            self.call("editMessageText", &body).await
        };

        match result {
            Ok(_) => Ok(()),
            Err(TransportError::Client { description, .. })
                if description.contains("message is not modified") =>
            {
                debug!("Message {} already up to date", message_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn acknowledge_callback(
        &self,
        callback_id: &str,
        answer: &CallbackAnswer,
    ) -> TransportResult<()> {
        let body = AnswerCallbackQuery {
            callback_query_id: callback_id,
            text: answer.text.as_deref(),
            show_alert: answer.show_alert,
        };
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn download_file(&self, file_ref: &str) -> TransportResult<Vec<u8>> {
        let file: File = self.call("getFile", &GetFile { file_id: file_ref }).await?;
        let Some(path) = file.file_path else {
            return Err(TransportError::from_status(
                400,
                format!("file {} has no download path", file.file_id),
                None,
            ));
        };

        let response = self
            .http
            .get(self.file_url(&path))
            .send()
            .await
            .map_err(|e| network_error("download", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::from_status(
                status.as_u16(),
                format!("file download failed with {}", status),
                None,
            ));
        }
        let bytes = response.bytes().await.map_err(|e| network_error("download", e))?;
        Ok(bytes.to_vec())
    }
}

/// Network-level failures never reached the API and are always worth retrying.
fn network_error(method: &str, e: reqwest::Error) -> TransportError {
    // reqwest includes the URL, and with it the token, in its Display output.
    let e = e.without_url();
    TransportError::transient(format!("{}: {}", method, e))
}

async fn read_response<T: DeserializeOwned>(
    method: &str,
    response: reqwest::Response,
) -> TransportResult<T> {
    let status = response.status();
    let body = response.bytes().await.map_err(|e| network_error(method, e))?;
    decode(method, status, &body)
}

/// Turn an HTTP status plus Bot API envelope into a result, classifying
/// failures by `error_code` (falling back to the HTTP status).
fn decode<T: DeserializeOwned>(
    method: &str,
    status: StatusCode,
    body: &[u8],
) -> TransportResult<T> {
    let envelope: ApiResponse<T> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Err(TransportError::from_status(
                status.as_u16(),
                format!("{}: unreadable response ({}): {}", method, status, e),
                None,
            ));
        }
    };

    if envelope.ok {
        return envelope.result.ok_or_else(|| {
            TransportError::transient(format!("{}: ok response without a result", method))
        });
    }

    let code = envelope.error_code.unwrap_or(status.as_u16());
    let description = envelope
        .description
        .unwrap_or_else(|| format!("{} failed with {}", method, code));
    let retry_after = envelope
        .parameters
        .and_then(|p| p.retry_after)
        .map(Duration::from_secs);
    Err(TransportError::from_status(code, description, retry_after))
}

fn reply_markup(options: &MessageOptions) -> Option<serde_json::Value> {
    if options.force_reply {
        return Some(json!({ "force_reply": true, "selective": true }));
    }
    if options.buttons.is_empty() {
        return None;
    }
    let rows: Vec<Vec<serde_json::Value>> = options
        .buttons
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match button {
                    Button::Callback { text, data } => {
                        json!({ "text": text, "callback_data": data })
                    }
                    Button::Url { text, url } => json!({ "text": text, "url": url }),
                })
                .collect()
        })
        .collect();
    Some(json!({ "inline_keyboard": rows }))
}

fn reply_parameters(options: &MessageOptions) -> Option<ReplyParameters> {
    options.reply_to.map(|message_id| ReplyParameters {
        message_id,
        allow_sending_without_reply: true,
    })
}
