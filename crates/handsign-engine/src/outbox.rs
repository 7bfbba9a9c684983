use std::sync::Arc;

use crate::error::TransportResult;
use crate::ports::{CallbackAnswer, MessageOptions, PhotoSource, Transport};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Every outbound transport call, routed through the retry executor with the
/// policy for its operation class.
#[derive(Clone)]
pub struct Outbox {
    transport: Arc<dyn Transport>,
    retry: RetryExecutor,
}

impl Outbox {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryExecutor) -> Self {
        Self { transport, retry }
    }

    pub async fn send(
        &self,
        chat_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        let transport = &self.transport;
        self.retry
            .execute(RetryPolicy::SEND, "send_message", move || {
                transport.send_message(chat_id, text, options)
            })
            .await
    }

    pub async fn send_plain(&self, chat_id: i64, text: &str) -> TransportResult<i64> {
        self.send(chat_id, text, &MessageOptions::default()).await
    }

    pub async fn send_photo(
        &self,
        chat_id: i64,
        photo: &PhotoSource,
        caption: &str,
        options: &MessageOptions,
    ) -> TransportResult<i64> {
        let transport = &self.transport;
        self.retry
            .execute(RetryPolicy::SEND, "send_photo", move || {
                transport.send_photo(chat_id, photo, caption, options)
            })
            .await
    }

    pub async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        options: &MessageOptions,
    ) -> TransportResult<()> {
        let transport = &self.transport;
        self.retry
            .execute(RetryPolicy::SEND, "edit_message", move || {
                transport.edit_message(chat_id, message_id, text, options)
            })
            .await
    }

    pub async fn acknowledge(
        &self,
        callback_id: &str,
        answer: &CallbackAnswer,
    ) -> TransportResult<()> {
        let transport = &self.transport;
        self.retry
            .execute(RetryPolicy::ACK, "answer_callback", move || {
                transport.acknowledge_callback(callback_id, answer)
            })
            .await
    }

    pub async fn download(&self, file_ref: &str) -> TransportResult<Vec<u8>> {
        let transport = &self.transport;
        self.retry
            .execute(RetryPolicy::SEND, "download_file", move || transport.download_file(file_ref))
            .await
    }
}
