use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use handsign_engine::VerificationEngine;

use crate::client::{LONG_POLL_SECS, TelegramClient};
use crate::router::{Inbound, route};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Long-polls the Bot API and hands each update to the engine on its own task.
pub struct Poller {
    client: Arc<TelegramClient>,
    engine: Arc<VerificationEngine>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        client: Arc<TelegramClient>,
        engine: Arc<VerificationEngine>,
        cancel: CancellationToken,
    ) -> Self {
        Self { client, engine, cancel }
    }

    pub async fn run(self) {
        info!("Telegram poller started");
        let mut offset: i64 = 0;
        let mut backoff = MIN_BACKOFF;

        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.client.get_updates(offset, LONG_POLL_SECS) => result,
            };

            let updates = match batch {
                Ok(updates) => {
                    backoff = MIN_BACKOFF;
                    updates
                }
                Err(e) => {
                    warn!("getUpdates failed: {}, retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(inbound) = route(update) else {
                    continue;
                };
                let engine = self.engine.clone();
                tokio::spawn(dispatch(engine, inbound));
            }
        }

        info!("Telegram poller stopped");
    }
}

async fn dispatch(engine: Arc<VerificationEngine>, inbound: Inbound) {
    match inbound {
        Inbound::Command(event) => {
            debug!("/{} from {}", event.command, event.from.telegram_id);
            engine.on_command(event).await;
        }
        Inbound::Photo(event) => {
            debug!("Photo from {}", event.from.telegram_id);
            engine.on_photo(event).await;
        }
        Inbound::Callback(event) => engine.on_callback(event).await,
        Inbound::Text(event) => engine.on_text(event).await,
    }
}
