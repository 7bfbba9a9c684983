use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use handsign_engine::VerificationEngine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Evicts expired conversation state and idle rate-limit windows even when
/// no chat traffic arrives to trigger the opportunistic sweeps.
pub async fn run(engine: Arc<VerificationEngine>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (conversations, windows) = engine.sweep();
                if conversations + windows > 0 {
                    debug!(conversations, windows, "Maintenance sweep evicted expired state");
                }
            }
        }
    }
}
