//! Exponential-backoff reconnection for the ComfyUI WebSocket.
//!
//! When the socket drops, [`reconnect_loop`] keeps retrying with growing
//! delays until the connection is restored or the [`CancellationToken`]
//! fires. Delays follow the same policy as HTTP retries.

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::retry::{next_delay, RetryConfig};

/// Attempt to reconnect with exponential backoff.
///
/// `config.max_attempts` is ignored; reconnects continue until success or
/// cancellation. Returns `None` when cancelled.
pub async fn reconnect_loop(
    client: &ComfyUIClient,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        tracing::info!(
            client_id = %client.client_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to ComfyUI",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id = %client.client_id(), "Reconnect cancelled");
                return None;
            }
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(attempt, "Reconnected to ComfyUI");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect attempt {attempt} failed");
                }
            }
        }

        delay = next_delay(delay, config);
    }
}
