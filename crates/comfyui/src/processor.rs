//! WebSocket message processing.
//!
//! Reads frames from a ComfyUI WebSocket connection, parses them into
//! [`ComfyUIMessage`] variants and emits [`ComfyUIEvent`]s on a broadcast
//! channel. [`run_event_stream`] wraps this in a connect/reconnect loop.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, WsStream};
use crate::events::ComfyUIEvent;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::reconnect_loop;
use crate::retry::RetryConfig;

/// Broadcast channel capacity for execution events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Process messages until the socket closes, errors, or `cancel` fires.
///
/// Binary frames (live previews) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    event_tx: &broadcast::Sender<ComfyUIEvent>,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_text_message(&text, event_tx),
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        }
    }
}

/// Translate one text frame into zero or one event.
fn handle_text_message(text: &str, event_tx: &broadcast::Sender<ComfyUIEvent>) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Custom nodes send their own message types.
            tracing::debug!(error = %e, raw_message = %text, "Unhandled ComfyUI message");
            return;
        }
    };

    tracing::trace!(prompt_id = ?msg.prompt_id(), "ComfyUI message");
    if let Some(event) = to_event(msg) {
        // No receivers is fine: nobody is waiting right now.
        let _ = event_tx.send(event);
    }
}

pub fn to_event(msg: ComfyUIMessage) -> Option<ComfyUIEvent> {
    match msg {
        ComfyUIMessage::Status(data) => Some(ComfyUIEvent::QueueStatus {
            queue_remaining: data.status.exec_info.queue_remaining,
        }),
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
            Some(ComfyUIEvent::ExecutionStarted {
                prompt_id: data.prompt_id,
            })
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                cached = data.nodes.len(),
                "Execution used cache",
            );
            None
        }
        ComfyUIMessage::Executing(data) => match (data.node, data.prompt_id) {
            (Some(node), prompt_id) => {
                tracing::debug!(prompt_id = ?prompt_id, node = %node, "Executing node");
                None
            }
            (None, Some(prompt_id)) => {
                tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
                Some(ComfyUIEvent::ExecutionCompleted { prompt_id })
            }
            (None, None) => None,
        },
        ComfyUIMessage::Progress(data) => Some(ComfyUIEvent::Progress {
            percent: data.percent(),
            prompt_id: data.prompt_id,
            current_node: data.node,
        }),
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                "Node executed with output",
            );
            None
        }
        ComfyUIMessage::ExecutionSuccess(data) => Some(ComfyUIEvent::ExecutionCompleted {
            prompt_id: data.prompt_id,
        }),
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            let error = if data.node_type.is_empty() {
                data.exception_message.trim().to_string()
            } else {
                format!("{}: {}", data.node_type, data.exception_message.trim())
            };
            Some(ComfyUIEvent::ExecutionFailed {
                prompt_id: data.prompt_id,
                error,
            })
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::warn!(prompt_id = %data.prompt_id, "Execution interrupted");
            Some(ComfyUIEvent::ExecutionInterrupted {
                prompt_id: data.prompt_id,
            })
        }
    }
}

/// Connect, process messages, and reconnect on drop until cancelled.
///
/// Connection failures never end the loop; callers fall back to history
/// polling while the socket is down.
pub async fn run_event_stream(
    client: &ComfyUIClient,
    event_tx: &broadcast::Sender<ComfyUIEvent>,
    cancel: &CancellationToken,
) {
    let backoff = RetryConfig::default();

    let mut conn = match client.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket unavailable, relying on history polling");
            match reconnect_loop(client, &backoff, cancel).await {
                Some(conn) => conn,
                None => return,
            }
        }
    };

    loop {
        let _ = event_tx.send(ComfyUIEvent::Connected {
            client_id: conn.client_id.clone(),
        });

        process_messages(&mut conn.ws_stream, event_tx, cancel).await;

        let _ = event_tx.send(ComfyUIEvent::Disconnected {
            client_id: conn.client_id.clone(),
        });

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!("Connection lost, entering reconnect loop");
        conn = match reconnect_loop(client, &backoff, cancel).await {
            Some(conn) => conn,
            None => return,
        };
    }
}
