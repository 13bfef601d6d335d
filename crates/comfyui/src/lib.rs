//! ComfyUI REST and WebSocket client library.
//!
//! Provides the HTTP API wrapper used to queue workflows and fetch their
//! outputs, typed history and WebSocket message parsing, retry and
//! reconnection backoff, and the event stream that reports execution
//! progress back to the batch runner.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod retry;
