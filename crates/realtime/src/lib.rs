//! Hub push channel for todo-sync
//!
//! This crate keeps one long-lived WebSocket connection to a SignalR-style hub,
//! authenticates every (re)connect with a freshly supplied token and forwards
//! server invocations to subscribers.

mod client;
mod error;
mod message;

pub use client::{ConnectionState, HubClientOptions, HubConnection, TokenFactory};
pub use error::RealtimeError;
pub use message::{
    handshake_request, parse_handshake_response, split_frame, HubMessage, Invocation,
    RECORD_SEPARATOR,
};
