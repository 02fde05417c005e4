//! WebSocket Session Management
//!
//! This module hosts coaching sessions over WebSockets:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the browser connection lifecycle, from handshake to termination.
//! - `provider`: Relays engine traffic to the OpenAI Realtime API.

pub mod protocol;
mod provider;
pub mod session;

pub use session::ws_handler;
