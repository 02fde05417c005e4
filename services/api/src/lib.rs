//! Scope API Library Crate
//!
//! This library contains the web service that hosts real-time coaching
//! sessions: configuration, shared state, routing, and the WebSocket bridge
//! between the browser and the remote voice agent. The `api` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod router;
pub mod state;
pub mod ws;
