//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration
//! and the collaborator clients shared by every session.

use crate::config::Config;
use scope_core::{
    EngineConfig, collaborator::ReviewCollaborator, sidecar::AssessmentInference,
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Agent instructions sent in `session.update`.
    pub instructions: Arc<String>,
    pub collaborator: Arc<dyn ReviewCollaborator>,
    pub assessor: Option<Arc<dyn AssessmentInference>>,
}

impl AppState {
    /// Engine settings for one browser session.
    pub fn engine_config(&self, destination: Option<String>) -> EngineConfig {
        EngineConfig {
            instructions: self.instructions.as_str().to_string(),
            voice: self.config.realtime_voice.clone(),
            destination,
            ..EngineConfig::default()
        }
    }
}
