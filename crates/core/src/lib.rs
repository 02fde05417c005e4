pub mod audio;
pub mod capture;
pub mod collaborator;
pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod payload;
pub mod playback;
pub mod protocol;
pub mod reducer;
pub mod sidecar;
pub mod transport;
pub mod turn_taking;

pub use engine::{EngineCommand, EngineConfig, EngineError, EngineEvent, SessionEngine};
