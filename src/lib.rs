pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CaptureConfig, EngineConfig};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, MediaError, NegotiationError, SignalingError};
pub use events::EngineEvent;
pub use media::{
    AudioRouting, CaptureDevice, CaptureTracks, DeviceContext, LocalTrack, RenderTarget, VideoFeed,
};
pub use peer::types::IceCandidate;
pub use session::{Role, SessionHandle, SessionState, StreamKind};
