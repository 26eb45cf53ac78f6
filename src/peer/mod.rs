pub mod connection;
pub mod ice;
pub mod negotiator;
pub mod state;
pub mod types;

pub use connection::{ConnectionFactory, ConnectionSignal, MediaConnection, WebRtcConnectionFactory};
pub use negotiator::Negotiator;
pub use state::PeerRegistry;
pub use types::{ConnectionState, Direction, IceCandidate, MediaKind, ServerConfig, TransceiverSpec};
