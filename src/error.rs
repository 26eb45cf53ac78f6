use thiserror::Error;

/// Synchronous failures reported by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("engine is already initialized")]
    AlreadyInitialized,
    #[error("a render target is required to start video for {0}")]
    MissingRenderTarget(String),
    #[error("invalid stream address {address}: {reason}")]
    InvalidStreamAddress { address: String, reason: String },
    #[error("capture source is owned by publisher {0}")]
    PublisherBusy(String),
    #[error("no session registered for {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a session ended up in `Closed` without reaching (or while in) `Active`.
///
/// Cloneable so it can be stored on the session and broadcast as an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("offer rejected by {endpoint} (code {code})")]
    Rejected { endpoint: String, code: i64 },
    #[error("signaling failed after {attempts} attempt(s): {reason}")]
    Transport { attempts: u32, reason: String },
    #[error("signaling returned an empty answer (code {0})")]
    EmptyAnswer(i64),
    #[error("local description is empty after offer creation")]
    EmptyLocalDescription,
    #[error("peer connection error: {0}")]
    Connection(String),
    #[error("peer connection failed")]
    ConnectionFailed,
    #[error("session was closed before negotiation finished")]
    Cancelled,
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Connection(err.to_string())
    }
}

/// Failures of a single signaling HTTP exchange.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to execute the request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("signaling server answered with HTTP {0}")]
    Status(u16),
    #[error("offer rejected (code {code})")]
    Rejected { code: i64 },
    #[error("answer carried no sdp (code {code})")]
    EmptyAnswer { code: i64 },
}

impl SignalingError {
    /// Transport-level problems are worth another attempt; protocol
    /// answers are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SignalingError::Request(e) => !e.is_decode() && !e.is_builder(),
            SignalingError::Status(code) => *code >= 500,
            SignalingError::Rejected { .. } | SignalingError::EmptyAnswer { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture device error: {0}")]
    Device(String),
    #[error("track write failed: {0}")]
    Track(String),
    #[error("local media source is disposed")]
    Disposed,
    #[error("no tokio runtime available to drive capture")]
    NoRuntime,
}

impl From<webrtc::Error> for MediaError {
    fn from(err: webrtc::Error) -> Self {
        MediaError::Track(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
