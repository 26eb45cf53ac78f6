use crate::error::NegotiationError;
use crate::peer::types::{ConnectionState, IceCandidate};
use crate::session::SessionState;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SessionStateChanged {
        user_id: String,
        state: SessionState,
    },
    SessionFailed {
        user_id: String,
        error: NegotiationError,
    },
    /// A gathered local candidate, for callers running their own relay
    LocalCandidate {
        user_id: String,
        candidate: IceCandidate,
    },
    ConnectionStateChanged {
        user_id: String,
        state: ConnectionState,
    },
}

/// Fan-out of [`EngineEvent`]s. Emitting with no subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        log::trace!("emit {:?}", event);
        let _ = self.tx.send(event);
    }

    pub(crate) fn state_changed(&self, user_id: &str, state: SessionState) {
        self.emit(EngineEvent::SessionStateChanged {
            user_id: user_id.to_owned(),
            state,
        });
    }

    pub(crate) fn failed(&self, user_id: &str, error: NegotiationError) {
        log::warn!("session {user_id} failed: {error}");
        self.emit(EngineEvent::SessionFailed {
            user_id: user_id.to_owned(),
            error,
        });
    }
}
