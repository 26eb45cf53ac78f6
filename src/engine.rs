//! The engine context: configuration, the peer registry and whatever `init`
//! established. Session and device operations live in [`crate::commands`].

use crate::config::{CaptureConfig, EngineConfig};
use crate::error::{EngineError, NegotiationError};
use crate::events::{EngineEvent, EventBus};
use crate::media::{DeviceContext, LocalMediaSource};
use crate::peer::connection::{ConnectionFactory, ConnectionSignal, WebRtcConnectionFactory};
use crate::peer::ice::analyze_candidates;
use crate::peer::negotiator::Negotiator;
use crate::peer::state::PeerRegistry;
use crate::peer::types::ConnectionState;
use crate::session::{Role, Session, SessionHandle};
use crate::signaling::{HttpSignalingClient, SignalingTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Entry point for publishing and playing SRS streams.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) capture: Mutex<CaptureConfig>,
    pub(crate) registry: PeerRegistry,
    pub(crate) events: EventBus,
    pub(crate) runtime: Mutex<Option<Runtime>>,
    collaborators: Option<Collaborators>,
}

#[derive(Clone)]
struct Collaborators {
    factory: Arc<dyn ConnectionFactory>,
    signaling: Arc<dyn SignalingTransport>,
}

/// What exists between `init` and `teardown`.
pub(crate) struct Runtime {
    pub(crate) self_id: String,
    pub(crate) devices: DeviceContext,
    pub(crate) factory: Arc<dyn ConnectionFactory>,
    pub(crate) negotiator: Arc<Negotiator>,
    pub(crate) media: Option<Arc<LocalMediaSource>>,
    pub(crate) publisher: Option<String>,
}

impl Engine {
    /// Engine backed by webrtc-rs connections and the reqwest signaling
    /// client, both created on `init`.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine using the given connection factory and signaling transport
    /// instead of building its own.
    pub fn with_collaborators(
        config: EngineConfig,
        factory: Arc<dyn ConnectionFactory>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self::build(config, Some(Collaborators { factory, signaling }))
    }

    fn build(config: EngineConfig, collaborators: Option<Collaborators>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                capture: Mutex::new(config.capture),
                config,
                registry: PeerRegistry::new(),
                events: EventBus::new(),
                runtime: Mutex::new(None),
                collaborators,
            }),
        }
    }

    /// Establishes the shared connection factory. Must precede any session
    /// operation; calling it twice without `teardown` is an error.
    pub fn init(&self, devices: DeviceContext, self_id: &str) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.runtime.lock().is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        inner.config.validate()?;

        let (factory, signaling) = match &inner.collaborators {
            Some(c) => (c.factory.clone(), c.signaling.clone()),
            None => {
                let factory: Arc<dyn ConnectionFactory> =
                    Arc::new(WebRtcConnectionFactory::new(&inner.config.ice)?);
                let signaling: Arc<dyn SignalingTransport> =
                    Arc::new(HttpSignalingClient::new(&inner.config.signaling)?);
                (factory, signaling)
            }
        };
        let negotiator = Arc::new(Negotiator::new(
            signaling,
            inner.config.retry.clone(),
            inner.config.ice.gathering_timeout(),
            inner.config.api_port,
        ));

        let mut runtime = inner.runtime.lock();
        if runtime.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        *runtime = Some(Runtime {
            self_id: self_id.to_owned(),
            devices,
            factory,
            negotiator,
            media: None,
            publisher: None,
        });
        log::info!("engine initialized for {self_id}");
        Ok(())
    }

    /// Stops every session, releases their surfaces and the connection
    /// factory. Safe to call any number of times.
    pub async fn teardown(&self) {
        let Some(runtime) = self.inner.runtime.lock().take() else {
            log::debug!("teardown: engine not initialized");
            return;
        };
        let closed = self.inner.registry.drain_and_release().await;
        if let Some(media) = runtime.media {
            media.dispose();
        }
        runtime.factory.dispose();
        log::info!("engine torn down ({closed} session(s) closed)");
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.runtime.lock().is_some()
    }

    pub fn self_id(&self) -> Option<String> {
        self.inner.runtime.lock().as_ref().map(|r| r.self_id.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Capture format the next publish will use.
    pub fn capture_config(&self) -> CaptureConfig {
        *self.inner.capture.lock()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn session(&self, user_id: &str) -> Option<SessionHandle> {
        self.inner.registry.get(user_id).map(SessionHandle::new)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.registry.user_ids()
    }

    /// User id of the current publisher, if any.
    pub fn publisher(&self) -> Option<String> {
        self.inner
            .runtime
            .lock()
            .as_ref()
            .and_then(|r| r.publisher.clone())
    }

    pub fn is_publishing(&self) -> bool {
        self.publisher().is_some()
    }
}

impl EngineInner {
    /// Starts the negotiation and signal-pump tasks for a registered session.
    pub(crate) fn spawn_session(
        self: &Arc<Self>,
        session: Arc<Session>,
        negotiator: Arc<Negotiator>,
        signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        tokio::spawn(self.clone().pump(session.clone(), signals));

        let inner = self.clone();
        tokio::spawn(async move {
            match negotiator.run(&session, &inner.registry).await {
                Ok(()) => {}
                Err(NegotiationError::Cancelled) => {
                    log::debug!("[{}] negotiation cancelled", session.user_id());
                }
                Err(e) => inner.fail_session(&session, e).await,
            }
        });
    }

    async fn pump(
        self: Arc<Self>,
        session: Arc<Session>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        let cancel = session.cancel_token();
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            if !self
                .registry
                .is_current(session.user_id(), session.generation())
            {
                log::debug!(
                    "[{}] dropping signal for stale generation {}",
                    session.user_id(),
                    session.generation()
                );
                continue;
            }
            self.handle_signal(&session, signal).await;
        }
    }

    async fn handle_signal(self: &Arc<Self>, session: &Arc<Session>, signal: ConnectionSignal) {
        let uid = session.user_id();
        match signal {
            ConnectionSignal::LocalCandidate(candidate) => {
                let count = session.candidates().record_local(candidate.clone());
                log::trace!("[{uid}] local candidate #{count}");
                self.events.emit(EngineEvent::LocalCandidate {
                    user_id: uid.to_owned(),
                    candidate,
                });
            }
            ConnectionSignal::GatheringComplete => {
                session.candidates().mark_gathering_complete();
                analyze_candidates(&session.candidates().local());
            }
            ConnectionSignal::StateChanged(state) => {
                self.events.emit(EngineEvent::ConnectionStateChanged {
                    user_id: uid.to_owned(),
                    state,
                });
                self.on_connection_state(session, state).await;
            }
            ConnectionSignal::RemoteVideo(feed) => match session.render_target() {
                Some(target) => {
                    log::debug!("[{uid}] remote video {} attached", feed.track_id());
                    target.attach(feed);
                }
                None => log::warn!("[{uid}] remote video arrived with no render target"),
            },
        }
    }

    async fn on_connection_state(self: &Arc<Self>, session: &Arc<Session>, state: ConnectionState) {
        match state {
            ConnectionState::Connected => session.abort_grace_task(),
            ConnectionState::Disconnected => {
                let grace = self.config.disconnect_grace();
                let inner = self.clone();
                let watched = session.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    watched.forget_grace_task();
                    log::warn!(
                        "[{}] not reconnected within {:?}",
                        watched.user_id(),
                        grace
                    );
                    inner
                        .fail_session(&watched, NegotiationError::ConnectionFailed)
                        .await;
                });
                if session.set_grace_task(handle) {
                    log::info!(
                        "[{}] connection disconnected, grace period {:?} started",
                        session.user_id(),
                        grace
                    );
                }
            }
            ConnectionState::Failed => {
                self.fail_session(session, NegotiationError::ConnectionFailed)
                    .await
            }
            _ => {}
        }
    }

    /// Records the failure, reports it and retires the session.
    pub(crate) async fn fail_session(&self, session: &Arc<Session>, error: NegotiationError) {
        if session.is_closed() {
            return;
        }
        session.record_failure(error.clone());
        self.events.failed(session.user_id(), error);
        self.retire(session).await;
    }

    /// Removes the session if it is still current, closes it and, for the
    /// publisher, disposes the local media source.
    pub(crate) async fn retire(&self, session: &Arc<Session>) {
        let was_current = self
            .registry
            .remove_if_current(session.user_id(), session.generation())
            .is_some();
        if was_current && session.role() == Role::Publish {
            self.release_publisher(session.user_id());
        }
        session.close().await;
    }

    /// Clears the publisher slot held by `user_id` and disposes the media it
    /// was using.
    pub(crate) fn release_publisher(&self, user_id: &str) {
        let media = {
            let mut runtime = self.runtime.lock();
            match runtime.as_mut() {
                Some(rt) if rt.publisher.as_deref() == Some(user_id) => {
                    rt.publisher = None;
                    rt.media.take()
                }
                _ => None,
            }
        };
        if let Some(media) = media {
            media.dispose();
        }
    }
}
