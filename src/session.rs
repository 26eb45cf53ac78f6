use crate::error::NegotiationError;
use crate::events::EventBus;
use crate::media::{LocalTrack, RenderTarget};
use crate::peer::connection::MediaConnection;
use crate::peer::ice::CandidateQueue;
use crate::peer::types::{Direction, MediaKind, TransceiverSpec};
use crate::signaling::SignalingUrls;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publish,
    Subscribe,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    AudioOnly,
    AudioVideo,
}

impl StreamKind {
    pub fn has_video(self) -> bool {
        matches!(self, StreamKind::AudioVideo)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OfferPending,
    Signaling,
    Active,
    Closed,
}

/// Transceivers a session gets at creation; they never change afterwards.
pub fn transceiver_plan(role: Role, kind: StreamKind) -> Vec<TransceiverSpec> {
    let direction = match role {
        Role::Publish => Direction::SendOnly,
        Role::Subscribe => Direction::RecvOnly,
    };
    let mut plan = vec![TransceiverSpec {
        kind: MediaKind::Audio,
        direction,
    }];
    if kind.has_video() {
        plan.push(TransceiverSpec {
            kind: MediaKind::Video,
            direction,
        });
    }
    plan
}

/// One logical peer: a publisher or a subscriber of one stream.
pub struct Session {
    user_id: String,
    generation: u64,
    role: Role,
    stream_kind: StreamKind,
    urls: SignalingUrls,
    connection: Arc<dyn MediaConnection>,
    render_target: Mutex<Option<Weak<dyn RenderTarget>>>,
    local_tracks: Vec<Arc<LocalTrack>>,
    candidates: CandidateQueue,
    state: watch::Sender<SessionState>,
    failure: Mutex<Option<NegotiationError>>,
    cancel: CancellationToken,
    grace_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    events: EventBus,
}

pub(crate) struct SessionParts {
    pub user_id: String,
    pub generation: u64,
    pub role: Role,
    pub stream_kind: StreamKind,
    pub urls: SignalingUrls,
    pub connection: Arc<dyn MediaConnection>,
    pub local_tracks: Vec<Arc<LocalTrack>>,
    pub events: EventBus,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            user_id: parts.user_id,
            generation: parts.generation,
            role: parts.role,
            stream_kind: parts.stream_kind,
            urls: parts.urls,
            connection: parts.connection,
            render_target: Mutex::new(None),
            local_tracks: parts.local_tracks,
            candidates: CandidateQueue::new(),
            state,
            failure: Mutex::new(None),
            cancel: CancellationToken::new(),
            grace_task: Mutex::new(None),
            closed: AtomicBool::new(false),
            events: parts.events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stream_kind(&self) -> StreamKind {
        self.stream_kind
    }

    pub fn urls(&self) -> &SignalingUrls {
        &self.urls
    }

    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    pub fn local_tracks(&self) -> &[Arc<LocalTrack>] {
        &self.local_tracks
    }

    pub fn candidates(&self) -> &CandidateQueue {
        &self.candidates
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn failure(&self) -> Option<NegotiationError> {
        self.failure.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Moves to `next` unless the session is already closed.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::debug!("session {} -> {:?}", self.user_id, next);
            self.events.state_changed(&self.user_id, next);
        }
        changed
    }

    pub(crate) fn record_failure(&self, error: NegotiationError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    pub fn render_target(&self) -> Option<Arc<dyn RenderTarget>> {
        self.render_target.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind_render_target(&self, target: &Arc<dyn RenderTarget>) {
        *self.render_target.lock() = Some(Arc::downgrade(target));
    }

    pub(crate) fn is_bound_to(&self, target: &Arc<dyn RenderTarget>) -> bool {
        self.render_target
            .lock()
            .as_ref()
            .is_some_and(|weak| same_target(weak, target))
    }

    /// Detaches the video sink and forgets the surface; the surface itself
    /// stays usable by the caller.
    pub(crate) fn detach_render_target(&self) {
        let target = self.render_target.lock().take();
        if let Some(target) = target.and_then(|weak| weak.upgrade()) {
            target.detach();
        }
    }

    /// Detaches and releases the surface. Used on engine teardown.
    pub(crate) fn release_render_target(&self) {
        let target = self.render_target.lock().take();
        if let Some(target) = target.and_then(|weak| weak.upgrade()) {
            target.detach();
            target.release();
        }
    }

    pub(crate) fn set_grace_task(&self, handle: JoinHandle<()>) -> bool {
        let mut slot = self.grace_task.lock();
        if slot.is_some() || self.is_closed() {
            handle.abort();
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Drops the grace handle without aborting; used by the grace task
    /// itself before it closes the session.
    pub(crate) fn forget_grace_task(&self) {
        self.grace_task.lock().take();
    }

    pub(crate) fn abort_grace_task(&self) {
        if let Some(handle) = self.grace_task.lock().take() {
            handle.abort();
        }
    }

    /// Disposes the connection and detaches the render target. Safe to call
    /// any number of times.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("closing session {} ({:?})", self.user_id, self.role);
        self.cancel.cancel();
        self.abort_grace_task();
        self.detach_render_target();
        self.connection.close().await;
        self.candidates.clear();
        self.state.send_replace(SessionState::Closed);
        self.events.state_changed(&self.user_id, SessionState::Closed);
    }
}

fn same_target(weak: &Weak<dyn RenderTarget>, target: &Arc<dyn RenderTarget>) -> bool {
    std::ptr::eq(
        weak.as_ptr() as *const (),
        Arc::as_ptr(target) as *const (),
    )
}

/// Caller-side view of a session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user_id", &self.session.user_id)
            .field("role", &self.session.role)
            .field("generation", &self.session.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn user_id(&self) -> &str {
        self.session.user_id()
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn failure(&self) -> Option<NegotiationError> {
        self.session.failure()
    }

    /// Resolves once the session is `Active`, or with the failure that
    /// closed it.
    pub async fn wait_active(&self) -> Result<(), NegotiationError> {
        let mut rx = self.session.state.subscribe();
        let reached = rx
            .wait_for(|s| matches!(s, SessionState::Active | SessionState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed);

        match reached {
            SessionState::Active => Ok(()),
            _ => Err(self
                .session
                .failure()
                .unwrap_or(NegotiationError::Cancelled)),
        }
    }

    /// Resolves once the session is `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.session.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_audio_video_sends_both_kinds() {
        let plan = transceiver_plan(Role::Publish, StreamKind::AudioVideo);
        assert_eq!(
            plan,
            vec![
                TransceiverSpec {
                    kind: MediaKind::Audio,
                    direction: Direction::SendOnly
                },
                TransceiverSpec {
                    kind: MediaKind::Video,
                    direction: Direction::SendOnly
                },
            ]
        );
    }

    #[test]
    fn subscribe_audio_only_receives_audio() {
        let plan = transceiver_plan(Role::Subscribe, StreamKind::AudioOnly);
        assert_eq!(
            plan,
            vec![TransceiverSpec {
                kind: MediaKind::Audio,
                direction: Direction::RecvOnly
            }]
        );
    }
}
