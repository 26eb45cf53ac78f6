use crate::media::RenderTarget;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sessions by user id, plus the generation counter that tells a live
/// session from a replaced one with the same id.
///
/// The map lock is only held for map operations, never across an await.
#[derive(Default)]
pub struct PeerRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    generation: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers `session`, returning whatever was registered under the same
    /// id before. The caller owns closing it.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .insert(session.user_id().to_owned(), session)
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(user_id).cloned()
    }

    /// The session for `user_id`, only if it is still generation `generation`.
    pub fn current(&self, user_id: &str, generation: u64) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(user_id)
            .filter(|s| s.generation() == generation)
            .cloned()
    }

    pub fn is_current(&self, user_id: &str, generation: u64) -> bool {
        self.current(user_id, generation).is_some()
    }

    pub fn remove(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(user_id)
    }

    /// Removes the entry only if it still belongs to `generation`.
    pub fn remove_if_current(&self, user_id: &str, generation: u64) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        match sessions.get(user_id) {
            Some(s) if s.generation() == generation => sessions.remove(user_id),
            _ => None,
        }
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Detaches `target` from every session other than `owner` that has it
    /// bound, so one surface never renders two sessions.
    pub fn detach_target_elsewhere(&self, owner: &str, target: &Arc<dyn RenderTarget>) {
        let holders: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.user_id() != owner && s.is_bound_to(target))
            .cloned()
            .collect();
        for session in holders {
            log::debug!(
                "render target moves from {} to {}",
                session.user_id(),
                owner
            );
            session.detach_render_target();
        }
    }

    /// Empties the registry, releasing every bound surface and closing every
    /// connection.
    pub async fn drain_and_release(&self) -> usize {
        let sessions = self.drain();
        let count = sessions.len();
        for session in sessions {
            session.release_render_target();
            session.close().await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationError;
    use crate::events::EventBus;
    use crate::media::{LocalTrack, VideoFeed};
    use crate::peer::connection::MediaConnection;
    use crate::peer::types::{IceCandidate, TransceiverSpec};
    use crate::session::{Role, SessionParts, SessionState, StreamKind};
    use crate::signaling::SignalingUrls;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[derive(Default)]
    struct IdleConnection {
        closed: AtomicBool,
    }

    #[async_trait]
    impl MediaConnection for IdleConnection {
        async fn add_transceiver(
            &self,
            _spec: TransceiverSpec,
            _track: Option<Arc<LocalTrack>>,
        ) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<String, NegotiationError> {
            Ok("v=0\r\n".into())
        }
        async fn set_local_description(&self, _sdp: String) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn wait_for_gathering(&self, _timeout: Duration) -> bool {
            true
        }
        async fn local_description(&self) -> Option<String> {
            None
        }
        async fn set_remote_answer(&self, _sdp: String) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _c: IceCandidate) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Surface {
        detached: AtomicUsize,
        released: AtomicUsize,
    }

    impl RenderTarget for Surface {
        fn attach(&self, _feed: VideoFeed) {}
        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
        fn set_mirror(&self, _mirror: bool) {}
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(registry: &PeerRegistry, user_id: &str) -> (Arc<Session>, Arc<IdleConnection>) {
        let connection = Arc::new(IdleConnection::default());
        let session = Arc::new(Session::new(SessionParts {
            user_id: user_id.into(),
            generation: registry.next_generation(),
            role: Role::Subscribe,
            stream_kind: StreamKind::AudioVideo,
            urls: SignalingUrls::from_stream_address("webrtc://10.0.0.5/live/a", 1985, "/rtc/v1")
                .unwrap(),
            connection: connection.clone(),
            local_tracks: Vec::new(),
            events: EventBus::new(),
        }));
        (session, connection)
    }

    #[test]
    fn one_entry_per_user_and_generations_increase() {
        let registry = PeerRegistry::new();
        let (first, _) = session(&registry, "alice");
        let (second, _) = session(&registry, "alice");
        assert!(second.generation() > first.generation());

        assert!(registry.insert(first.clone()).is_none());
        let replaced = registry.insert(second.clone()).unwrap();
        assert_eq!(replaced.generation(), first.generation());
        assert_eq!(registry.len(), 1);

        assert!(!registry.is_current("alice", first.generation()));
        assert!(registry.is_current("alice", second.generation()));
    }

    #[test]
    fn stale_generation_cannot_remove_newer_entry() {
        let registry = PeerRegistry::new();
        let (old, _) = session(&registry, "bob");
        let (new, _) = session(&registry, "bob");
        registry.insert(new.clone());

        assert!(registry.remove_if_current("bob", old.generation()).is_none());
        assert_eq!(registry.user_ids(), vec!["bob".to_string()]);
        assert!(registry.remove_if_current("bob", new.generation()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn rebinding_a_surface_detaches_the_previous_holder() {
        let registry = PeerRegistry::new();
        let (a, _) = session(&registry, "a");
        let (b, _) = session(&registry, "b");
        registry.insert(a.clone());
        registry.insert(b.clone());

        let surface = Arc::new(Surface::default());
        let target: Arc<dyn RenderTarget> = surface.clone();
        a.bind_render_target(&target);

        registry.detach_target_elsewhere("b", &target);
        b.bind_render_target(&target);

        assert!(!a.is_bound_to(&target));
        assert!(b.is_bound_to(&target));
        assert_eq!(surface.detached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_and_release_closes_everything() {
        let registry = PeerRegistry::new();
        let (a, conn_a) = session(&registry, "a");
        let (b, conn_b) = session(&registry, "b");
        let surface = Arc::new(Surface::default());
        let target: Arc<dyn RenderTarget> = surface.clone();
        a.bind_render_target(&target);
        registry.insert(a.clone());
        registry.insert(b.clone());

        assert_eq!(registry.drain_and_release().await, 2);
        assert!(registry.is_empty());
        assert!(conn_a.closed.load(Ordering::SeqCst));
        assert!(conn_b.closed.load(Ordering::SeqCst));
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(surface.released.load(Ordering::SeqCst), 1);

        // second drain finds nothing
        assert_eq!(registry.drain_and_release().await, 0);
    }
}
