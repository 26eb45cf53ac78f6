#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use srs_rtc::config::{CaptureConfig, RetryPolicy};
use srs_rtc::error::{MediaError, NegotiationError, SignalingError};
use srs_rtc::media::{AudioRouting, CaptureDevice, CaptureTracks, LocalTrack, RenderTarget, VideoFeed};
use srs_rtc::peer::connection::{ConnectionFactory, ConnectionSignal, MediaConnection};
use srs_rtc::peer::types::{IceCandidate, TransceiverSpec};
use srs_rtc::signaling::{OfferRequest, SignalingTransport};
use srs_rtc::{DeviceContext, Engine, EngineConfig, EngineEvent};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out waiting")
}

/// Ordered log of connection and signaling steps, shared by the fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

/// Step at which a fake connection (or its factory) reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Create,
    Offer,
    LocalDescription,
    /// Local description is set but reads back empty
    EmptyLocal,
    RemoteAnswer,
}

fn refused(step: &str) -> NegotiationError {
    NegotiationError::Connection(format!("{step} refused"))
}

pub struct FakeConnection {
    pub user_id: String,
    journal: Journal,
    fail_at: Option<FailAt>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
    pub transceivers: Mutex<Vec<(TransceiverSpec, Option<String>)>>,
    local: Mutex<Option<String>>,
    pub remote_sets: AtomicUsize,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
}

impl FakeConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_sets(&self) -> usize {
        self.remote_sets.load(Ordering::SeqCst)
    }

    pub fn transceivers(&self) -> Vec<(TransceiverSpec, Option<String>)> {
        self.transceivers.lock().clone()
    }
}

pub fn host_candidate(port: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 udp 2130706431 192.168.1.20 {port} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_transceiver(
        &self,
        spec: TransceiverSpec,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), NegotiationError> {
        self.transceivers
            .lock()
            .push((spec, track.map(|t| t.id().to_owned())));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.journal.push(format!("{}:offer", self.user_id));
        if self.fail_at == Some(FailAt::Offer) {
            return Err(refused("offer"));
        }
        Ok(format!(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
            self.user_id
        ))
    }

    async fn set_local_description(&self, sdp: String) -> Result<(), NegotiationError> {
        self.journal.push(format!("{}:local", self.user_id));
        if self.fail_at == Some(FailAt::LocalDescription) {
            return Err(refused("local description"));
        }
        *self.local.lock() = Some(sdp);
        Ok(())
    }

    async fn wait_for_gathering(&self, _timeout: Duration) -> bool {
        let _ = self
            .signals
            .send(ConnectionSignal::LocalCandidate(host_candidate(50_000)));
        let _ = self.signals.send(ConnectionSignal::GatheringComplete);
        true
    }

    async fn local_description(&self) -> Option<String> {
        if self.fail_at == Some(FailAt::EmptyLocal) {
            return Some(String::new());
        }
        self.local.lock().clone()
    }

    async fn set_remote_answer(&self, _sdp: String) -> Result<(), NegotiationError> {
        self.journal.push(format!("{}:remote", self.user_id));
        if self.fail_at == Some(FailAt::RemoteAnswer) {
            return Err(refused("remote answer"));
        }
        self.remote_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.push(format!("{}:close", self.user_id));
        }
    }
}

#[derive(Default)]
pub struct FakeConnectionFactory {
    pub journal: Journal,
    pub connections: Mutex<Vec<Arc<FakeConnection>>>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<ConnectionSignal>>>,
    pub disposed: AtomicUsize,
    pub fail_at: Mutex<Option<FailAt>>,
    /// Holds every `create` for this long before building the connection.
    pub create_delay: Mutex<Option<Duration>>,
}

impl FakeConnectionFactory {
    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock()[index].clone()
    }

    pub fn latest_for(&self, user_id: &str) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.user_id == user_id)
            .cloned()
            .expect("no connection for user")
    }

    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn fail_at(&self, step: FailAt) {
        *self.fail_at.lock() = Some(step);
    }

    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Injects a transport signal into `user_id`'s most recent connection.
    pub fn signal(&self, user_id: &str, signal: ConnectionSignal) {
        let tx = self.senders.lock().get(user_id).cloned().expect("no sender");
        let _ = tx.send(signal);
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        user_id: &str,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail_at = *self.fail_at.lock();
        if fail_at == Some(FailAt::Create) {
            return Err(refused("connection"));
        }
        let conn = Arc::new(FakeConnection {
            user_id: user_id.to_owned(),
            journal: self.journal.clone(),
            fail_at,
            signals: signals.clone(),
            transceivers: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote_sets: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.senders.lock().insert(user_id.to_owned(), signals);
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Answer,
    Reject,
    /// Fails with HTTP 503 this many times, then answers
    FailTimes(usize),
    Delay(Duration),
    /// Never answers
    Hang,
}

pub struct StubSignaling {
    journal: Journal,
    reply: Mutex<Reply>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<(String, OfferRequest)>>,
}

impl StubSignaling {
    pub fn new(journal: Journal, reply: Reply) -> Self {
        Self {
            journal,
            reply: Mutex::new(reply),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

const ANSWER_SDP: &str = "v=0\r\no=- 9 9 IN IP4 10.0.0.5\r\ns=SRS\r\nt=0 0\r\n";

#[async_trait]
impl SignalingTransport for StubSignaling {
    async fn exchange_offer(
        &self,
        endpoint: &str,
        request: &OfferRequest,
    ) -> Result<String, SignalingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let stream = request
            .streamurl
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();
        self.journal.push(format!("{stream}:post"));
        self.requests
            .lock()
            .push((endpoint.to_owned(), request.clone()));

        let reply = self.reply.lock().clone();
        match reply {
            Reply::Answer => Ok(ANSWER_SDP.into()),
            Reply::Reject => Err(SignalingError::Rejected { code: 400 }),
            Reply::FailTimes(n) if call < n => Err(SignalingError::Status(503)),
            Reply::FailTimes(_) => Ok(ANSWER_SDP.into()),
            Reply::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(ANSWER_SDP.into())
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[derive(Default)]
pub struct FakeCapture {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub switches: AtomicUsize,
    pub formats: Mutex<Vec<CaptureConfig>>,
    pub with_video: AtomicBool,
}

impl CaptureDevice for FakeCapture {
    fn start(&self, _config: &CaptureConfig, tracks: CaptureTracks) -> Result<(), MediaError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.with_video
            .store(tracks.video.is_some(), Ordering::SeqCst);
        Ok(())
    }

    fn switch_camera(&self) -> Result<bool, MediaError> {
        let n = self.switches.fetch_add(1, Ordering::SeqCst) + 1;
        // odd switches land on the back camera
        Ok(n % 2 == 0)
    }

    fn change_format(&self, config: &CaptureConfig) -> Result<(), MediaError> {
        self.formats.lock().push(*config);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeRouting {
    pub speakerphone: Mutex<Option<bool>>,
}

impl AudioRouting for FakeRouting {
    fn set_speakerphone(&self, enabled: bool) -> Result<(), MediaError> {
        *self.speakerphone.lock() = Some(enabled);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRender {
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
    pub released: AtomicUsize,
    pub mirror: Mutex<Option<bool>>,
    pub last_feed: Mutex<Option<String>>,
}

impl FakeRender {
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl RenderTarget for FakeRender {
    fn attach(&self, feed: VideoFeed) {
        self.attached.fetch_add(1, Ordering::SeqCst);
        *self.last_feed.lock() = Some(feed.track_id());
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn set_mirror(&self, mirror: bool) {
        *self.mirror.lock() = Some(mirror);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            multiplier: 2.0,
            jitter: false,
        },
        disconnect_grace_ms: 100,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub factory: Arc<FakeConnectionFactory>,
    pub signaling: Arc<StubSignaling>,
    pub capture: Arc<FakeCapture>,
    pub routing: Arc<FakeRouting>,
    pub journal: Journal,
}

impl Harness {
    /// Engine wired to fakes, not yet initialized.
    pub fn new(reply: Reply) -> Self {
        let journal = Journal::default();
        let factory = Arc::new(FakeConnectionFactory {
            journal: journal.clone(),
            ..Default::default()
        });
        let signaling = Arc::new(StubSignaling::new(journal.clone(), reply));
        let engine = Engine::with_collaborators(test_config(), factory.clone(), signaling.clone());
        Self {
            engine,
            factory,
            signaling,
            capture: Arc::new(FakeCapture::default()),
            routing: Arc::new(FakeRouting::default()),
            journal,
        }
    }

    pub fn devices(&self) -> DeviceContext {
        DeviceContext::new(self.capture.clone(), self.routing.clone())
    }

    /// Engine wired to fakes and initialized as `me`.
    pub fn started(reply: Reply) -> Self {
        let harness = Self::new(reply);
        harness
            .engine
            .init(harness.devices(), "me")
            .expect("init");
        harness
    }
}

pub fn stream(name: &str) -> String {
    format!("webrtc://10.0.0.5/live/{name}")
}

pub fn render() -> (Arc<FakeRender>, Arc<dyn RenderTarget>) {
    let surface = Arc::new(FakeRender::default());
    let target: Arc<dyn RenderTarget> = surface.clone();
    (surface, target)
}

/// Waits for the first event matching `pred`.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    within(async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
}
