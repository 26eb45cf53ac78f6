use crate::config::IceConfig;
use crate::error::NegotiationError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, VideoFeed};
use crate::peer::ice::rtc_ice_servers;
use crate::peer::types::{ConnectionState, Direction, IceCandidate, ServerConfig, TransceiverSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// What a connection reports back to its session.
pub enum ConnectionSignal {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(ConnectionState),
    RemoteVideo(VideoFeed),
}

/// The peer-connection capability a session drives.
///
/// Only offers are created locally; the remote side always answers.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Adds a transceiver. Send-only transceivers carry `track`.
    async fn add_transceiver(
        &self,
        spec: TransceiverSpec,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn set_local_description(&self, sdp: String) -> Result<(), NegotiationError>;

    /// Waits until ICE gathering finishes or `timeout` elapses. Returns
    /// `false` on timeout; whatever was gathered so far is still in the
    /// local description.
    async fn wait_for_gathering(&self, timeout: Duration) -> bool;

    async fn local_description(&self) -> Option<String>;

    async fn set_remote_answer(&self, sdp: String) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Releases the transport. Safe to call more than once.
    async fn close(&self);
}

/// Creates one connection per session with the engine-wide configuration.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError>;

    /// Drops the shared engine state. Later `create` calls fail.
    fn dispose(&self);
}

/// Builds the webrtc-rs API once and hands out peer connections from it.
pub struct WebRtcConnectionFactory {
    api: Mutex<Option<Arc<API>>>,
    servers: Vec<ServerConfig>,
}

impl WebRtcConnectionFactory {
    pub fn new(ice: &IceConfig) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Mutex::new(Some(Arc::new(api))),
            servers: ice.servers.clone(),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: rtc_ice_servers(&self.servers),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        user_id: &str,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        let api = self
            .api
            .lock()
            .clone()
            .ok_or_else(|| NegotiationError::Connection("connection factory is disposed".into()))?;

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);
        attach_handlers(&pc, user_id, signals);
        log::debug!("peer connection created for {user_id}");

        Ok(Arc::new(RtcConnection {
            pc,
            user_id: user_id.to_owned(),
            gathering: tokio::sync::Mutex::new(None),
            rtcp_readers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn dispose(&self) {
        if self.api.lock().take().is_some() {
            log::debug!("connection factory disposed");
        }
    }
}

fn attach_handlers(
    pc: &Arc<RTCPeerConnection>,
    user_id: &str,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
) {
    let tx = signals.clone();
    let uid = user_id.to_owned();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &uid, &candidate);
                    let _ = tx.send(ConnectionSignal::LocalCandidate(candidate));
                }
                Err(e) => log::warn!("[{uid}] unserializable local candidate: {e}"),
            },
            None => {
                log::debug!("[{uid}] ICE candidate gathering completed");
                let _ = tx.send(ConnectionSignal::GatheringComplete);
            }
        }
        Box::pin(async {})
    }));

    // weak so the handler does not keep its own connection alive
    let pc_weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    let tx = signals.clone();
    let uid = user_id.to_owned();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log::info!("[{uid}] peer connection state changed to: {st:?}");
        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = pc_weak.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = tx.send(ConnectionSignal::StateChanged(st.into()));
        Box::pin(async {})
    }));

    let tx = signals;
    let uid = user_id.to_owned();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            log::info!(
                "[{uid}] remote track {} kind={} ssrc={}",
                track.id(),
                track.kind(),
                track.ssrc()
            );
            if track.kind() == RTPCodecType::Video {
                let _ = tx.send(ConnectionSignal::RemoteVideo(VideoFeed::Remote(track)));
            }
            Box::pin(async {})
        },
    ));
}

/// [`MediaConnection`] over a webrtc-rs peer connection.
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    user_id: String,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_transceiver(
        &self,
        spec: TransceiverSpec,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), NegotiationError> {
        let init = RTCRtpTransceiverInit {
            direction: spec.direction.into(),
            send_encodings: vec![],
        };

        match track {
            Some(track) => {
                let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
                let transceiver = self
                    .pc
                    .add_transceiver_from_track(rtc_track, Some(init))
                    .await?;

                // RTCP has to be read for interceptors (NACK, reports) to run
                let sender = transceiver.sender().await;
                let reader = tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
                self.rtcp_readers.lock().push(reader);
            }
            None => {
                if spec.direction == Direction::SendOnly {
                    return Err(NegotiationError::Connection(format!(
                        "send-only {:?} transceiver needs a track",
                        spec.kind
                    )));
                }
                self.pc
                    .add_transceiver_from_kind(spec.kind.into(), Some(init))
                    .await?;
            }
        }
        log::debug!(
            "[{}] transceiver added: {:?} {:?}",
            self.user_id,
            spec.kind,
            spec.direction
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: String) -> Result<(), NegotiationError> {
        // must be armed before the description starts gathering
        let promise = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(promise);

        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_local_description(offer).await?;
        Ok(())
    }

    async fn wait_for_gathering(&self, timeout: Duration) -> bool {
        let Some(mut promise) = self.gathering.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, promise.recv()).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!(
                    "[{}] ICE gathering not complete after {:?}, posting partial offer",
                    self.user_id,
                    timeout
                );
                false
            }
        }
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let readers = std::mem::take(&mut *self.rtcp_readers.lock());
        for reader in readers {
            reader.abort();
        }
        if let Err(e) = self.pc.close().await {
            log::warn!("[{}] error closing peer connection: {e}", self.user_id);
        }
    }
}
