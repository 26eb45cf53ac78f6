//! Local capture pipeline and the media-engine capabilities it sits on.
//!
//! Capture, encoding and rendering belong to the host platform. The engine only
//! sees them through [`CaptureDevice`], [`AudioRouting`] and [`RenderTarget`],
//! and hands the capture side a pair of [`LocalTrack`]s to write encoded
//! samples into.

use crate::config::CaptureConfig;
use crate::error::MediaError;
use crate::peer::types::MediaKind;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// A sending track fed by the capture device.
///
/// Disabling the track drops samples instead of tearing the track down, so
/// mute/unmute needs no renegotiation.
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track_id: &str, stream_id: &str) -> Self {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                track_id.to_owned(),
                stream_id.to_owned(),
            )),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Writes one encoded frame. Returns `Ok(false)` when the track is muted
    /// and the sample was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.track.write_sample(sample).await?;
        Ok(true)
    }
}

/// Video delivered to a render target.
#[derive(Clone)]
pub enum VideoFeed {
    Local(Arc<LocalTrack>),
    Remote(Arc<TrackRemote>),
}

impl VideoFeed {
    pub fn track_id(&self) -> String {
        match self {
            VideoFeed::Local(track) => track.id().to_owned(),
            VideoFeed::Remote(track) => track.id(),
        }
    }
}

/// A render surface owned by the caller.
pub trait RenderTarget: Send + Sync {
    fn attach(&self, feed: VideoFeed);
    fn detach(&self);
    fn set_mirror(&self, mirror: bool);
    /// Frees the surface. Called once on engine teardown.
    fn release(&self);
}

/// Tracks handed to the capture device on start.
#[derive(Clone)]
pub struct CaptureTracks {
    pub audio: Arc<LocalTrack>,
    pub video: Option<Arc<LocalTrack>>,
}

/// Camera/microphone pipeline provided by the platform.
pub trait CaptureDevice: Send + Sync {
    fn start(&self, config: &CaptureConfig, tracks: CaptureTracks) -> Result<(), MediaError>;
    /// Toggles between cameras; returns `true` when the front camera is now
    /// active.
    fn switch_camera(&self) -> Result<bool, MediaError>;
    fn change_format(&self, config: &CaptureConfig) -> Result<(), MediaError>;
    fn stop(&self);
}

/// Device audio output routing.
pub trait AudioRouting: Send + Sync {
    fn set_speakerphone(&self, enabled: bool) -> Result<(), MediaError>;
}

/// Platform capabilities handed to the engine on init.
#[derive(Clone)]
pub struct DeviceContext {
    pub capture: Arc<dyn CaptureDevice>,
    pub audio_routing: Arc<dyn AudioRouting>,
}

impl DeviceContext {
    pub fn new(capture: Arc<dyn CaptureDevice>, audio_routing: Arc<dyn AudioRouting>) -> Self {
        Self {
            capture,
            audio_routing,
        }
    }
}

/// The single capture pipeline shared by publishing sessions.
pub struct LocalMediaSource {
    device: Arc<dyn CaptureDevice>,
    audio: Arc<LocalTrack>,
    video: Option<Arc<LocalTrack>>,
    preview: Mutex<Option<Weak<dyn RenderTarget>>>,
    mirror: AtomicBool,
    config: Mutex<CaptureConfig>,
    disposed: AtomicBool,
}

impl LocalMediaSource {
    /// Starts capture and attaches the video track to `preview`.
    pub fn start(
        device: Arc<dyn CaptureDevice>,
        owner_id: &str,
        config: CaptureConfig,
        with_video: bool,
        preview: Option<&Arc<dyn RenderTarget>>,
    ) -> Result<Self, MediaError> {
        let audio = Arc::new(LocalTrack::new(
            MediaKind::Audio,
            &format!("{owner_id}-audio"),
            owner_id,
        ));
        let video = with_video.then(|| {
            Arc::new(LocalTrack::new(
                MediaKind::Video,
                &format!("{owner_id}-video"),
                owner_id,
            ))
        });

        log::info!(
            "starting capture for {owner_id}: {}x{}@{} video={}",
            config.width,
            config.height,
            config.frame_rate,
            with_video
        );
        device.start(
            &config,
            CaptureTracks {
                audio: audio.clone(),
                video: video.clone(),
            },
        )?;

        let source = Self {
            device,
            audio,
            video,
            preview: Mutex::new(None),
            mirror: AtomicBool::new(true),
            config: Mutex::new(config),
            disposed: AtomicBool::new(false),
        };
        if let Some(target) = preview {
            source.attach_preview(target);
        }
        Ok(source)
    }

    /// Shows the local video on `target`, detaching any previous preview.
    pub fn attach_preview(&self, target: &Arc<dyn RenderTarget>) {
        let Some(track) = &self.video else {
            return;
        };
        let previous = self.preview.lock().replace(Arc::downgrade(target));
        if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
            if !Arc::ptr_eq(&previous, target) {
                previous.detach();
            }
        }
        target.set_mirror(self.is_mirrored());
        target.attach(VideoFeed::Local(track.clone()));
    }

    pub fn audio_track(&self) -> Arc<LocalTrack> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        self.video.clone()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn track_for(&self, kind: MediaKind) -> Option<Arc<LocalTrack>> {
        match kind {
            MediaKind::Audio => Some(self.audio.clone()),
            MediaKind::Video => self.video.clone(),
        }
    }

    pub fn config(&self) -> CaptureConfig {
        *self.config.lock()
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), MediaError> {
        if self.is_disposed() {
            Err(MediaError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Switches camera and flips the preview mirroring.
    pub fn switch_camera(&self) -> Result<(), MediaError> {
        self.ensure_live()?;
        if self.video.is_none() {
            log::debug!("switch_camera ignored, capture has no video");
            return Ok(());
        }
        let front = self.device.switch_camera()?;
        self.mirror.store(front, Ordering::SeqCst);
        if let Some(target) = self.preview.lock().as_ref().and_then(Weak::upgrade) {
            target.set_mirror(front);
        }
        Ok(())
    }

    pub fn mute_audio(&self, mute: bool) {
        self.audio.set_enabled(!mute);
    }

    pub fn mute_video(&self, mute: bool) {
        if let Some(video) = &self.video {
            video.set_enabled(!mute);
        }
    }

    pub fn change_format(&self, config: CaptureConfig) -> Result<(), MediaError> {
        self.ensure_live()?;
        log::debug!(
            "changeCaptureFormat: {}x{}@{}",
            config.width,
            config.height,
            config.frame_rate
        );
        if self.video.is_some() {
            self.device.change_format(&config)?;
        }
        *self.config.lock() = config;
        Ok(())
    }

    /// Stops capture and detaches the preview. Safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("disposing local media source");
        if let Some(target) = self.preview.lock().take().and_then(|weak| weak.upgrade()) {
            target.detach();
        }
        self.device.stop();
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Opus packet for 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Headless capture that emits Opus silence and no video frames.
pub struct SilentCaptureDevice {
    running: Mutex<Option<CancellationToken>>,
    front: AtomicBool,
}

impl SilentCaptureDevice {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
            front: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Default for SilentCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for SilentCaptureDevice {
    fn start(&self, _config: &CaptureConfig, tracks: CaptureTracks) -> Result<(), MediaError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| MediaError::NoRuntime)?;
        let token = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(token.clone()) {
            previous.cancel();
        }

        let audio = tracks.audio;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(OPUS_FRAME);
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: OPUS_FRAME,
                ..Default::default()
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = audio.write_sample(&sample).await {
                            log::trace!("silence write failed: {e}");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn switch_camera(&self) -> Result<bool, MediaError> {
        let front = !self.front.fetch_xor(true, Ordering::SeqCst);
        Ok(front)
    }

    fn change_format(&self, _config: &CaptureConfig) -> Result<(), MediaError> {
        Ok(())
    }

    fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

/// Audio routing for hosts without a switchable output.
#[derive(Default)]
pub struct NullAudioRouting;

impl AudioRouting for NullAudioRouting {
    fn set_speakerphone(&self, enabled: bool) -> Result<(), MediaError> {
        log::debug!("speakerphone={enabled} (no routing on this host)");
        Ok(())
    }
}
