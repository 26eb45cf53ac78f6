use crate::config::CaptureConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::media::{AudioRouting, LocalMediaSource};
use std::sync::Arc;

impl Engine {
    /// Running capture source, only while someone publishes.
    fn active_media(&self) -> Option<Arc<LocalMediaSource>> {
        let runtime = self.inner.runtime.lock();
        let rt = runtime.as_ref()?;
        rt.publisher.as_ref()?;
        rt.media.clone()
    }

    fn active_audio_routing(&self) -> Option<Arc<dyn AudioRouting>> {
        let runtime = self.inner.runtime.lock();
        let rt = runtime.as_ref()?;
        rt.publisher.as_ref()?;
        Some(rt.devices.audio_routing.clone())
    }

    pub fn switch_camera(&self) -> Result<(), EngineError> {
        match self.active_media() {
            Some(media) => Ok(media.switch_camera()?),
            None => {
                log::debug!("switchCamera: no active publisher");
                Ok(())
            }
        }
    }

    pub fn mute_self_audio(&self, mute: bool) {
        if let Some(media) = self.active_media() {
            log::info!("muteSelfAudio: {mute}");
            media.mute_audio(mute);
        }
    }

    pub fn mute_self_video(&self, mute: bool) {
        if let Some(media) = self.active_media() {
            log::info!("muteSelfVideo: {mute}");
            media.mute_video(mute);
        }
    }

    pub fn enable_speakerphone(&self, enabled: bool) -> Result<(), EngineError> {
        match self.active_audio_routing() {
            Some(routing) => {
                log::info!("enableSpeakerphone: {enabled}");
                Ok(routing.set_speakerphone(enabled)?)
            }
            None => {
                log::debug!("enableSpeakerphone: no active publisher");
                Ok(())
            }
        }
    }

    /// Sets the capture format for the next publish.
    pub fn set_capture_config(&self, config: CaptureConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self.inner.capture.lock() = config;
        Ok(())
    }

    /// Applies a capture format to the running source, and remembers it for
    /// later publishes.
    pub fn change_capture_format(&self, config: CaptureConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self.inner.capture.lock() = config;
        if let Some(media) = self.active_media() {
            media.change_format(config)?;
        }
        Ok(())
    }
}
