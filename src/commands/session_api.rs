use crate::engine::{Engine, Runtime};
use crate::error::{EngineError, NegotiationError};
use crate::media::{DeviceContext, LocalMediaSource, LocalTrack, RenderTarget};
use crate::peer::connection::ConnectionFactory;
use crate::peer::negotiator::Negotiator;
use crate::session::{Role, Session, SessionHandle, SessionParts, StreamKind};
use crate::signaling::SignalingUrls;
use std::sync::Arc;
use tokio::sync::mpsc;

struct OpenRequest<'a> {
    user_id: &'a str,
    role: Role,
    stream_kind: StreamKind,
    urls: SignalingUrls,
    render_target: Option<Arc<dyn RenderTarget>>,
    local_tracks: Vec<Arc<LocalTrack>>,
    /// Capture source a publish session was built on.
    media: Option<Arc<LocalMediaSource>>,
}

impl Engine {
    /// Publishes the local capture as `user_id` to `stream_address`.
    ///
    /// The capture source is created on first use and shared; only one
    /// user may publish at a time. Video needs a preview `render_target`.
    pub async fn start_publish(
        &self,
        user_id: &str,
        stream_kind: StreamKind,
        stream_address: &str,
        render_target: Option<Arc<dyn RenderTarget>>,
    ) -> Result<SessionHandle, EngineError> {
        log::info!("startPublish: {user_id} {stream_kind:?} -> {stream_address}");
        self.ensure_initialized()?;
        require_render_target(user_id, stream_kind, render_target.as_ref())?;
        let urls = self.signaling_urls(stream_address)?;

        // claim the publisher slot before anything awaits
        let (devices, owner) = {
            let mut runtime = self.inner.runtime.lock();
            let rt = runtime.as_mut().ok_or(EngineError::NotInitialized)?;
            if let Some(current) = rt.publisher.as_deref() {
                if current != user_id {
                    log::warn!("startPublish: {current} is already publishing");
                    return Err(EngineError::PublisherBusy(current.to_owned()));
                }
            }
            rt.publisher = Some(user_id.to_owned());
            (rt.devices.clone(), rt.self_id.clone())
        };

        self.replace_existing(user_id, Role::Publish).await;
        if let Some(target) = &render_target {
            self.inner.registry.detach_target_elsewhere(user_id, target);
        }

        let media = match self.local_media(
            &devices,
            &owner,
            user_id,
            stream_kind,
            render_target.as_ref(),
        ) {
            Ok(media) => media,
            Err(e) => {
                if !superseded(&e) {
                    self.inner.release_publisher(user_id);
                }
                return Err(e);
            }
        };
        let mut local_tracks = vec![media.audio_track()];
        local_tracks.extend(media.video_track());

        let opened = self
            .open_session(OpenRequest {
                user_id,
                role: Role::Publish,
                stream_kind,
                urls,
                render_target,
                local_tracks,
                media: Some(media),
            })
            .await;
        if let Err(e) = &opened {
            if !superseded(e) {
                self.inner.release_publisher(user_id);
            }
        }
        opened
    }

    /// Stops the current publisher and disposes the capture source. No-op
    /// when nothing is published.
    pub async fn stop_publish(&self) -> Result<(), EngineError> {
        let Some(publisher) = self.publisher() else {
            log::debug!("stopPublish: nothing is published");
            return Ok(());
        };
        log::info!("stopPublish: {publisher}");
        // a start still opening its connection sees the free slot and gives up
        self.inner.release_publisher(&publisher);
        if let Some(session) = self
            .inner
            .registry
            .get(&publisher)
            .filter(|s| s.role() == Role::Publish)
        {
            self.inner.registry.remove_if_current(&publisher, session.generation());
            session.close().await;
        }
        Ok(())
    }

    /// Plays `stream_address` as `user_id`, rendering remote video into
    /// `render_target`.
    pub async fn start_subscribe(
        &self,
        user_id: &str,
        stream_kind: StreamKind,
        stream_address: &str,
        render_target: Option<Arc<dyn RenderTarget>>,
    ) -> Result<SessionHandle, EngineError> {
        log::info!("startSubscribe: {user_id} {stream_kind:?} <- {stream_address}");
        self.ensure_initialized()?;
        require_render_target(user_id, stream_kind, render_target.as_ref())?;
        let urls = self.signaling_urls(stream_address)?;

        self.replace_existing(user_id, Role::Subscribe).await;
        if let Some(target) = &render_target {
            self.inner.registry.detach_target_elsewhere(user_id, target);
        }

        self.open_session(OpenRequest {
            user_id,
            role: Role::Subscribe,
            stream_kind,
            urls,
            render_target,
            local_tracks: Vec::new(),
            media: None,
        })
        .await
    }

    /// Stops playing `user_id`. The render surface is detached but stays
    /// usable by the caller.
    pub async fn stop_subscribe(&self, user_id: &str) -> Result<(), EngineError> {
        let Some(session) = self
            .inner
            .registry
            .get(user_id)
            .filter(|s| s.role() == Role::Subscribe)
        else {
            log::debug!("stopSubscribe: no subscriber {user_id}");
            return Ok(());
        };
        log::info!("stopSubscribe: {user_id}");
        self.inner
            .registry
            .remove_if_current(user_id, session.generation());
        session.close().await;
        Ok(())
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    fn signaling_urls(&self, stream_address: &str) -> Result<SignalingUrls, EngineError> {
        let config = self.config();
        SignalingUrls::from_stream_address(stream_address, config.api_port, &config.api_prefix)
    }

    /// Closes whatever session is registered under `user_id`. A publisher
    /// replaced by a subscriber gives up the capture source.
    async fn replace_existing(&self, user_id: &str, next_role: Role) {
        let Some(previous) = self.inner.registry.remove(user_id) else {
            return;
        };
        log::info!(
            "replacing {:?} session {user_id} (generation {})",
            previous.role(),
            previous.generation()
        );
        previous.close().await;
        if previous.role() == Role::Publish && next_role == Role::Subscribe {
            self.inner.release_publisher(user_id);
        }
    }

    /// Reuses the running capture source when its shape fits, otherwise
    /// (re)starts it.
    fn local_media(
        &self,
        devices: &DeviceContext,
        owner: &str,
        user_id: &str,
        stream_kind: StreamKind,
        preview: Option<&Arc<dyn RenderTarget>>,
    ) -> Result<Arc<LocalMediaSource>, EngineError> {
        let existing = self
            .inner
            .runtime
            .lock()
            .as_ref()
            .and_then(|rt| rt.media.clone());
        if let Some(media) = existing {
            if media.has_video() == stream_kind.has_video() && !media.is_disposed() {
                if let Some(target) = preview {
                    media.attach_preview(target);
                }
                return Ok(media);
            }
            log::debug!("capture shape changed, restarting local media");
            media.dispose();
        }

        let media = Arc::new(LocalMediaSource::start(
            devices.capture.clone(),
            owner,
            self.capture_config(),
            stream_kind.has_video(),
            preview,
        )?);
        let mut runtime = self.inner.runtime.lock();
        let rt = runtime.as_mut().ok_or(EngineError::NotInitialized)?;
        if rt.publisher.as_deref() != Some(user_id) {
            // stopped while the previous session was closing
            drop(runtime);
            media.dispose();
            return Err(NegotiationError::Cancelled.into());
        }
        rt.media = Some(media.clone());
        Ok(media)
    }

    async fn open_session(&self, request: OpenRequest<'_>) -> Result<SessionHandle, EngineError> {
        let (factory, negotiator): (Arc<dyn ConnectionFactory>, Arc<Negotiator>) = {
            let runtime = self.inner.runtime.lock();
            let rt = runtime.as_ref().ok_or(EngineError::NotInitialized)?;
            (rt.factory.clone(), rt.negotiator.clone())
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = factory.create(request.user_id, tx).await?;

        let session = Arc::new(Session::new(SessionParts {
            user_id: request.user_id.to_owned(),
            generation: self.inner.registry.next_generation(),
            role: request.role,
            stream_kind: request.stream_kind,
            urls: request.urls,
            connection,
            local_tracks: request.local_tracks,
            events: self.inner.events.clone(),
        }));
        if let Some(target) = &request.render_target {
            session.bind_render_target(target);
        }

        // registering happens under the runtime lock so a concurrent stop or
        // teardown either sees this session or makes this start give up
        let admitted = {
            let runtime = self.inner.runtime.lock();
            admit(runtime.as_ref(), &negotiator, request.user_id, request.media.as_ref())
                .map(|()| self.inner.registry.insert(session.clone()))
        };
        let raced = match admitted {
            Ok(raced) => raced,
            Err(e) => {
                log::info!("[{}] start abandoned: {e}", request.user_id);
                session.close().await;
                return Err(e);
            }
        };

        // a concurrent start for the same id may have slipped in
        if let Some(raced) = raced {
            log::debug!(
                "[{}] closing concurrently started generation {}",
                raced.user_id(),
                raced.generation()
            );
            raced.close().await;
        }

        self.inner.spawn_session(session.clone(), negotiator, rx);
        Ok(SessionHandle::new(session))
    }
}

/// Whether a session built against `negotiator` (and `media`, for a
/// publisher) still belongs to the running engine.
fn admit(
    runtime: Option<&Runtime>,
    negotiator: &Arc<Negotiator>,
    user_id: &str,
    media: Option<&Arc<LocalMediaSource>>,
) -> Result<(), EngineError> {
    let rt = runtime
        .filter(|rt| Arc::ptr_eq(&rt.negotiator, negotiator))
        .ok_or(EngineError::NotInitialized)?;
    let Some(media) = media else {
        return Ok(());
    };
    let owns_slot = rt.publisher.as_deref() == Some(user_id);
    let same_media = rt.media.as_ref().is_some_and(|m| Arc::ptr_eq(m, media));
    if owns_slot && same_media {
        Ok(())
    } else {
        Err(NegotiationError::Cancelled.into())
    }
}

/// A start that lost to a stop or teardown must leave the publisher slot
/// alone; it may already belong to a newer start.
fn superseded(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::NotInitialized | EngineError::Negotiation(NegotiationError::Cancelled)
    )
}

fn require_render_target(
    user_id: &str,
    stream_kind: StreamKind,
    render_target: Option<&Arc<dyn RenderTarget>>,
) -> Result<(), EngineError> {
    if stream_kind.has_video() && render_target.is_none() {
        log::error!("{user_id}: video requested without a render target");
        return Err(EngineError::MissingRenderTarget(user_id.to_owned()));
    }
    Ok(())
}
