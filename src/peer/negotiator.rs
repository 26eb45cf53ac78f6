//! Drives one session from `Created` to `Active`.
//!
//! The steps run strictly in order per session: transceivers, local
//! description, signaling round-trip, remote description. Each step checks
//! that the session is still the registry's entry for its id before it
//! touches shared state, so a replaced or stopped session never applies a
//! late answer.

use crate::config::RetryPolicy;
use crate::error::{NegotiationError, SignalingError};
use crate::peer::state::PeerRegistry;
use crate::session::{transceiver_plan, Role, Session, SessionState};
use crate::signaling::{OfferRequest, SignalingTransport};
use crate::utils::{local_ip_towards, random_id};
use std::sync::Arc;
use std::time::Duration;

pub struct Negotiator {
    signaling: Arc<dyn SignalingTransport>,
    retry: RetryPolicy,
    gathering_timeout: Duration,
    api_port: u16,
}

impl Negotiator {
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        retry: RetryPolicy,
        gathering_timeout: Duration,
        api_port: u16,
    ) -> Self {
        Self {
            signaling,
            retry,
            gathering_timeout,
            api_port,
        }
    }

    /// Runs the whole negotiation, giving up with `Cancelled` as soon as the
    /// session's token fires.
    pub async fn run(
        &self,
        session: &Arc<Session>,
        registry: &PeerRegistry,
    ) -> Result<(), NegotiationError> {
        let cancel = session.cancel_token();
        tokio::select! {
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            result = self.drive(session, registry) => result,
        }
    }

    async fn drive(
        &self,
        session: &Arc<Session>,
        registry: &PeerRegistry,
    ) -> Result<(), NegotiationError> {
        let uid = session.user_id();
        let conn = session.connection().clone();

        self.attach_transceivers(session).await?;

        ensure_current(session, registry)?;
        session.transition(SessionState::OfferPending);
        let offer = conn.create_offer().await?;
        conn.set_local_description(offer).await?;
        conn.wait_for_gathering(self.gathering_timeout).await;

        let local_sdp = conn
            .local_description()
            .await
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or(NegotiationError::EmptyLocalDescription)?;

        ensure_current(session, registry)?;
        session.transition(SessionState::Signaling);

        let urls = session.urls();
        let endpoint = urls.endpoint_for(session.role());
        let request = OfferRequest {
            api: endpoint.to_owned(),
            tid: Some(random_id()),
            streamurl: urls.stream_url.clone(),
            clientip: self.client_ip(&urls.host).await,
            sdp: local_sdp,
        };
        let answer = self.exchange_with_retry(endpoint, &request).await?;

        ensure_current(session, registry)?;
        conn.set_remote_answer(answer).await?;

        let pending = session.candidates().mark_remote_ready();
        if !pending.is_empty() {
            log::debug!("[{uid}] applying {} queued remote candidate(s)", pending.len());
        }
        for candidate in pending {
            if let Err(e) = conn.add_ice_candidate(candidate).await {
                log::warn!("[{uid}] queued remote candidate rejected: {e}");
            }
        }

        session.transition(SessionState::Active);
        log::info!("[{uid}] {:?} session active", session.role());
        Ok(())
    }

    /// Address SRS should see us as. Resolving the host may block on DNS.
    async fn client_ip(&self, host: &str) -> String {
        let host = host.to_owned();
        let port = self.api_port;
        tokio::task::spawn_blocking(move || local_ip_towards(&host, port))
            .await
            .ok()
            .flatten()
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }

    async fn attach_transceivers(&self, session: &Session) -> Result<(), NegotiationError> {
        let conn = session.connection();
        for spec in transceiver_plan(session.role(), session.stream_kind()) {
            let track = match session.role() {
                Role::Publish => Some(
                    session
                        .local_tracks()
                        .iter()
                        .find(|t| t.kind() == spec.kind)
                        .cloned()
                        .ok_or_else(|| {
                            NegotiationError::Connection(format!(
                                "no local {:?} track to publish",
                                spec.kind
                            ))
                        })?,
                ),
                Role::Subscribe => None,
            };
            conn.add_transceiver(spec, track).await?;
        }
        Ok(())
    }

    /// Posts the offer, retrying transport failures with backoff. Protocol
    /// answers (rejection, empty sdp) end the exchange at once.
    async fn exchange_with_retry(
        &self,
        endpoint: &str,
        request: &OfferRequest,
    ) -> Result<String, NegotiationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.signaling.exchange_offer(endpoint, request).await {
                Ok(sdp) => return Ok(sdp),
                Err(SignalingError::Rejected { code }) => {
                    return Err(NegotiationError::Rejected {
                        endpoint: endpoint.to_owned(),
                        code,
                    })
                }
                Err(SignalingError::EmptyAnswer { code }) => {
                    return Err(NegotiationError::EmptyAnswer(code))
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "signaling attempt {attempt}/{} to {endpoint} failed: {e}; retrying in {delay:?}",
                        self.retry.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(NegotiationError::Transport {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

fn ensure_current(session: &Session, registry: &PeerRegistry) -> Result<(), NegotiationError> {
    if session.is_closed() || !registry.is_current(session.user_id(), session.generation()) {
        log::debug!(
            "[{}] generation {} is stale, dropping negotiation",
            session.user_id(),
            session.generation()
        );
        return Err(NegotiationError::Cancelled);
    }
    Ok(())
}
