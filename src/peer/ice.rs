use crate::error::ConfigError;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use parking_lot::Mutex;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN pair used when no servers are configured.
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "ICE server {} has an empty url",
                server.id
            )));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

/// Converts configured servers into webrtc-rs entries.
pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
    remote_ready: bool,
    gathering_complete: bool,
}

/// Per-session candidate bookkeeping.
///
/// Local candidates are recorded as they are gathered. Remote candidates
/// that arrive before the answer has been applied are held back and handed
/// out in one batch by [`CandidateQueue::mark_remote_ready`].
#[derive(Default)]
pub struct CandidateQueue {
    inner: Mutex<QueueInner>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_local(&self, candidate: IceCandidate) -> usize {
        let mut inner = self.inner.lock();
        inner.local.push(candidate);
        inner.local.len()
    }

    pub fn local(&self) -> Vec<IceCandidate> {
        self.inner.lock().local.clone()
    }

    pub fn mark_gathering_complete(&self) {
        self.inner.lock().gathering_complete = true;
    }

    pub fn is_gathering_complete(&self) -> bool {
        self.inner.lock().gathering_complete
    }

    /// Returns the candidate back if it can be applied right away,
    /// otherwise keeps it until the remote description is set.
    pub fn offer_remote(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut inner = self.inner.lock();
        if inner.remote_ready {
            Some(candidate)
        } else {
            inner.pending_remote.push(candidate);
            None
        }
    }

    pub fn mark_remote_ready(&self) -> Vec<IceCandidate> {
        let mut inner = self.inner.lock();
        inner.remote_ready = true;
        inner.pending_remote.drain(..).collect()
    }

    pub fn pending_remote_len(&self) -> usize {
        self.inner.lock().pending_remote.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.local.clear();
        inner.pending_remote.clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    log::info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host,
        summary.srflx,
        summary.relay
    );

    if summary.relay == 0 {
        log::debug!("No TURN relay candidates found, connection through strict NAT may fail");
    }
    summary
}
