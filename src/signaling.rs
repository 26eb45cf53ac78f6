//! HTTP signaling against the SRS `/rtc/v1/{publish,play}/` API.
//!
//! One POST carries the local offer, the response carries the answer. There is
//! no retry here; the negotiator owns that policy.

use crate::config::SignalingConfig;
use crate::error::{EngineError, SignalingError};
use crate::session::Role;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_STREAM_PATH: &str = "/live/livestream";
/// JSON `code` (and HTTP status) SRS uses for a rejected offer.
pub const REJECTED_CODE: i64 = 400;

/// Endpoints derived from one `webrtc://` stream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingUrls {
    pub host: String,
    pub play_url: String,
    pub publish_url: String,
    pub stream_url: String,
}

impl SignalingUrls {
    /// `webrtc://<host>[:port]/<app>/<stream>[?query]` → API urls on `api_port`.
    pub fn from_stream_address(
        address: &str,
        api_port: u16,
        api_prefix: &str,
    ) -> Result<Self, EngineError> {
        let invalid = |reason: &str| EngineError::InvalidStreamAddress {
            address: address.to_owned(),
            reason: reason.to_owned(),
        };

        let parsed = Url::parse(address.trim()).map_err(|e| invalid(&e.to_string()))?;
        if parsed.scheme() != "webrtc" {
            return Err(invalid("scheme must be webrtc://"));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_owned();

        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let path = match parsed.path() {
            "" | "/" => DEFAULT_STREAM_PATH,
            p => p,
        };
        let mut stream_url = format!("webrtc://{authority}{path}");
        if let Some(query) = parsed.query() {
            stream_url.push('?');
            stream_url.push_str(query);
        }

        let prefix = api_prefix.trim_end_matches('/');
        let play_url = format!("http://{host}:{api_port}{prefix}/play/");
        let publish_url = play_url.replacen("/play/", "/publish/", 1);

        Ok(Self {
            host,
            play_url,
            publish_url,
            stream_url,
        })
    }

    pub fn endpoint_for(&self, role: Role) -> &str {
        match role {
            Role::Publish => &self.publish_url,
            Role::Subscribe => &self.play_url,
        }
    }
}

/// Body POSTed to the publish/play endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OfferRequest {
    pub api: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tid: Option<String>,
    pub streamurl: String,
    pub clientip: String,
    pub sdp: String,
}

/// Response of the publish/play endpoint.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnswerResponse {
    pub code: i64,
    #[serde(default)]
    pub sdp: String,
    #[serde(default)]
    pub sessionid: Option<String>,
}

/// Re-terminates every line with CRLF and drops blank lines.
///
/// Answers arrive with mixed `\n`, `\r\n` or stray `\r` endings depending on
/// the proxy in front of SRS; the SDP parser wants strict CRLF.
pub fn normalize_sdp(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    for line in raw.split(['\n', '\r']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// One offer/answer exchange with the media server.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn exchange_offer(
        &self,
        endpoint: &str,
        request: &OfferRequest,
    ) -> Result<String, SignalingError>;
}

/// reqwest-backed signaling client with fixed timeouts.
#[derive(Debug, Clone)]
pub struct HttpSignalingClient {
    client: reqwest::Client,
}

impl HttpSignalingClient {
    pub fn new(config: &SignalingConfig) -> Result<Self, SignalingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SignalingTransport for HttpSignalingClient {
    async fn exchange_offer(
        &self,
        endpoint: &str,
        request: &OfferRequest,
    ) -> Result<String, SignalingError> {
        log::debug!(
            "POST {endpoint} streamurl={} clientip={} sdp_len={}",
            request.streamurl,
            request.clientip,
            request.sdp.len()
        );

        let resp = self.client.post(endpoint).json(request).send().await?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(SignalingError::Rejected {
                code: REJECTED_CODE,
            });
        }
        if !status.is_success() {
            return Err(SignalingError::Status(status.as_u16()));
        }

        let answer: AnswerResponse = resp.json().await?;
        log::debug!(
            "answer from {endpoint}: code={} sessionid={:?} sdp_len={}",
            answer.code,
            answer.sessionid,
            answer.sdp.len()
        );
        if answer.code == REJECTED_CODE {
            return Err(SignalingError::Rejected { code: answer.code });
        }

        let sdp = normalize_sdp(&answer.sdp);
        if sdp.is_empty() {
            return Err(SignalingError::EmptyAnswer { code: answer.code });
        }
        Ok(sdp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_publish_play_and_stream_urls() {
        let urls =
            SignalingUrls::from_stream_address("webrtc://10.0.0.5/live/livestream", 1985, "/rtc/v1")
                .unwrap();
        assert_eq!(urls.host, "10.0.0.5");
        assert_eq!(urls.publish_url, "http://10.0.0.5:1985/rtc/v1/publish/");
        assert_eq!(urls.play_url, "http://10.0.0.5:1985/rtc/v1/play/");
        assert_eq!(urls.stream_url, "webrtc://10.0.0.5/live/livestream");
        assert_eq!(urls.endpoint_for(Role::Publish), urls.publish_url);
        assert_eq!(urls.endpoint_for(Role::Subscribe), urls.play_url);
    }

    #[test]
    fn keeps_stream_path_port_and_query() {
        let urls = SignalingUrls::from_stream_address(
            "webrtc://media.example.org:8000/show/cam2?secret=abc",
            1985,
            "/rtc/v1/",
        )
        .unwrap();
        assert_eq!(urls.host, "media.example.org");
        assert_eq!(urls.play_url, "http://media.example.org:1985/rtc/v1/play/");
        assert_eq!(
            urls.stream_url,
            "webrtc://media.example.org:8000/show/cam2?secret=abc"
        );
    }

    #[test]
    fn bare_host_falls_back_to_default_stream() {
        let urls = SignalingUrls::from_stream_address("webrtc://192.168.1.161", 1985, "/rtc/v1")
            .unwrap();
        assert_eq!(urls.stream_url, "webrtc://192.168.1.161/live/livestream");
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        for bad in ["http://10.0.0.5/live/livestream", "livestream", ""] {
            let err = SignalingUrls::from_stream_address(bad, 1985, "/rtc/v1").unwrap_err();
            assert!(matches!(err, EngineError::InvalidStreamAddress { .. }), "{bad}");
        }
    }

    #[test]
    fn offer_request_uses_srs_field_names() {
        let req = OfferRequest {
            api: "http://h:1985/rtc/v1/play/".into(),
            tid: None,
            streamurl: "webrtc://h/live/livestream".into(),
            clientip: "10.0.0.9".into(),
            sdp: "v=0\r\n".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "api": "http://h:1985/rtc/v1/play/",
                "streamurl": "webrtc://h/live/livestream",
                "clientip": "10.0.0.9",
                "sdp": "v=0\r\n",
            })
        );
    }

    #[test]
    fn answer_tolerates_extra_and_missing_fields() {
        let answer: AnswerResponse =
            serde_json::from_str(r#"{"code":0,"server":"vid-1","sessionid":"s:1","sdp":"v=0"}"#)
                .unwrap();
        assert_eq!(answer.code, 0);
        assert_eq!(answer.sessionid.as_deref(), Some("s:1"));

        let rejected: AnswerResponse = serde_json::from_str(r#"{"code":400}"#).unwrap();
        assert_eq!(rejected.code, REJECTED_CODE);
        assert!(rejected.sdp.is_empty());
    }

    #[test]
    fn normalize_reterminates_lines() {
        let raw = "v=0\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\r\n\n t=0 0 \n";
        assert_eq!(
            normalize_sdp(raw),
            "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n"
        );
        assert_eq!(normalize_sdp("\n\r\n  "), "");
    }
}
