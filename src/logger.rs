use crate::config::LoggingConfig;
use crate::peer::types::IceCandidate;
use log::LevelFilter;
use std::io::Write;
use webrtc::peer_connection::RTCPeerConnection;

/// Installs the env_logger backend with timestamped lines.
///
/// `RUST_LOG` wins over the configured level. Returns `false` when a logger
/// was already installed, which is harmless.
pub fn init(config: &LoggingConfig) -> bool {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.as_str()),
    );
    if !config.enabled {
        builder.filter_level(LevelFilter::Off);
    }
    builder.format(|buf, record| {
        let now = chrono::Local::now();
        writeln!(
            buf,
            "RTC: [{}] {:<5} {}: {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.try_init().is_ok()
}

/// Logs a candidate as soon as it is gathered
pub fn dump_candidate(label: &str, user_id: &str, cand: &IceCandidate) {
    log::debug!(
        "Trickle {label} [{user_id}]: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Quick getStats snapshot of the nominated pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                log::info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
