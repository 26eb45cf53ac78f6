use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use srs_rtc::media::{NullAudioRouting, SilentCaptureDevice};
use srs_rtc::{
    logger, DeviceContext, Engine, EngineConfig, EngineEvent, RenderTarget, StreamKind, VideoFeed,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish to or play from an SRS server over WebRTC", long_about = None)]
struct Args {
    /// TOML engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only negotiate audio
    #[arg(long, global = true)]
    audio_only: bool,

    /// User id for the session
    #[arg(short, long, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish silence (and an empty video track) to a stream
    Publish {
        /// e.g. webrtc://192.168.1.161/live/livestream
        address: String,
    },
    /// Play a stream and log what arrives
    Play { address: String },
}

/// Render target that counts received video packets instead of drawing them.
#[derive(Default)]
struct LoggingRenderTarget {
    packets: Arc<AtomicU64>,
    reader: Mutex<Option<CancellationToken>>,
}

impl RenderTarget for LoggingRenderTarget {
    fn attach(&self, feed: VideoFeed) {
        log::info!("render: attached {}", feed.track_id());
        let VideoFeed::Remote(track) = feed else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let token = CancellationToken::new();
        if let Some(previous) = self.reader.lock().replace(token.clone()) {
            previous.cancel();
        }
        let packets = self.packets.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    read = track.read_rtp() => match read {
                        Ok(_) => {
                            let n = packets.fetch_add(1, Ordering::Relaxed) + 1;
                            if n % 500 == 0 {
                                log::info!("render: {n} video packets received");
                            }
                        }
                        Err(e) => {
                            log::debug!("render: track ended: {e}");
                            break;
                        }
                    },
                }
            }
        });
    }

    fn detach(&self) {
        if let Some(token) = self.reader.lock().take() {
            token.cancel();
        }
        log::info!(
            "render: detached after {} packets",
            self.packets.load(Ordering::Relaxed)
        );
    }

    fn set_mirror(&self, mirror: bool) {
        log::debug!("render: mirror={mirror}");
    }

    fn release(&self) {
        log::debug!("render: released");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if !logger::init(&config.logging) {
        eprintln!("logger already installed");
    }

    let engine = Engine::new(config);
    engine.init(
        DeviceContext::new(
            Arc::new(SilentCaptureDevice::new()),
            Arc::new(NullAudioRouting),
        ),
        &args.user,
    )?;

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::SessionStateChanged { user_id, state } => {
                    log::info!("{user_id}: {state:?}")
                }
                EngineEvent::SessionFailed { user_id, error } => {
                    log::error!("{user_id}: {error}")
                }
                _ => {}
            }
        }
    });

    let kind = if args.audio_only {
        StreamKind::AudioOnly
    } else {
        StreamKind::AudioVideo
    };
    let target: Arc<dyn RenderTarget> = Arc::new(LoggingRenderTarget::default());
    let handle = match &args.command {
        Command::Publish { address } => {
            engine
                .start_publish(&args.user, kind, address, Some(target.clone()))
                .await?
        }
        Command::Play { address } => {
            engine
                .start_subscribe(&args.user, kind, address, Some(target.clone()))
                .await?
        }
    };

    tokio::select! {
        result = handle.wait_active() => match result {
            Ok(()) => {
                log::info!("session active, Ctrl-C to stop");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = handle.wait_closed() => log::warn!("session closed"),
                }
            }
            Err(e) => log::error!("negotiation failed: {e}"),
        },
        _ = tokio::signal::ctrl_c() => {}
    }

    engine.teardown().await;
    Ok(())
}
