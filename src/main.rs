//! janus-videoroom - Main entry point

use clap::Parser;
use janus_videoroom::args::Args;
use janus_videoroom::config::Config;
use janus_videoroom::janus::protocol::VIDEOROOM_PLUGIN;
use janus_videoroom::media::MediaEngineFactory;
use janus_videoroom::transport::{HttpTransport, SignalingTransport};
use janus_videoroom::VideoRoomClient;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            Config::default()
        }
    };
    args.apply(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("JANUS_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_srtp", log::LevelFilter::Error)
        .init();

    info!("janus-videoroom v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let transport: Arc<dyn SignalingTransport> = Arc::new(HttpTransport::new(
        &config.server.url,
        config.request_timeout(),
        config.poll_timeout(),
    )?);

    match transport.server_info().await {
        Ok(server) => {
            info!(
                "Connected to {} {}",
                server.name.as_deref().unwrap_or("gateway"),
                server.version_string.as_deref().unwrap_or("")
            );
            if !server.supports(VIDEOROOM_PLUGIN) {
                warn!("Gateway does not advertise {}", VIDEOROOM_PLUGIN);
            }
        }
        Err(e) => warn!("Failed to query gateway info: {}", e),
    }

    let factory = media_factory(&config)?;
    let mut client = VideoRoomClient::connect(transport, factory, &config).await?;
    info!(
        "Session {} joining room {} as {:?}",
        client.session_id(),
        config.room.room_id,
        config.room.display
    );
    client.publish().await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving room");
            ctrl_c.cancel();
        }
    });

    let outcome = client.run(shutdown).await;
    if let Err(ref e) = outcome {
        error!("Session ended: {}", e);
    }
    if let Err(e) = client.shutdown().await {
        warn!("Session teardown failed: {}", e);
    }
    outcome.map_err(Into::into)
}

#[cfg(feature = "webrtc-engine")]
fn media_factory(config: &Config) -> Result<Arc<dyn MediaEngineFactory>, Box<dyn std::error::Error>> {
    Ok(Arc::new(janus_videoroom::media::WebRtcEngineFactory::new(&config.media)))
}

#[cfg(not(feature = "webrtc-engine"))]
fn media_factory(_config: &Config) -> Result<Arc<dyn MediaEngineFactory>, Box<dyn std::error::Error>> {
    Err("built without a media engine; enable the webrtc-engine feature".into())
}
