//! Framecast server: streams depth/RGB/IR frames to TCP clients
//!
//! Usage: `framecast [config.toml]`. Without a camera driver attached the
//! synthetic source feeds the server so clients can be tested end to end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framecast::capture::{FrameSource, SyntheticSource};
use framecast::{Config, StreamServer};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.logging.filter);

    info!("Framecast launching...");
    framecast::CONFIG.store(Arc::new(config.clone()));

    let server = Arc::new(StreamServer::new(config.server.clone()));
    server.start(config.server.port)?;

    let mut source = if config.source.enabled {
        let mut source = SyntheticSource::new(config.source.clone());
        let sink = Arc::clone(&server);
        source.start(move |raw| sink.push_frame(Some(raw)))?;
        Some(source)
    } else {
        info!("Synthetic source disabled, waiting for an external capture driver");
        None
    };

    let reporter = tokio::spawn(report_stats(Arc::clone(&server)));
    let reloader = tokio::spawn(reload_on_hangup(Arc::clone(&server), config_path));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    reporter.abort();
    reloader.abort();
    if let Some(source) = source.as_mut() {
        source.stop()?;
    }
    server.stop();

    info!("Framecast shut down");
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
}

/// Periodically log ingest and send rates
async fn report_stats(server: Arc<StreamServer>) {
    let mut last = server.stats();
    let mut last_at = Instant::now();

    loop {
        let secs = framecast::CONFIG.load().logging.stats_interval_secs;
        if secs == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        tokio::time::sleep(Duration::from_secs(secs)).await;

        let now = server.stats();
        let (ingest_fps, send_fps) = now.rates_since(&last, last_at.elapsed());
        info!(
            clients = now.connected_clients,
            buffered = now.buffered_frames,
            evicted = now.frames_evicted,
            failures = now.ingest_failures,
            "Ingest {:.1} fps, sent {:.1} fps",
            ingest_fps,
            send_fps
        );
        last = now;
        last_at = Instant::now();
    }
}

/// Re-read the configuration file on SIGHUP and push the new tunables
#[cfg(unix)]
async fn reload_on_hangup(server: Arc<StreamServer>, path: Option<PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGHUP handler unavailable: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match Config::load(path.as_deref()) {
            Ok(config) => {
                server.update_config(config.server.clone());
                framecast::CONFIG.store(Arc::new(config));
                info!("Configuration reloaded");
            }
            Err(e) => warn!("Keeping previous configuration: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_server: Arc<StreamServer>, _path: Option<PathBuf>) {}
