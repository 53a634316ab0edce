use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use vision_api::{net, DirectoryPhotoStore, MediaServer};
use vision_common::config::Config;
use vision_common::frame::FrameCache;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let frames = Arc::new(FrameCache::new());
    let store = Arc::new(DirectoryPhotoStore::new(
        &config.photos.output_dir,
        Arc::clone(&frames),
    ));
    let server = match MediaServer::from_config(&config.server, frames, store) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "invalid server configuration");
            std::process::exit(1);
        }
    };

    if server.start(config.server.port).await.is_err() {
        std::process::exit(1);
    }
    if let Some(addr) = server.local_addr().await {
        match net::local_ip() {
            Some(ip) => info!(
                url = format!("http://{ip}:{}/", addr.port()),
                photos = %config.photos.output_dir.display(),
                "vision server ready"
            ),
            None => warn!(%addr, "could not determine LAN address"),
        }
    }

    let producer = config.stream.clone().map(|stream| {
        let sink = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = vision_producer::run_producer(&stream, sink.as_ref()).await {
                error!(error = %e, "frame producer stopped");
            }
        })
    });
    if producer.is_none() {
        info!("no [stream] configured, live view stays empty");
    }

    shutdown_signal().await;
    info!("shutdown requested");
    if let Some(task) = producer {
        task.abort();
    }
    server.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
