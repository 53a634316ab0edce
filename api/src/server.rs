use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use vision_common::config::ServerConfig;
use vision_common::frame::{FrameCache, FrameSink};

use crate::error::ServerError;
use crate::routes::{self, AppState};
use crate::store::PhotoStore;

/// The active listener.
struct ServerHandle {
    addr: SocketAddr,
    /// Stop accepting and let open connections finish their current request.
    shutdown: oneshot::Sender<()>,
    /// Abort every connection still open.
    force: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    handle: Option<ServerHandle>,
    /// `PhotoStore::prepare` has run.
    prepared: bool,
}

/// Restartable HTTP server exposing the live frame and the photo gallery.
///
/// `start` and `stop` are idempotent and serialized by one lock, so at most
/// one listener exists per instance. Request handlers never take that lock.
pub struct MediaServer {
    frames: Arc<FrameCache>,
    store: Arc<dyn PhotoStore>,
    bind_ip: IpAddr,
    shutdown_grace: Duration,
    shutdown_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl MediaServer {
    pub fn new(frames: Arc<FrameCache>, store: Arc<dyn PhotoStore>) -> Self {
        Self {
            frames,
            store,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shutdown_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            lifecycle: Mutex::new(Lifecycle::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        frames: Arc<FrameCache>,
        store: Arc<dyn PhotoStore>,
    ) -> Result<Self, ServerError> {
        let bind_ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.bind_address.clone()))?;
        Ok(Self::new(frames, store)
            .with_bind_address(bind_ip)
            .with_shutdown_timeouts(config.shutdown_grace(), config.shutdown_timeout()))
    }

    pub fn with_bind_address(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// `grace` lets in-flight requests finish; after `timeout` the server task is aborted.
    pub fn with_shutdown_timeouts(mut self, grace: Duration, timeout: Duration) -> Self {
        self.shutdown_grace = grace;
        self.shutdown_timeout = timeout.max(grace);
        self
    }

    pub fn frames(&self) -> &Arc<FrameCache> {
        &self.frames
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address of the active listener, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.handle.as_ref().map(|h| h.addr)
    }

    /// Bind `port` and serve all routes. A no-op if already running.
    ///
    /// Port 0 binds an ephemeral port; see [`local_addr`](Self::local_addr).
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(handle) = &lifecycle.handle {
            info!(port, addr = %handle.addr, "media server is already running");
            return Ok(());
        }

        if !lifecycle.prepared {
            if let Err(e) = self.store.prepare() {
                warn!(
                    error = %e,
                    dir = %self.store.output_directory().display(),
                    "photo store preparation failed"
                );
            }
            lifecycle.prepared = true;
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        info!(%addr, "starting media server");
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(source) => {
                error!(error = %source, %addr, "failed to start media server");
                return Err(ServerError::Bind { addr, source });
            }
        };
        let bound = listener.local_addr().unwrap_or(addr);

        let app = routes::router(Arc::new(AppState {
            frames: Arc::clone(&self.frames),
            store: Arc::clone(&self.store),
        }));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (force_tx, force_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, app, shutdown_rx, force_rx));

        lifecycle.handle = Some(ServerHandle {
            addr: bound,
            shutdown: shutdown_tx,
            force: force_tx,
            task,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(addr = %bound, "media server started");
        Ok(())
    }

    /// Shut the listener down. A no-op if already stopped.
    ///
    /// Stops accepting at once, waits up to the grace period and then up to
    /// the timeout for open requests, then aborts every remaining connection.
    /// When this returns no request handler is still being driven, and the
    /// cached frame is cleared so a restart never serves a stale image.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(ServerHandle {
            addr,
            shutdown,
            force,
            mut task,
        }) = lifecycle.handle.take()
        else {
            info!("media server is not running or already stopped");
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        info!(%addr, "stopping media server");

        let _ = shutdown.send(());
        match tokio::time::timeout(self.shutdown_grace, &mut task).await {
            Ok(result) => log_join(result),
            Err(_) => {
                warn!(
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "grace period elapsed, waiting for in-flight requests"
                );
                let remaining = self.shutdown_timeout.saturating_sub(self.shutdown_grace);
                match tokio::time::timeout(remaining, &mut task).await {
                    Ok(result) => log_join(result),
                    Err(_) => {
                        warn!(
                            timeout_ms = self.shutdown_timeout.as_millis() as u64,
                            "shutdown timeout reached, aborting open connections"
                        );
                        let _ = force.send(());
                        log_join(task.await);
                    }
                }
            }
        }

        self.frames.clear();
        info!(%addr, "media server stopped");
    }
}

/// Accept loop. Every connection task lives in one `JoinSet` owned here, so
/// none of them can outlive this future.
async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: oneshot::Receiver<()>,
    mut force: oneshot::Receiver<()>,
) {
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let service = TowerToHyperService::new(app.clone());
                let mut drain = drain_rx.clone();
                connections.spawn(async move {
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);
                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = drain.changed() => {
                            // Finish the request in progress, then close.
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = result {
                        debug!(error = %e, %peer, "connection closed with error");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let _ = drain_tx.send(true);
    debug!(open = connections.len(), "listener closed, draining connections");

    let drained = loop {
        tokio::select! {
            joined = connections.join_next() => {
                if joined.is_none() {
                    break true;
                }
            }
            _ = &mut force => break false,
        }
    };
    if !drained {
        warn!(open = connections.len(), "aborting connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "media server task failed during shutdown");
    }
}

impl FrameSink for MediaServer {
    /// Frames arriving while the server is stopped are dropped.
    fn push_frame(&self, jpeg: &[u8]) {
        if !self.is_running() {
            debug!(bytes = jpeg.len(), "media server not running, frame dropped");
            return;
        }
        self.frames.set(jpeg);
    }
}
