use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use audiocast_rtp_core::RtpStreamer;

use crate::session::{RtspSession, SharedStreamer};
use crate::{Error, Result, DEFAULT_RTSP_PORT, DEFAULT_SESSION_TIMEOUT_MS};

/// Callback deciding whether a requested stream path is served
pub type ServerPathCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Configuration shared by both server flavors
#[derive(Debug, Clone)]
pub struct RtspServerConfig {
    pub port: u16,
    /// Close a streaming session when no request arrived for this long
    pub session_timeout: Duration,
    /// How long one service pass waits for a request
    pub read_timeout: Duration,
    /// Concurrent control connections; further clients are accepted
    /// only after the current session closes
    pub max_clients: usize,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RTSP_PORT,
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            read_timeout: Duration::from_millis(50),
            max_clients: 1,
        }
    }
}

/// Task driven RTSP server: an accept loop task hands each client to a
/// session task that serves it until the session closes.
pub struct RtspServer {
    cfg: RtspServerConfig,
    streamer: SharedStreamer,
    listener: Option<Arc<TcpListener>>,
    local_port: u16,
    client_count: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    accept_task: Option<JoinHandle<()>>,
    on_session_path: Option<ServerPathCallback>,
}

impl RtspServer {
    pub fn new(streamer: RtpStreamer, cfg: RtspServerConfig) -> Self {
        Self {
            cfg,
            streamer: Arc::new(Mutex::new(streamer)),
            listener: None,
            local_port: 0,
            client_count: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_task: None,
            on_session_path: None,
        }
    }

    /// The shared streamer, e.g. to push fresh audio source settings
    pub fn streamer(&self) -> SharedStreamer {
        self.streamer.clone()
    }

    pub fn set_on_session_path(&mut self, callback: ServerPathCallback) {
        self.on_session_path = Some(callback);
    }

    /// Bind the listening socket; returns the actual local port
    pub async fn begin(&mut self) -> Result<u16> {
        self.streamer.lock().await.init_audio_source();
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.cfg.port))
            .await
            .map_err(|e| Error::Connect(format!("bind port {} failed: {}", self.cfg.port, e)))?;
        self.local_port = listener.local_addr()?.port();
        info!(port = self.local_port, "rtsp server listening");
        self.listener = Some(Arc::new(listener));
        Ok(self.local_port)
    }

    /// Start the accept loop; clients are served on their own tasks
    pub fn run(&mut self) -> Result<()> {
        let Some(listener) = self.listener.clone() else {
            return Err(Error::InvalidState("server not bound, call begin".into()));
        };
        if self.accept_task.is_some() {
            return Ok(());
        }

        let streamer = self.streamer.clone();
        let client_count = self.client_count.clone();
        let cfg = self.cfg.clone();
        let on_session_path = self.on_session_path.clone();
        let shutdown = self.shutdown.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                if client_count.load(Ordering::SeqCst) >= cfg.max_clients {
                    debug!(%peer, "busy, rejecting additional client");
                    drop(socket);
                    continue;
                }
                info!(%peer, "client connected");
                client_count.fetch_add(1, Ordering::SeqCst);

                let streamer = streamer.clone();
                let client_count = client_count.clone();
                let cfg = cfg.clone();
                let on_session_path = on_session_path.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_session(socket, peer.ip(), streamer, cfg, on_session_path, shutdown)
                        .await;
                    client_count.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }));
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    /// Abort the accept loop, signal active sessions to close and stop
    /// streaming
    pub async fn end(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.listener = None;
        let mut streamer = self.streamer.lock().await;
        streamer.stop();
        streamer.release_udp_transport();
        info!("rtsp server stopped");
    }
}

async fn serve_session(
    socket: TcpStream,
    peer_ip: std::net::IpAddr,
    streamer: SharedStreamer,
    cfg: RtspServerConfig,
    on_session_path: Option<ServerPathCallback>,
    shutdown: Arc<AtomicBool>,
) {
    let mut session = RtspSession::new(socket, peer_ip, streamer);
    if let Some(callback) = on_session_path {
        session.set_on_session_path(Box::new(move |path| callback(path)));
    }

    let mut last_request = Instant::now();
    while session.is_open() && !shutdown.load(Ordering::SeqCst) {
        match session.handle_requests(cfg.read_timeout).await {
            Ok(true) => last_request = Instant::now(),
            Ok(false) => {}
            Err(e) => {
                warn!("session error: {}", e);
                break;
            }
        }
        if session.is_streaming() && last_request.elapsed() > cfg.session_timeout {
            info!("session idle timeout");
            break;
        }
    }
    session.close().await;
}

/// Loop driven RTSP server for callers that poll from their own main
/// loop instead of spawning tasks: call [`do_loop`](Self::do_loop)
/// frequently. At most one client is serviced at a time.
pub struct RtspServerLoop {
    cfg: RtspServerConfig,
    streamer: SharedStreamer,
    listener: Option<TcpListener>,
    session: Option<RtspSession<TcpStream>>,
    last_request: Instant,
    local_port: u16,
    on_session_path: Option<ServerPathCallback>,
}

impl RtspServerLoop {
    pub fn new(streamer: RtpStreamer, cfg: RtspServerConfig) -> Self {
        Self {
            cfg,
            streamer: Arc::new(Mutex::new(streamer)),
            listener: None,
            session: None,
            last_request: Instant::now(),
            local_port: 0,
            on_session_path: None,
        }
    }

    pub fn streamer(&self) -> SharedStreamer {
        self.streamer.clone()
    }

    pub fn set_on_session_path(&mut self, callback: ServerPathCallback) {
        self.on_session_path = Some(callback);
    }

    pub async fn begin(&mut self) -> Result<u16> {
        self.streamer.lock().await.init_audio_source();
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.cfg.port))
            .await
            .map_err(|e| Error::Connect(format!("bind port {} failed: {}", self.cfg.port, e)))?;
        self.local_port = listener.local_addr()?.port();
        info!(port = self.local_port, "rtsp server listening (loop mode)");
        self.listener = Some(listener);
        Ok(self.local_port)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn client_count(&self) -> usize {
        usize::from(self.session.is_some())
    }

    /// One service pass: accept a waiting client when idle, then handle
    /// at most one request of the current session
    pub async fn do_loop(&mut self) {
        self.accept_client().await;
        self.handle_session().await;
    }

    pub async fn end(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.listener = None;
        let mut streamer = self.streamer.lock().await;
        streamer.stop();
        streamer.release_udp_transport();
    }

    async fn accept_client(&mut self) {
        if self.session.is_some() {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };
        // a short poll so the host loop is never blocked for long
        let accepted = timeout(Duration::from_millis(10), listener.accept()).await;
        if let Ok(Ok((socket, peer))) = accepted {
            info!(%peer, "client connected");
            let mut session = RtspSession::new(socket, peer.ip(), self.streamer.clone());
            if let Some(callback) = self.on_session_path.clone() {
                session.set_on_session_path(Box::new(move |path| callback(path)));
            }
            self.session = Some(session);
            self.last_request = Instant::now();
        }
    }

    async fn handle_session(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.handle_requests(self.cfg.read_timeout).await {
            Ok(true) => self.last_request = Instant::now(),
            Ok(false) => {}
            Err(e) => {
                warn!("session error: {}", e);
                session.close().await;
            }
        }
        if session.is_streaming() && self.last_request.elapsed() > self.cfg.session_timeout {
            info!("session idle timeout");
            session.close().await;
        }
        if !session.is_open() {
            self.session = None;
        }
    }
}
