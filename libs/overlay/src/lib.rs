//! Peer-to-peer overlay transport for swarm agents.
//!
//! Each agent owns one [`Overlay`]: a peer identity, a bound listen socket,
//! an advertised public address and free-form metadata. The overlay's state
//! lives on a dedicated reactor thread; everything else talks to it through
//! an [`OverlayHandle`], which marshals requests onto the reactor's command
//! queue.
//!
//! ```text
//! control flow ──┐                         ┌── overlay-reactor thread ──────────┐
//!                │  Command (mpsc)         │                                     │
//!  OverlayHandle ├────────────────────────▶│ Reactor                             │
//!                │◀────────────────────────┤   connections, peer table           │
//!                │  oneshot / watch        │   MessageSink::deliver(from, ..)    │
//!                                          └─────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `frame`: newline-delimited JSON wire frames
//! - `handle`: the cloneable handle used outside the reactor
//! - `reactor`: the event loop and connection tasks

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub mod frame;
pub mod handle;
mod reactor;

pub use frame::{Body, Frame, PeerInfo};
pub use handle::OverlayHandle;

/// Name of the dedicated reactor thread.
pub const REACTOR_THREAD_NAME: &str = "overlay-reactor";

/// Inbound connections that have not sent `hello` by then are closed.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Overlay errors.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// A configured address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The reactor thread could not be started.
    #[error("failed to start reactor thread: {0}")]
    Spawn(#[source] io::Error),

    /// The reactor has not been started or has already exited.
    #[error("overlay reactor is not running")]
    NotRunning,

    /// Dialing a peer failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The remote side closed the connection or sent an unexpected frame
    /// before the handshake completed.
    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    /// No route to the requested peer.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The connection to a peer went away while a frame was queued.
    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    /// A frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(String),
}

/// Receives inbound messages addressed to this peer.
///
/// Called synchronously on the reactor thread, so implementations must not
/// block for long.
pub trait MessageSink: Send + Sync + 'static {
    /// Deliver one message from `from` carrying `tag` and `body`.
    fn deliver(&self, from: &str, tag: &str, body: &Body);
}

/// Identity and addressing of one overlay peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer identifier, unique within the overlay.
    pub peer_id: String,

    /// Local address to bind (`ip:port`).
    pub listen_addr: String,

    /// Address other peers should dial (`host:port`).
    pub public_addr: String,

    /// Free-form metadata announced during handshakes.
    pub metadata: BTreeMap<String, String>,

    /// How long an inbound connection may stay silent before its `hello`.
    pub handshake_timeout: Duration,
}

impl PeerConfig {
    /// Build a config from split host/port pairs.
    pub fn new(
        peer_id: impl Into<String>,
        listen_ip: &str,
        listen_port: u16,
        public_ip: &str,
        public_port: u16,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            listen_addr: join_host_port(listen_ip, listen_port),
            public_addr: join_host_port(public_ip, public_port),
            metadata: BTreeMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Format `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A bound, not-yet-running overlay peer.
///
/// Construction binds the listen socket so that address problems surface
/// immediately. [`Overlay::spawn`] consumes the overlay and moves its state
/// onto the reactor thread.
pub struct Overlay {
    config: PeerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<handle::Command>,
    cmd_rx: mpsc::UnboundedReceiver<handle::Command>,
    peers_tx: watch::Sender<std::collections::BTreeSet<String>>,
    peers_rx: watch::Receiver<std::collections::BTreeSet<String>>,
    started: Arc<AtomicBool>,
}

impl Overlay {
    /// Validate the config and bind the listen socket.
    ///
    /// A public port of `0` advertises the port actually bound.
    pub fn new(config: PeerConfig) -> Result<Self, OverlayError> {
        if config.peer_id.trim().is_empty() {
            return Err(OverlayError::InvalidAddress("empty peer id".to_string()));
        }
        if config.public_addr.trim().is_empty() {
            return Err(OverlayError::InvalidAddress("empty public address".to_string()));
        }

        let listen: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|_| OverlayError::InvalidAddress(config.listen_addr.clone()))?;

        let listener = TcpListener::bind(listen).map_err(|source| OverlayError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| OverlayError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| OverlayError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;

        let mut config = config;
        if let Some((host, "0")) = config.public_addr.rsplit_once(':') {
            config.public_addr = format!("{}:{}", host, local_addr.port());
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (peers_tx, peers_rx) = watch::channel(Default::default());

        info!(
            peer_id = %config.peer_id,
            listen_addr = %local_addr,
            public_addr = %config.public_addr,
            "Overlay peer bound"
        );

        Ok(Self {
            config,
            listener,
            local_addr,
            cmd_tx,
            cmd_rx,
            peers_tx,
            peers_rx,
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The actual bound listen address (resolves port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This peer's configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// A handle for talking to the reactor once it runs.
    pub fn handle(&self) -> OverlayHandle {
        OverlayHandle::new(
            self.config.peer_id.clone(),
            self.cmd_tx.clone(),
            self.peers_rx.clone(),
            Arc::clone(&self.started),
        )
    }

    /// Start the reactor on a dedicated thread.
    ///
    /// Inbound messages are delivered to `sink` from that thread.
    pub fn spawn(self, sink: Arc<dyn MessageSink>) -> Result<std::thread::JoinHandle<()>, OverlayError> {
        let Overlay {
            config,
            listener,
            cmd_rx,
            peers_tx,
            started,
            ..
        } = self;

        started.store(true, Ordering::SeqCst);
        let running = Arc::clone(&started);

        std::thread::Builder::new()
            .name(REACTOR_THREAD_NAME.to_string())
            .spawn(move || {
                reactor::run(config, listener, cmd_rx, peers_tx, sink);
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                started.store(false, Ordering::SeqCst);
                OverlayError::Spawn(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("10.0.0.1", 9000), "10.0.0.1:9000");
        assert_eq!(join_host_port("::1", 9000), "[::1]:9000");
        assert_eq!(join_host_port("[::1]", 9000), "[::1]:9000");
    }

    #[test]
    fn test_overlay_binds_ephemeral_port() {
        let overlay = Overlay::new(PeerConfig::new("a", "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        assert_ne!(overlay.local_addr().port(), 0);
    }

    #[test]
    fn test_overlay_advertises_bound_port() {
        let overlay = Overlay::new(PeerConfig::new("a", "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        assert_eq!(
            overlay.config().public_addr,
            format!("127.0.0.1:{}", overlay.local_addr().port())
        );
    }

    #[test]
    fn test_overlay_rejects_bad_listen_addr() {
        let result = Overlay::new(PeerConfig::new("a", "not-an-ip", 1, "127.0.0.1", 1));
        assert!(matches!(result, Err(OverlayError::InvalidAddress(_))));
    }

    #[test]
    fn test_overlay_rejects_empty_peer_id() {
        let result = Overlay::new(PeerConfig::new(" ", "127.0.0.1", 0, "127.0.0.1", 0));
        assert!(matches!(result, Err(OverlayError::InvalidAddress(_))));
    }

    #[test]
    fn test_handle_reports_not_running_before_spawn() {
        let overlay = Overlay::new(PeerConfig::new("a", "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        let handle = overlay.handle();
        assert!(!handle.is_running());
        assert!(handle.connected_peers().is_empty());
    }
}
