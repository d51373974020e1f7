//! Handle for requesting work from the reactor.
//!
//! The handle never touches overlay state directly: every mutation is sent
//! to the reactor as a [`Command`], and results come back over oneshots.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::frame::Body;
use crate::OverlayError;

pub(crate) type Reply = oneshot::Sender<Result<(), OverlayError>>;

/// Requests processed by the reactor.
pub(crate) enum Command {
    /// Dial a rendezvous peer and complete the hello/welcome handshake.
    Enter { addr: String, reply: Reply },
    /// Route one message to a peer.
    Send {
        to: String,
        tag: String,
        body: Body,
        reply: Option<Reply>,
    },
    /// Close all connections and stop the reactor.
    Shutdown,
}

/// Cloneable handle to a running (or about to run) overlay.
#[derive(Clone)]
pub struct OverlayHandle {
    local_id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    peers: watch::Receiver<BTreeSet<String>>,
    started: Arc<AtomicBool>,
}

impl OverlayHandle {
    pub(crate) fn new(
        local_id: String,
        cmd_tx: mpsc::UnboundedSender<Command>,
        peers: watch::Receiver<BTreeSet<String>>,
        started: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local_id,
            cmd_tx,
            peers,
            started,
        }
    }

    /// This peer's identifier.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Whether the reactor thread is running.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Snapshot of currently connected peer identifiers.
    pub fn connected_peers(&self) -> BTreeSet<String> {
        self.peers.borrow().clone()
    }

    /// Queue a join through the rendezvous peer at `addr`.
    ///
    /// The returned receiver fires exactly once with the handshake outcome.
    /// If the reactor is gone the receiver resolves to a `RecvError`.
    pub fn enter(&self, addr: impl Into<String>) -> oneshot::Receiver<Result<(), OverlayError>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(Command::Enter { reply, .. })) =
            self.cmd_tx.send(Command::Enter {
                addr: addr.into(),
                reply,
            })
        {
            let _ = reply.send(Err(OverlayError::NotRunning));
        }
        rx
    }

    /// Send a message and wait until it is queued on a connection.
    pub async fn send(&self, to: &str, tag: &str, body: Body) -> Result<(), OverlayError> {
        if !self.is_running() {
            return Err(OverlayError::NotRunning);
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                to: to.to_string(),
                tag: tag.to_string(),
                body,
                reply: Some(reply),
            })
            .map_err(|_| OverlayError::NotRunning)?;

        rx.await.map_err(|_| OverlayError::NotRunning)?
    }

    /// Send a message without waiting for the outcome.
    ///
    /// Safe to call from a [`crate::MessageSink`] running on the reactor
    /// thread. Routing failures are logged by the reactor.
    pub fn post(&self, to: &str, tag: &str, body: Body) -> Result<(), OverlayError> {
        if !self.is_running() {
            return Err(OverlayError::NotRunning);
        }
        self.cmd_tx
            .send(Command::Send {
                to: to.to_string(),
                tag: tag.to_string(),
                body,
                reply: None,
            })
            .map_err(|_| OverlayError::NotRunning)
    }

    /// Ask the reactor to close all connections and exit.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

impl std::fmt::Debug for OverlayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHandle")
            .field("local_id", &self.local_id)
            .field("running", &self.is_running())
            .finish()
    }
}
