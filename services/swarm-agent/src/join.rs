//! Join coordinator.
//!
//! Starts the overlay reactor at most once, hands the join request to it and
//! waits for the one-shot outcome. The caller's task only ever talks to the
//! reactor through the overlay handle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use swarm_overlay::{join_host_port, MessageSink, Overlay, OverlayError, OverlayHandle};
use tracing::{error, info};

use crate::error::AgentError;

/// Outcome of one join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResult {
    Success,
    /// The join failed; carries the transport-reported reason.
    Failure(String),
}

impl JoinResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JoinResult::Success)
    }
}

/// An overlay not yet handed to its reactor thread.
struct Pending {
    overlay: Overlay,
    sink: Arc<dyn MessageSink>,
}

/// Drives the join handshake against a rendezvous address.
pub struct JoinCoordinator {
    handle: OverlayHandle,
    local_addr: SocketAddr,
    pending: Mutex<Option<Pending>>,
    launches: AtomicUsize,
    timeout: Option<Duration>,
}

impl JoinCoordinator {
    /// Wrap a bound overlay. `sink` receives inbound messages once the
    /// reactor runs, so every handler must already be registered in it.
    pub fn new(overlay: Overlay, sink: Arc<dyn MessageSink>, timeout: Option<Duration>) -> Self {
        Self {
            handle: overlay.handle(),
            local_addr: overlay.local_addr(),
            pending: Mutex::new(Some(Pending { overlay, sink })),
            launches: AtomicUsize::new(0),
            timeout,
        }
    }

    pub fn handle(&self) -> &OverlayHandle {
        &self.handle
    }

    /// The bound overlay listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of times the reactor thread was launched (0 or 1).
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Start the reactor thread unless it was started already.
    pub fn ensure_started(&self) -> Result<(), AgentError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(Pending { overlay, sink }) = pending.take() else {
            return Ok(());
        };

        // The thread detaches; it exits when the handle asks it to shut down.
        overlay.spawn(sink).map_err(AgentError::NetworkInit)?;
        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(peer_id = %self.handle.local_id(), "Overlay reactor launched");
        Ok(())
    }

    /// Join the overlay through `ip:port`, waiting for the handshake outcome.
    pub async fn join(&self, ip: &str, port: u16) -> JoinResult {
        let addr = join_host_port(ip, port);
        info!(addr = %addr, "Try joining overlay");

        if let Err(e) = self.ensure_started() {
            error!(error = %e, "Join failed");
            return JoinResult::Failure(e.to_string());
        }

        let outcome = self.handle.enter(addr.clone());
        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome).await {
                Ok(received) => received,
                Err(_) => {
                    error!(addr = %addr, timeout = ?limit, "Join timed out");
                    return JoinResult::Failure(format!(
                        "join via {} timed out after {:?}",
                        addr, limit
                    ));
                }
            },
            None => outcome.await,
        };

        match received {
            Ok(Ok(())) => {
                info!(addr = %addr, "Joined overlay successfully");
                JoinResult::Success
            }
            Ok(Err(e)) => {
                error!(addr = %addr, error = %e, "Join failed");
                JoinResult::Failure(e.to_string())
            }
            Err(_) => {
                let e = OverlayError::NotRunning;
                error!(addr = %addr, error = %e, "Join failed");
                JoinResult::Failure(e.to_string())
            }
        }
    }

    /// Stop the reactor thread, if it runs.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

impl Drop for JoinCoordinator {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

impl std::fmt::Debug for JoinCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCoordinator")
            .field("handle", &self.handle)
            .field("launches", &self.launches())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MessageRouter;
    use swarm_overlay::PeerConfig;

    fn coordinator(id: &str, timeout: Option<Duration>) -> JoinCoordinator {
        let overlay = Overlay::new(PeerConfig::new(id, "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        JoinCoordinator::new(overlay, Arc::new(MessageRouter::new()), timeout)
    }

    fn bound_peer(id: &str) -> (OverlayHandle, u16) {
        let overlay = Overlay::new(PeerConfig::new(id, "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        let handle = overlay.handle();
        let port = overlay.local_addr().port();
        overlay.spawn(Arc::new(MessageRouter::new())).unwrap();
        (handle, port)
    }

    #[tokio::test]
    async fn test_reactor_launched_once_across_joins() {
        let (rendezvous, port) = bound_peer("rendezvous");
        let ip = "127.0.0.1";

        let joiner = coordinator("joiner", None);
        assert_eq!(joiner.launches(), 0);

        assert_eq!(joiner.join(ip, port).await, JoinResult::Success);
        assert_eq!(joiner.join(ip, port).await, JoinResult::Success);
        joiner.ensure_started().unwrap();
        assert_eq!(joiner.launches(), 1);

        joiner.shutdown();
        rendezvous.shutdown();
    }

    #[tokio::test]
    async fn test_join_refused_is_failure() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let joiner = coordinator("joiner", None);
        let result = joiner.join("127.0.0.1", port).await;
        assert!(matches!(result, JoinResult::Failure(_)));
        assert_eq!(joiner.launches(), 1);
        joiner.shutdown();
    }

    #[tokio::test]
    async fn test_join_times_out_against_silent_listener() {
        // Accepts connections but never answers the hello.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let joiner = coordinator("joiner", Some(Duration::from_millis(200)));
        match joiner.join("127.0.0.1", port).await {
            JoinResult::Failure(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
        joiner.shutdown();
        drop(silent);
    }

    #[tokio::test]
    async fn test_join_self_is_failure() {
        let overlay = Overlay::new(PeerConfig::new("solo", "127.0.0.1", 0, "127.0.0.1", 0)).unwrap();
        let port = overlay.local_addr().port();
        let joiner = JoinCoordinator::new(overlay, Arc::new(MessageRouter::new()), None);

        let result = joiner.join("127.0.0.1", port).await;
        assert!(!result.is_success());
        joiner.shutdown();
    }

    #[tokio::test]
    async fn test_drop_stops_reactor_and_frees_port() {
        let joiner = coordinator("dropped", None);
        joiner.ensure_started().unwrap();
        let handle = joiner.handle().clone();
        let addr = joiner.local_addr();
        assert!(handle.is_running());

        drop(joiner);

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_running() || std::net::TcpListener::bind(addr).is_err() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("reactor still running after drop");
    }
}
