//! The overlay event loop.
//!
//! Runs on its own thread with a `current_thread` runtime. It owns every
//! piece of mutable overlay state: the connection table, the route table and
//! the published connected-peer set. Connection I/O happens in small reader
//! and writer tasks that report back through an internal event channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, PeerInfo, MAX_FRAME_BYTES};
use crate::handle::{Command, Reply};
use crate::{MessageSink, OverlayError, PeerConfig};

type ConnId = u64;

/// Pause after a failed accept before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events reported by connection tasks.
enum Event {
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
    },
    Dialed {
        addr: String,
        stream: TcpStream,
        reply: Option<Reply>,
    },
    Inbound {
        conn: ConnId,
        frame: Frame,
    },
    Closed {
        conn: ConnId,
        reason: Option<String>,
    },
    HandshakeExpired {
        conn: ConnId,
    },
}

struct Connection {
    remote: String,
    outbound: bool,
    out_tx: mpsc::UnboundedSender<String>,
    peer: Option<PeerInfo>,
    pending_enter: Option<Reply>,
    reader: AbortHandle,
}

impl Drop for Connection {
    // Dropping the sender ends the writer; the reader holds the other half.
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Entry point of the reactor thread.
pub(crate) fn run(
    config: PeerConfig,
    listener: StdTcpListener,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    peers_tx: watch::Sender<BTreeSet<String>>,
    sink: Arc<dyn MessageSink>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build overlay runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to register overlay listener");
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let listener = Arc::new(listener);
        tokio::spawn(accept_loop(
            move || {
                let listener = Arc::clone(&listener);
                async move { listener.accept().await }
            },
            events_tx.clone(),
            ACCEPT_BACKOFF,
        ));

        let mut reactor = Reactor {
            config,
            sink,
            peers_tx,
            connections: HashMap::new(),
            routes: BTreeMap::new(),
            next_conn: 1,
            events_tx,
        };
        reactor.run(cmd_rx, events_rx).await;
    });
}

struct Reactor {
    config: PeerConfig,
    sink: Arc<dyn MessageSink>,
    peers_tx: watch::Sender<BTreeSet<String>>,
    connections: HashMap<ConnId, Connection>,
    routes: BTreeMap<String, ConnId>,
    next_conn: ConnId,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl Reactor {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        info!(peer_id = %self.config.peer_id, "Overlay reactor started");

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => self.on_event(event),
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
            }
        }

        self.connections.clear();
        self.routes.clear();
        self.publish();
        info!(peer_id = %self.config.peer_id, "Overlay reactor stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enter { addr, reply } => {
                info!(addr = %addr, "Entering overlay");
                self.dial(addr, Some(reply));
            }
            Command::Send {
                to,
                tag,
                body,
                reply,
            } => {
                let frame = Frame::Message {
                    from: self.config.peer_id.clone(),
                    to: to.clone(),
                    tag: tag.clone(),
                    body,
                    relayed: false,
                };
                let result = self.route(&to, frame);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(to = %to, tag = %tag, error = %e, "Dropped outbound message");
                        }
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Accepted { stream, remote } => {
                debug!(remote = %remote, "Accepted overlay connection");
                self.attach(stream, remote.to_string(), false, None);
            }
            Event::Dialed {
                addr,
                stream,
                reply,
            } => self.attach(stream, addr, true, reply),
            Event::Inbound { conn, frame } => self.on_frame(conn, frame),
            Event::Closed { conn, reason } => self.on_closed(conn, reason),
            Event::HandshakeExpired { conn } => {
                let silent = self
                    .connections
                    .get(&conn)
                    .is_some_and(|c| c.peer.is_none());
                if silent {
                    if let Some(connection) = self.connections.remove(&conn) {
                        warn!(
                            remote = %connection.remote,
                            timeout = ?self.config.handshake_timeout,
                            "No hello before deadline, closing"
                        );
                    }
                }
            }
        }
    }

    fn dial(&self, addr: String, reply: Option<Reply>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    let _ = events.send(Event::Dialed {
                        addr,
                        stream,
                        reply,
                    });
                }
                Err(source) => {
                    warn!(addr = %addr, error = %source, "Dial failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(OverlayError::Connect { addr, source }));
                    }
                }
            }
        });
    }

    fn attach(&mut self, stream: TcpStream, remote: String, outbound: bool, reply: Option<Reply>) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(conn, read_half, self.events_tx.clone())).abort_handle();
        tokio::spawn(write_loop(write_half, out_rx));

        if !outbound {
            let events = self.events_tx.clone();
            let deadline = self.config.handshake_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = events.send(Event::HandshakeExpired { conn });
            });
        }

        if outbound {
            let hello = Frame::Hello {
                peer_id: self.config.peer_id.clone(),
                public_addr: self.config.public_addr.clone(),
                metadata: self.config.metadata.clone(),
            };
            match hello.encode() {
                Ok(line) => {
                    let _ = out_tx.send(line);
                }
                Err(e) => {
                    reader.abort();
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    return;
                }
            }
        }

        self.connections.insert(
            conn,
            Connection {
                remote,
                outbound,
                out_tx,
                peer: None,
                pending_enter: reply,
                reader,
            },
        );
    }

    fn on_frame(&mut self, conn: ConnId, frame: Frame) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        let identified = connection.peer.is_some();
        let outbound = connection.outbound;
        debug!(conn, kind = frame.kind(), "Inbound frame");

        match frame {
            Frame::Hello {
                peer_id,
                public_addr,
                metadata,
            } => {
                if outbound || identified {
                    warn!(conn, peer_id = %peer_id, "Unexpected hello, ignoring");
                    return;
                }
                if peer_id == self.config.peer_id {
                    warn!(peer_id = %peer_id, "Peer announced our own id, closing");
                    self.connections.remove(&conn);
                    return;
                }

                let peers = self.known_peers(&peer_id);
                let welcome = Frame::Welcome {
                    peer_id: self.config.peer_id.clone(),
                    public_addr: self.config.public_addr.clone(),
                    metadata: self.config.metadata.clone(),
                    peers,
                };
                if let Err(e) = self.write(conn, &welcome) {
                    warn!(peer_id = %peer_id, error = %e, "Failed to send welcome");
                    return;
                }

                info!(
                    peer_id = %peer_id,
                    peer_type = metadata.get("peer_type").map(String::as_str).unwrap_or(""),
                    "Peer connected"
                );
                self.register(conn, PeerInfo { peer_id, public_addr });
            }
            Frame::Welcome {
                peer_id,
                public_addr,
                metadata,
                peers,
            } => {
                if !outbound || identified {
                    warn!(conn, peer_id = %peer_id, "Unexpected welcome, ignoring");
                    return;
                }

                info!(
                    peer_id = %peer_id,
                    peer_type = metadata.get("peer_type").map(String::as_str).unwrap_or(""),
                    known_peers = peers.len(),
                    "Handshake complete"
                );
                self.register(conn, PeerInfo { peer_id, public_addr });

                if let Some(reply) = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|c| c.pending_enter.take())
                {
                    let _ = reply.send(Ok(()));
                }

                for peer in peers {
                    if peer.peer_id == self.config.peer_id
                        || self.routes.contains_key(&peer.peer_id)
                        || peer.public_addr.is_empty()
                    {
                        continue;
                    }
                    debug!(peer_id = %peer.peer_id, addr = %peer.public_addr, "Dialing advertised peer");
                    self.dial(peer.public_addr, None);
                }
            }
            Frame::Message {
                from,
                to,
                tag,
                body,
                relayed,
            } => {
                let Some(sender) = self.connections.get(&conn).and_then(|c| c.peer.clone()) else {
                    warn!(conn, tag = %tag, "Message before handshake, dropping");
                    return;
                };
                if !relayed && sender.peer_id != from {
                    warn!(
                        claimed = %from,
                        actual = %sender.peer_id,
                        "Sender identity mismatch, dropping"
                    );
                    return;
                }

                if to == self.config.peer_id {
                    debug!(from = %from, tag = %tag, "Delivering message");
                    self.sink.deliver(&from, &tag, &body);
                    return;
                }

                if relayed {
                    warn!(from = %from, to = %to, tag = %tag, "Refusing to relay twice");
                    return;
                }

                match self.routes.get(&to).copied() {
                    Some(target) => {
                        let forward = Frame::Message {
                            from,
                            to: to.clone(),
                            tag,
                            body,
                            relayed: true,
                        };
                        if let Err(e) = self.write(target, &forward) {
                            warn!(to = %to, error = %e, "Relay failed");
                        }
                    }
                    None => debug!(to = %to, tag = %tag, "No route for relayed message"),
                }
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId, reason: Option<String>) {
        let Some(mut connection) = self.connections.remove(&conn) else {
            return;
        };

        if let Some(reply) = connection.pending_enter.take() {
            let _ = reply.send(Err(OverlayError::Handshake {
                addr: connection.remote.clone(),
                reason: reason
                    .clone()
                    .unwrap_or_else(|| "connection closed before welcome".to_string()),
            }));
        }

        if let Some(peer) = connection.peer.take() {
            if self.routes.get(&peer.peer_id) == Some(&conn) {
                self.routes.remove(&peer.peer_id);
                self.publish();
                info!(
                    peer_id = %peer.peer_id,
                    reason = reason.as_deref().unwrap_or("closed"),
                    "Peer disconnected"
                );
            }
        }
    }

    /// Bind a peer id to a connection, replacing any older connection.
    fn register(&mut self, conn: ConnId, info: PeerInfo) {
        if let Some(previous) = self.routes.insert(info.peer_id.clone(), conn) {
            if previous != conn {
                debug!(peer_id = %info.peer_id, "Replacing existing connection");
                self.connections.remove(&previous);
            }
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.peer = Some(info);
        }
        self.publish();
    }

    /// Route a message frame: direct when connected, else one relay hop.
    fn route(&mut self, to: &str, frame: Frame) -> Result<(), OverlayError> {
        if to == self.config.peer_id {
            if let Frame::Message { from, tag, body, .. } = &frame {
                self.sink.deliver(from, tag, body);
            }
            return Ok(());
        }

        if let Some(conn) = self.routes.get(to).copied() {
            return self.write(conn, &frame);
        }

        let Some(relay) = self.routes.values().next().copied() else {
            return Err(OverlayError::PeerUnreachable(to.to_string()));
        };
        debug!(to = %to, "No direct connection, relaying");
        self.write(relay, &frame)
    }

    fn write(&self, conn: ConnId, frame: &Frame) -> Result<(), OverlayError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or_else(|| OverlayError::ConnectionClosed(format!("conn-{}", conn)))?;
        let line = frame.encode()?;
        connection.out_tx.send(line).map_err(|_| {
            OverlayError::ConnectionClosed(
                connection
                    .peer
                    .as_ref()
                    .map(|p| p.peer_id.clone())
                    .unwrap_or_else(|| connection.remote.clone()),
            )
        })
    }

    fn known_peers(&self, exclude: &str) -> Vec<PeerInfo> {
        self.routes
            .iter()
            .filter(|(peer_id, _)| peer_id.as_str() != exclude)
            .filter_map(|(_, conn)| self.connections.get(conn)?.peer.clone())
            .collect()
    }

    fn publish(&self) {
        self.peers_tx
            .send_replace(self.routes.keys().cloned().collect());
    }
}

/// Accept connections and hand them to the reactor, backing off after
/// errors such as running out of file descriptors.
async fn accept_loop<A, F>(mut accept: A, events: mpsc::UnboundedSender<Event>, backoff: Duration)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, remote)) => {
                if events.send(Event::Accepted { stream, remote }).is_err() {
                    break;
                }
            }
            Err(e) => {
                if events.is_closed() {
                    break;
                }
                error!(error = %e, "Accept failed");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

enum ReadOutcome {
    Frame(Frame),
    Malformed(String),
    Eof,
    Failed(String),
}

async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> ReadOutcome
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_FRAME_BYTES as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await;

    let n = match read {
        Ok(n) => n,
        Err(e) => return ReadOutcome::Failed(e.to_string()),
    };
    if n == 0 {
        return ReadOutcome::Eof;
    }
    if buf.last() != Some(&b'\n') {
        if n as u64 >= limit {
            return ReadOutcome::Failed(format!("frame exceeds {} bytes", MAX_FRAME_BYTES));
        }
        return ReadOutcome::Failed("truncated frame".to_string());
    }

    match std::str::from_utf8(buf) {
        Ok(text) => match Frame::decode(text) {
            Ok(frame) => ReadOutcome::Frame(frame),
            Err(e) => ReadOutcome::Malformed(e.to_string()),
        },
        Err(e) => ReadOutcome::Malformed(e.to_string()),
    }
}

async fn read_loop(conn: ConnId, read_half: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    let reason = loop {
        match read_frame(&mut reader, &mut buf).await {
            ReadOutcome::Frame(frame) => {
                if events.send(Event::Inbound { conn, frame }).is_err() {
                    break None;
                }
            }
            ReadOutcome::Malformed(e) => {
                warn!(conn, error = %e, "Malformed frame, skipping");
            }
            ReadOutcome::Eof => break None,
            ReadOutcome::Failed(e) => break Some(e),
        }
    };

    let _ = events.send(Event::Closed { conn, reason });
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut out_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = out_rx.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!(error = %e, "Write failed, closing writer");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&attempts);
        let task = tokio::spawn(accept_loop(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                // EMFILE: too many open files.
                async { Err::<(TcpStream, SocketAddr), _>(io::Error::from_raw_os_error(24)) }
            },
            events_tx,
            ACCEPT_BACKOFF,
        ));

        tokio::time::sleep(Duration::from_millis(550)).await;
        task.abort();

        let attempts = attempts.load(Ordering::SeqCst);
        assert!((5..=7).contains(&attempts), "{attempts} accepts in 550ms");
    }

    #[tokio::test]
    async fn test_accept_loop_ends_when_reactor_is_gone() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        drop(events_rx);

        tokio::time::timeout(
            Duration::from_secs(5),
            accept_loop(
                || async { Err::<(TcpStream, SocketAddr), _>(io::Error::other("closed")) },
                events_tx,
                ACCEPT_BACKOFF,
            ),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_sequence() {
        let input = concat!(
            r#"{"type":"hello","peer_id":"a","public_addr":"1.1.1.1:1"}"#,
            "\n",
            "not json\n",
            r#"{"type":"message","from":"a","to":"b","tag":"T"}"#,
            "\n",
        );
        let mut reader = BufReader::new(input.as_bytes());
        let mut buf = Vec::new();

        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            ReadOutcome::Frame(Frame::Hello { .. })
        ));
        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            ReadOutcome::Malformed(_)
        ));
        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            ReadOutcome::Frame(Frame::Message { .. })
        ));
        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            ReadOutcome::Eof
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let mut reader = BufReader::new(&b"{\"type\":\"hel"[..]);
        let mut buf = Vec::new();
        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            ReadOutcome::Failed(_)
        ));
    }
}
