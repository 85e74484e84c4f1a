//! The peer-to-peer overlay: a gossiping mesh of TCP nodes.
//!
//! Each node is simultaneously a client and a server. Every message is sent
//! over a fresh, unidirectional-use TCP connection: connect, exchange one
//! packet, disconnect. The wire format is a small length-prefixed JSON
//! envelope (see [`wire`]) carrying one of four packet kinds: `CONNECT`,
//! `CONNECT_ACCEPTED`, `BROADCAST` and `PRIVATE`.

mod wire;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

pub use wire::Envelope;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Verbosity levels mirrored from the source implementation: `Silent` logs
/// nothing, `Summary` logs one line per packet, `Full` logs the whole
/// decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Silent,
    Summary,
    Full,
}

impl From<u8> for Verbosity {
    fn from(value: u8) -> Self {
        match value {
            0 => Verbosity::Silent,
            1 => Verbosity::Summary,
            _ => Verbosity::Full,
        }
    }
}

/// Callback slots a node's owner implements to react to gossip and private
/// messages. Default bodies are no-ops, matching the base `Node`'s
/// pass-through `_broadcast_callback`/`_private_callback` that subclasses
/// override selectively.
#[async_trait]
pub trait NodeCallbacks: Send + Sync {
    async fn on_broadcast(&self, host: String, port: u16, id: String, body: Value) {
        let _ = (host, port, id, body);
    }

    async fn on_private(&self, host: String, port: u16, body: Value) {
        let _ = (host, port, body);
    }
}

/// A no-op set of callbacks, for nodes that only need to participate in the
/// mesh without reacting to anything (e.g. a bare relay).
pub struct NoopCallbacks;

impl NodeCallbacks for NoopCallbacks {}

type PeerAddr = (String, u16);

/// A peer-to-peer node: both a TCP server accepting `CONNECT`/`BROADCAST`/
/// `PRIVATE` packets, and a client dialing its neighbors.
pub struct Node {
    pub host: String,
    pub port: u16,
    max_nodes: usize,
    verbosity: Verbosity,
    neighbors: RwLock<HashSet<PeerAddr>>,
    seen_ids: Mutex<HashSet<String>>,
    seen_order: Mutex<VecDeque<(Instant, String)>>,
    seen_ttl: Option<Duration>,
    listener: AsyncMutex<Option<TcpListener>>,
    shutdown_tx: AsyncMutex<Option<oneshot::Sender<()>>>,
    id_seq: AtomicU64,
    callbacks: OnceCell<Arc<dyn NodeCallbacks>>,
}

impl Node {
    /// Binds the listening socket. `bootstrap` seeds the initial neighbor
    /// set, mirroring the constructor's optional `remote_host`/`remote_port`.
    pub async fn bind(
        listen_host: impl Into<String>,
        listen_port: u16,
        bootstrap: Option<(String, u16)>,
        max_nodes: usize,
        verbosity: Verbosity,
    ) -> Result<Self, NodeError> {
        let host = listen_host.into();
        let listener = TcpListener::bind((host.as_str(), listen_port)).await?;
        let port = listener.local_addr()?.port();

        let mut neighbors = HashSet::new();
        if let Some(peer) = bootstrap {
            neighbors.insert(peer);
        }

        Ok(Node {
            host,
            port,
            max_nodes,
            verbosity,
            neighbors: RwLock::new(neighbors),
            seen_ids: Mutex::new(HashSet::new()),
            seen_order: Mutex::new(VecDeque::new()),
            seen_ttl: None,
            listener: AsyncMutex::new(Some(listener)),
            shutdown_tx: AsyncMutex::new(None),
            id_seq: AtomicU64::new(0),
            callbacks: OnceCell::new(),
        })
    }

    /// Sets how long a broadcast id is remembered before it can be swept.
    /// The source never bounds this set; leaving it unset (the default)
    /// preserves that behavior.
    pub fn with_seen_ttl(mut self, ttl: Duration) -> Self {
        self.seen_ttl = Some(ttl);
        self
    }

    pub fn self_addr(&self) -> PeerAddr {
        (self.host.clone(), self.port)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.read().len()
    }

    pub fn neighbors(&self) -> Vec<PeerAddr> {
        self.neighbors.read().iter().cloned().collect()
    }

    /// Registers the callback implementation invoked for broadcast and
    /// private packets. Must be called before [`Node::start`]; a no-op if
    /// called twice.
    pub fn set_callbacks(&self, callbacks: Arc<dyn NodeCallbacks>) {
        let _ = self.callbacks.set(callbacks);
    }

    /// Starts the accept loop and performs the initial `connect()` round to
    /// discover neighbors-of-neighbors.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .expect("Node::start called more than once");

        let (tx, rx) = oneshot::channel();
        *self.shutdown_tx.lock().await = Some(tx);

        let node = self.clone();
        tokio::spawn(async move {
            accept_loop(node, listener, rx).await;
        });

        self.connect().await;
        Ok(())
    }

    /// Shuts the listening socket down, unblocking the accept loop.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Asks every known neighbor to refresh its view of this node, and
    /// discovers neighbors-of-neighbors via their `CONNECT_ACCEPTED` reply.
    pub async fn connect(&self) {
        let snapshot = self.neighbors();
        for (host, port) in snapshot {
            let envelope = Envelope::Connect {
                host: self.host.clone(),
                port: self.port,
            };
            wire::send_ignoring(&host, port, &envelope).await;
        }
    }

    /// Broadcasts `body` to the whole mesh, tagged with a fresh id so peers
    /// can suppress re-delivery.
    pub async fn broadcast(&self, body: Value) {
        let id = self.next_id();
        if self.verbosity == Verbosity::Full {
            tracing::info!(%id, body = %body, "broadcasting");
        }
        self.process_broadcast(self.host.clone(), self.port, id, body)
            .await;
    }

    /// Sends `body` to a single neighbor without gossiping it further.
    pub async fn send_private(&self, remote_host: &str, remote_port: u16, body: Value) {
        let envelope = Envelope::Private {
            host: self.host.clone(),
            port: self.port,
            body: body.clone(),
        };
        if self.verbosity == Verbosity::Full {
            tracing::info!(%remote_host, %remote_port, body = %body, "sending private packet");
        }
        wire::send_ignoring(remote_host, remote_port, &envelope).await;
    }

    fn next_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        format!(
            "{}:{}#{}.{:09}-{}",
            self.host,
            self.port,
            now.as_secs(),
            now.subsec_nanos(),
            seq
        )
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let envelope = match wire::recv_envelope(&mut stream).await {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::debug!(%error, "failed to read packet");
                return;
            }
        };

        self.log_incoming(&envelope);

        match envelope {
            Envelope::Connect { host, port } => self.on_connect(host, port).await,
            Envelope::ConnectAccepted { nodes } => self.on_connect_accepted(nodes).await,
            Envelope::Broadcast {
                host,
                port,
                id,
                body,
            } => self.process_broadcast(host, port, id, body).await,
            Envelope::Private { host, port, body } => {
                if let Some(callbacks) = self.callbacks.get() {
                    callbacks.on_private(host, port, body).await;
                }
            }
        }
    }

    fn log_incoming(&self, envelope: &Envelope) {
        match self.verbosity {
            Verbosity::Silent => {}
            Verbosity::Summary => {
                tracing::info!(header = envelope.header_name(), "<{}:{}>", self.host, self.port)
            }
            Verbosity::Full => tracing::info!(?envelope, "<{}:{}>", self.host, self.port),
        }
    }

    async fn on_connect(&self, host: String, port: u16) {
        let snapshot = self.neighbors();
        let accepted = Envelope::ConnectAccepted {
            nodes: snapshot.clone(),
        };
        wire::send_ignoring(&host, port, &accepted).await;

        // Notify every existing neighbor of the newcomer. This is not a
        // broadcast: it bypasses the seen-id gossip path entirely.
        let newcomer = Envelope::ConnectAccepted {
            nodes: vec![(host.clone(), port)],
        };
        for (nh, np) in &snapshot {
            wire::send_ignoring(nh, *np, &newcomer).await;
        }

        let mut neighbors = self.neighbors.write();
        if neighbors.len() < self.max_nodes {
            neighbors.insert((host, port));
        }
    }

    async fn on_connect_accepted(&self, nodes: Vec<PeerAddr>) {
        let self_addr = self.self_addr();
        let mut neighbors = self.neighbors.write();
        for node in nodes {
            if neighbors.len() >= self.max_nodes {
                break;
            }
            if node != self_addr {
                neighbors.insert(node);
            }
        }
    }

    async fn process_broadcast(&self, host: String, port: u16, id: String, body: Value) {
        let fresh = {
            let mut seen = self.seen_ids.lock();
            if seen.contains(&id) {
                false
            } else {
                seen.insert(id.clone());
                true
            }
        };
        if !fresh {
            return;
        }
        if self.seen_ttl.is_some() {
            self.seen_order.lock().push_back((Instant::now(), id.clone()));
            self.sweep_seen();
        }

        if let Some(callbacks) = self.callbacks.get() {
            callbacks
                .on_broadcast(host.clone(), port, id.clone(), body.clone())
                .await;
        }

        let snapshot = self.neighbors();
        let mut refused = Vec::new();
        for (nh, np) in snapshot {
            let envelope = Envelope::Broadcast {
                host: host.clone(),
                port,
                id: id.clone(),
                body: body.clone(),
            };
            if let Err(error) = wire::send_envelope(&nh, np, &envelope).await {
                if error.kind() == std::io::ErrorKind::ConnectionRefused {
                    refused.push((nh, np));
                } else {
                    tracing::debug!(%error, host = %nh, port = np, "failed to forward broadcast");
                }
            }
        }

        if !refused.is_empty() {
            let mut neighbors = self.neighbors.write();
            for dead in &refused {
                neighbors.remove(dead);
            }
            drop(neighbors);
            self.connect().await;
        }
    }

    fn sweep_seen(&self) {
        let Some(ttl) = self.seen_ttl else { return };
        let mut order = self.seen_order.lock();
        let mut seen = self.seen_ids.lock();
        while let Some((when, _)) = order.front() {
            if when.elapsed() <= ttl {
                break;
            }
            let (_, id) = order.pop_front().unwrap();
            seen.remove(&id);
        }
    }
}

async fn accept_loop(node: Arc<Node>, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        spawn_handler(node.clone(), stream, addr);
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                    }
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }
}

fn spawn_handler(node: Arc<Node>, stream: TcpStream, _addr: SocketAddr) {
    tokio::spawn(async move {
        node.handle_connection(stream).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingCallbacks {
        broadcasts: StdMutex<Vec<(String, u16, String, Value)>>,
        privates: StdMutex<Vec<(String, u16, Value)>>,
    }

    impl RecordingCallbacks {
        fn new() -> Self {
            RecordingCallbacks {
                broadcasts: StdMutex::new(Vec::new()),
                privates: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NodeCallbacks for RecordingCallbacks {
        async fn on_broadcast(&self, host: String, port: u16, id: String, body: Value) {
            self.broadcasts.lock().unwrap().push((host, port, id, body));
        }

        async fn on_private(&self, host: String, port: u16, body: Value) {
            self.privates.lock().unwrap().push((host, port, body));
        }
    }

    async fn spawn_node(callbacks: Arc<RecordingCallbacks>) -> Arc<Node> {
        let node = Arc::new(
            Node::bind("127.0.0.1", 0, None, 10, Verbosity::Silent)
                .await
                .unwrap(),
        );
        node.set_callbacks(callbacks);
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn connect_exchanges_neighbor_sets() {
        let a = spawn_node(Arc::new(RecordingCallbacks::new())).await;
        let b = Arc::new(
            Node::bind(
                "127.0.0.1",
                0,
                Some((a.host.clone(), a.port)),
                10,
                Verbosity::Silent,
            )
            .await
            .unwrap(),
        );
        b.set_callbacks(Arc::new(RecordingCallbacks::new()));
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a.neighbors().contains(&(b.host.clone(), b.port)));
        assert!(b.neighbors().contains(&(a.host.clone(), a.port)));
    }

    #[tokio::test]
    async fn broadcast_reaches_neighbor_once() {
        let a_callbacks = Arc::new(RecordingCallbacks::new());
        let a = spawn_node(a_callbacks.clone()).await;
        let b_callbacks = Arc::new(RecordingCallbacks::new());
        let b = Arc::new(
            Node::bind(
                "127.0.0.1",
                0,
                Some((a.host.clone(), a.port)),
                10,
                Verbosity::Silent,
            )
            .await
            .unwrap(),
        );
        b.set_callbacks(b_callbacks.clone());
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        b.broadcast(serde_json::json!({"hello": "world"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a_callbacks.broadcasts.lock().unwrap().len(), 1);
        // The originator does not replay its own broadcast back to itself.
        assert_eq!(b_callbacks.broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn private_message_is_not_forwarded() {
        let a_callbacks = Arc::new(RecordingCallbacks::new());
        let a = spawn_node(a_callbacks.clone()).await;
        let b_callbacks = Arc::new(RecordingCallbacks::new());
        let b = Arc::new(
            Node::bind(
                "127.0.0.1",
                0,
                Some((a.host.clone(), a.port)),
                10,
                Verbosity::Silent,
            )
            .await
            .unwrap(),
        );
        b.set_callbacks(b_callbacks.clone());
        b.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        b.send_private(&a.host, a.port, serde_json::json!({"ping": true}))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a_callbacks.privates.lock().unwrap().len(), 1);
        assert!(a_callbacks.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_unblocks_accept_loop() {
        let node = spawn_node(Arc::new(RecordingCallbacks::new())).await;
        node.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
