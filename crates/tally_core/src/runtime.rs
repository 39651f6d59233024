//! Runtime: top-level coordinator for one party.
//!
//! [`Runtime`] is the primary public API of tally_core. It owns:
//! - the dataflow graph (sequence-tag allocation, node builders)
//! - the party registry (one slot per peer connection)
//! - session setup: listen for lower identities, dial higher identities,
//!   wait for the barrier
//! - `feed`: publish local inputs, request the others
//! - teardown

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::connection::PeerConnection;
use crate::error::{Result, RuntimeError};
use crate::graph::{Graph, Node, NodeId, Operand};
use crate::party::{Party, PartyRegistry};
use crate::value::{Operator, Value};

/// Where the runtime is in its single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Graph building; no sockets yet.
    Idle,
    /// `connect` is running.
    Connecting,
    /// Every peer connection is registered.
    Connected,
    /// `shutdown` has run.
    Closed,
}

struct Inner {
    config: SessionConfig,
    registry: PartyRegistry,
    graph: Arc<Graph>,
    state: Mutex<SessionState>,
    fed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// One party's runtime. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Create a runtime for the local party described by `config`.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let registry = PartyRegistry::new(config.local, config.parties.clone())?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                graph: Graph::new(),
                state: Mutex::new(SessionState::Idle),
                fed: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        })
    }

    /// Identity of the local party.
    pub fn pid(&self) -> u8 {
        self.inner.registry.local()
    }

    /// Number of parties in the session, including this one.
    pub fn party_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn parties(&self) -> &PartyRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    // -----------------------------------------------------------------------
    // Graph building
    // -----------------------------------------------------------------------

    /// Create an input variable. Without a label it is named `var_{n}`.
    pub fn variable<'a>(&self, label: impl Into<Option<&'a str>>) -> Node {
        self.inner.graph.variable(label.into())
    }

    /// `a + b` as a new node.
    pub fn add(&self, a: &Node, b: impl Into<Operand>) -> Node {
        self.inner.graph.op(Operator::Add, a, b.into())
    }

    /// `a * b` as a new node.
    pub fn mul(&self, a: &Node, b: impl Into<Operand>) -> Node {
        self.inner.graph.op(Operator::Mul, a, b.into())
    }

    /// `a ** exponent` as a new node.
    pub fn pow(&self, a: &Node, exponent: f64) -> Node {
        self.inner.graph.op(Operator::Pow, a, Operand::Constant(exponent))
    }

    /// Number of sequence tags allocated so far.
    pub fn node_count(&self) -> usize {
        self.inner.graph.len()
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Connect to every peer and wait for the session barrier.
    ///
    /// Peers with a lesser identity dial us; we dial peers with a greater
    /// identity, retrying until they listen. Returns once every peer slot is
    /// registered. Calling it again while connected is a no-op.
    ///
    /// A failed connect shuts the session down: the listener stops, any
    /// connection formed so far is closed and the runtime ends up `Closed`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                SessionState::Idle => *state = SessionState::Connecting,
                SessionState::Connected => return Ok(()),
                SessionState::Connecting => return Err(RuntimeError::ConnectInProgress),
                SessionState::Closed => return Err(RuntimeError::SessionClosed),
            }
        }

        let local = self.pid();
        if let Err(e) = self.establish().await {
            warn!("Party {local}: connect failed: {e}");
            self.shutdown().await;
            return Err(e);
        }

        let mut state = self.inner.state.lock();
        if *state != SessionState::Connecting {
            // Shut down while the barrier was pending.
            return Err(RuntimeError::SessionClosed);
        }
        *state = SessionState::Connected;
        info!("Party {local}: connected");
        Ok(())
    }

    async fn establish(&self) -> Result<()> {
        if self.inner.registry.expected_inbound() > 0 {
            self.listen().await?;
        }

        let barrier = async {
            let dials = self.inner.registry.dial_targets().map(|party| self.dial(party));
            futures::future::try_join_all(dials).await?;
            self.inner.registry.wait_connected().await;
            Ok::<(), RuntimeError>(())
        };
        match self.inner.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, barrier)
                .await
                .map_err(|_| RuntimeError::ConnectTimeout(limit))??,
            None => barrier.await?,
        }

        // Everyone who may dial us has done so.
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    /// The session barrier on its own: resolves once every peer is registered.
    pub async fn wait_connected(&self) {
        self.inner.registry.wait_connected().await;
    }

    /// Number of peers registered so far.
    pub fn connected_peers(&self) -> usize {
        self.inner.registry.connected_count()
    }

    async fn listen(&self) -> Result<()> {
        let local = self.pid();
        let port = self
            .inner
            .config
            .local_address()
            .map(|addr| addr.port)
            .ok_or_else(|| RuntimeError::Config(format!("no address for party {local}")))?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Party {local}: listening on port {port}");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(accept_loop(inner, listener));
        *self.inner.listener.lock() = Some(handle);
        Ok(())
    }

    async fn dial(&self, party: &Party) -> Result<()> {
        let local = self.pid();
        let target = party
            .address()
            .map(ToString::to_string)
            .ok_or_else(|| RuntimeError::Config(format!("no address for party {}", party.id())))?;
        let retry = self.inner.config.retry_interval;
        let max_payload = self.inner.config.max_payload;

        let mut attempts: u32 = 0;
        loop {
            match PeerConnection::dial(local, party.id(), &target, max_payload).await {
                Ok(connection) => {
                    self.inner.registry.register(party.id(), connection)?;
                    info!("Party {local}: connected to party {} at {target}", party.id());
                    return Ok(());
                }
                Err(RuntimeError::Io(e)) => {
                    attempts += 1;
                    debug!("Party {local}: connect to {target} failed (attempt {attempts}): {e}");
                    tokio::time::sleep(retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close every peer connection and stop listening. Idempotent; safe when
    /// some connections never formed.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), SessionState::Closed);
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
        self.inner.registry.close_all().await;
        if previous != SessionState::Closed {
            info!("Party {}: shut down", self.pid());
        }
    }

    /// Run `f` inside a managed session: connect, run, then shut down whether
    /// or not `f` succeeded. A failed connect has already shut down.
    pub async fn session<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.connect().await?;
        let result = f(self.clone()).await;
        self.shutdown().await;
        result
    }

    // -----------------------------------------------------------------------
    // Exchange
    // -----------------------------------------------------------------------

    /// Supply this party's inputs, request every other variable from every
    /// peer, then send the inputs to every peer. A peer whose connection is
    /// already closed is skipped with a warning.
    ///
    /// May be called once per session; a second call fails with
    /// [`RuntimeError::AlreadyFed`] and sends nothing. Every entry is
    /// checked before anything is resolved or sent.
    pub async fn feed<'a, I>(&self, inputs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a Node, Value)>,
    {
        if !self.inner.registry.is_connected() || self.state() != SessionState::Connected {
            return Err(RuntimeError::NotConnected);
        }
        if self.inner.fed.load(Ordering::Acquire) {
            return Err(RuntimeError::AlreadyFed(
                "feed may be called once per session".into(),
            ));
        }

        let inputs: Vec<(&Node, Value)> = inputs.into_iter().collect();
        let mut fed: HashSet<NodeId> = HashSet::with_capacity(inputs.len());
        for (node, _) in &inputs {
            if !node.belongs_to(&self.inner.graph) {
                return Err(RuntimeError::UnknownVariable(node.label()));
            }
            if !node.is_variable() {
                return Err(RuntimeError::NotAVariable(node.label()));
            }
            if node.is_resolved() || !fed.insert(node.tag()) {
                return Err(RuntimeError::AlreadyFed(node.label()));
            }
        }
        if self
            .inner
            .fed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::AlreadyFed(
                "feed may be called once per session".into(),
            ));
        }

        let mut resolved = Vec::with_capacity(inputs.len());
        for (node, value) in inputs {
            node.slot().resolve(value);
            resolved.push(node);
        }

        // Claim remote inputs first so payloads that already arrived are
        // picked up even if a send below fails.
        for id in self.inner.graph.variables() {
            if fed.contains(&id) {
                continue;
            }
            let node = self.inner.graph.node(id);
            for party in self.inner.registry.peers() {
                party.receive(&node)?;
            }
        }

        for node in &resolved {
            for party in self.inner.registry.peers() {
                match party.send(node).await {
                    Ok(()) => {}
                    // A peer that already left no longer needs our inputs.
                    Err(e @ (RuntimeError::ConnectionClosed(_) | RuntimeError::Io(_))) => {
                        warn!("Party {}: {party}.send({node}) skipped: {e}", self.pid());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            "Party {}: fed {} inputs, awaiting {}",
            self.pid(),
            fed.len(),
            self.inner.graph.variables().len() - fed.len()
        );
        Ok(())
    }

    /// Await `node`, bounded by the configured `resolve_timeout`.
    ///
    /// On timeout the unresolved inputs the node depends on are logged and
    /// [`RuntimeError::ResolveTimeout`] is returned.
    pub async fn evaluate(&self, node: &Node) -> Result<Value> {
        if !node.belongs_to(&self.inner.graph) {
            return Err(RuntimeError::UnknownVariable(node.label()));
        }
        let Some(limit) = self.inner.config.resolve_timeout else {
            return node.resolve().await;
        };
        match tokio::time::timeout(limit, node.resolve()).await {
            Ok(result) => result,
            Err(_) => {
                let missing = self.inner.graph.unresolved_inputs(node.tag());
                warn!(
                    "Party {}: {node} (tag {}) unresolved after {limit:?}; waiting on tags {missing:?}",
                    self.pid(),
                    node.tag()
                );
                Err(RuntimeError::ResolveTimeout {
                    tag: node.tag(),
                    label: node.label(),
                    after: limit,
                })
            }
        }
    }
}

/// Accept inbound sockets until aborted; each handshake runs in its own
/// task so a silent client cannot hold up the others.
async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { admit(inner, stream, addr).await });
            }
            Err(e) => {
                // Persistent errors such as EMFILE would otherwise spin.
                warn!("Accept failed: {e}");
                tokio::time::sleep(inner.config.retry_interval).await;
            }
        }
    }
}

async fn admit(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    let local = inner.registry.local();
    let (peer, connection) = match PeerConnection::accept(stream, inner.config.max_payload).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Party {local}: handshake from {addr} failed: {e}");
            return;
        }
    };
    if *inner.state.lock() == SessionState::Closed {
        debug!("Party {local}: session closed, dropping handshake from party {peer}");
        connection.close().await;
        return;
    }
    let registered = inner
        .registry
        .check_inbound(peer)
        .and_then(|()| inner.registry.register(peer, Arc::clone(&connection)));
    match registered {
        Ok(()) => info!("Party {local}: accepted party {peer} from {addr}"),
        Err(e) => {
            warn!("Party {local}: rejected handshake from {addr}: {e}");
            connection.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartyAddress;

    fn solo() -> Runtime {
        Runtime::new(SessionConfig::new(0, vec![PartyAddress::new("127.0.0.1", 0)])).unwrap()
    }

    #[test]
    fn test_runtime_creation() {
        let rt = solo();
        assert_eq!(rt.pid(), 0);
        assert_eq!(rt.party_count(), 1);
        assert_eq!(rt.state(), SessionState::Idle);
        assert_eq!(rt.node_count(), 0);
    }

    #[test]
    fn test_runtime_rejects_bad_local() {
        let config = SessionConfig::new(2, vec![PartyAddress::new("127.0.0.1", 1)]);
        assert!(matches!(Runtime::new(config), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_operator_methods_allocate_tags() {
        let rt = solo();
        let a = rt.variable("a");
        let b = rt.variable(None);
        let sum = rt.add(&a, &b);
        let scaled = rt.mul(&sum, 2.0);
        let cubed = rt.pow(&scaled, 3.0);
        assert_eq!(b.label(), "var_1");
        assert_eq!(sum.tag(), 2);
        assert_eq!(scaled.tag(), 3);
        assert_eq!(cubed.tag(), 4);
        assert_eq!(rt.node_count(), 5);
    }

    #[tokio::test]
    async fn test_feed_before_connect() {
        let rt = solo();
        let a = rt.variable(None);
        assert!(matches!(
            rt.feed([(&a, Value::scalar(1.0))]).await,
            Err(RuntimeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_single_party_session() {
        let rt = solo();
        let a = rt.variable(None);
        let b = rt.variable(None);
        let out = &(&a + &b) * 2.0;

        let value = rt
            .session(|rt| async move {
                rt.feed([(&a, Value::scalar(1.0)), (&b, Value::scalar(4.0))]).await?;
                rt.evaluate(&out).await
            })
            .await
            .unwrap();
        assert_eq!(value, Value::scalar(10.0));
        assert_eq!(rt.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_feed_validation() {
        let rt = solo();
        let a = rt.variable(None);
        let b = rt.variable(None);
        let sum = &a + &b;
        let stranger = solo().variable("stranger");
        rt.connect().await.unwrap();

        assert!(matches!(
            rt.feed([(&sum, Value::scalar(1.0))]).await,
            Err(RuntimeError::NotAVariable(_))
        ));
        assert!(matches!(
            rt.feed([(&stranger, Value::scalar(1.0))]).await,
            Err(RuntimeError::UnknownVariable(label)) if label == "stranger"
        ));
        assert!(matches!(
            rt.feed([(&a, Value::scalar(1.0)), (&a, Value::scalar(2.0))]).await,
            Err(RuntimeError::AlreadyFed(_))
        ));
        // Rejected calls change nothing.
        assert!(!a.is_resolved());

        rt.feed([(&a, Value::scalar(1.0))]).await.unwrap();
        assert!(matches!(
            rt.feed([(&b, Value::scalar(2.0))]).await,
            Err(RuntimeError::AlreadyFed(_))
        ));
        assert!(!b.is_resolved());
        assert_eq!(a.value(), Some(Value::scalar(1.0)));
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn test_evaluate_timeout_names_tag() {
        let mut config = SessionConfig::new(0, vec![PartyAddress::new("127.0.0.1", 0)]);
        config.resolve_timeout = Some(std::time::Duration::from_millis(50));
        let rt = Runtime::new(config).unwrap();
        let a = rt.variable(None);
        let b = rt.variable("b");
        let sum = &a + &b;
        rt.connect().await.unwrap();
        rt.feed([(&a, Value::scalar(1.0))]).await.unwrap();

        match rt.evaluate(&sum).await {
            Err(RuntimeError::ResolveTimeout { tag, label, .. }) => {
                assert_eq!(tag, 2);
                assert_eq!(label, "add(var_0,b)");
            }
            other => panic!("Expected ResolveTimeout, got {other:?}"),
        }
        assert_eq!(rt.inner.graph.unresolved_inputs(sum.tag()), vec![1]);
        rt.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let rt = solo();
        rt.shutdown().await;
        rt.shutdown().await;
        assert!(matches!(rt.connect().await, Err(RuntimeError::SessionClosed)));
    }
}
