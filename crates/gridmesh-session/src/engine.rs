//! The per-peer session engine: a single UDP socket used simultaneously as
//! a client (we await replies to our own requests) and a server (we answer
//! the remote's spontaneous Hello / PublicKey / Root / GetDatum).
//!
//! Structurally this follows `summitd::session::listener::SessionListener`:
//! one socket, one correlation table (`DashMap`, mirroring
//! `SessionTable`), handshake flags behind a `tokio::sync::Mutex`
//! (mirroring `HandshakeTracker`), and a `tokio::select!` read loop over
//! socket reads, a shutdown signal, and the keep-alive ticker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gridmesh_core::config::SessionConfig;
use gridmesh_core::crypto::{self, Keypair};
use gridmesh_core::merkle::{self, Node};
use gridmesh_core::wire::{Tag, HASH_LEN, PUBKEY_LEN};
use gridmesh_core::Message;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::errors::SessionError;

/// Timeouts and intervals driving retries and keep-alive, sourced from
/// `GridmeshConfig::session` rather than fixed constants, so `fetch_timeout_secs`
/// / `keepalive_interval_secs` / `dead_peer_timeout_secs` / `nat_fallback_after_misses`
/// actually reach the wire.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub fetch_timeout: Duration,
    pub handshake_step_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_probe_timeout: Duration,
    pub keepalive_misses_before_dead: u32,
    pub hello_timeouts_before_nat_fallback: u32,
}

impl Default for SessionTiming {
    fn default() -> Self {
        SessionTiming::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionTiming {
    fn from(cfg: &SessionConfig) -> Self {
        let fetch_timeout = Duration::from_secs(cfg.fetch_timeout_secs.max(1));
        let misses = (cfg.dead_peer_timeout_secs / cfg.fetch_timeout_secs.max(1)).max(1) as u32;
        SessionTiming {
            fetch_timeout,
            handshake_step_timeout: fetch_timeout,
            keepalive_interval: Duration::from_secs(cfg.keepalive_interval_secs.max(1)),
            keepalive_probe_timeout: fetch_timeout,
            keepalive_misses_before_dead: misses,
            hello_timeouts_before_nat_fallback: cfg.nat_fallback_after_misses.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Fresh,
    HelloSent,
    HelloDone,
    PubkeySent,
    PubkeyDone,
    RootSent,
    Established,
    NatFallback,
    Terminal,
}

/// Mutable per-session state, protected by one mutex — mirrors
/// `summitd::session::state::HandshakeTracker`'s per-peer record.
struct SessionFlags {
    state: HandshakeState,
    /// Whether a Hello round-trip has completed on this session, in
    /// *either* direction: we sent Hello and got a HelloReply, or the
    /// remote sent us a Hello (which we always answer). Either one
    /// satisfies the "say hello first" precondition on tags 3/4/5/130/131,
    /// per spec §4.3.
    hello_done: bool,
    peer_key: Option<[u8; 64]>,
    peer_root: Option<[u8; HASH_LEN]>,
    hello_timeouts: u32,
}

impl SessionFlags {
    fn fresh(peer_key: Option<[u8; 64]>) -> Self {
        SessionFlags {
            state: HandshakeState::Fresh,
            hello_done: false,
            peer_key,
            peer_root: None,
            hello_timeouts: 0,
        }
    }
}

type Waiter = oneshot::Sender<Result<(Message, Option<[u8; 64]>), SessionError>>;

/// One datagram session toward a single remote peer.
pub struct SessionEngine {
    socket: UdpSocket,
    remote: SocketAddr,
    identity: Option<Arc<Keypair>>,
    local_name: String,
    local_tree: Option<Arc<Node>>,
    flags: Mutex<SessionFlags>,
    correlation: DashMap<u32, Waiter>,
    next_request_id: AtomicU32,
    shutdown_tx: broadcast::Sender<()>,
    timing: SessionTiming,
    /// Forwards addresses named in unsolicited `NatTraversal` datagrams to
    /// whoever owns session lifecycle (the orchestrator) — the engine
    /// itself has no authority to open a new session.
    nat_events: Option<mpsc::UnboundedSender<SocketAddr>>,
}

impl SessionEngine {
    /// Binds to an OS-assigned ephemeral port on the wildcard address and
    /// connects to `remote`. The common case — `register()`/`connect()`
    /// from the orchestrator don't care which local port they end up on.
    ///
    /// `peer_key` carries the peer's public key whenever the caller already
    /// knows it (e.g. published by the directory) so the signature policy
    /// applies from the very first inbound datagram, rather than waiting
    /// for `exchange_public_key` to populate it mid-session.
    pub async fn connect(
        remote: SocketAddr,
        identity: Option<Arc<Keypair>>,
        local_name: String,
        peer_key: Option<[u8; PUBKEY_LEN]>,
        local_tree: Option<Arc<Node>>,
        nat_events: Option<mpsc::UnboundedSender<SocketAddr>>,
        timing: SessionTiming,
    ) -> Result<Arc<Self>, SessionError> {
        let bind_addr: SocketAddr =
            if remote.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        Self::connect_from(bind_addr, remote, identity, local_name, peer_key, local_tree, nat_events, timing)
            .await
    }

    /// Like [`connect`](Self::connect), but binds the local socket to
    /// `bind_addr` rather than an OS-assigned wildcard port — how
    /// `network.bind_addr`/`network.bind_port` reach the wire.
    pub async fn connect_from(
        bind_addr: SocketAddr,
        remote: SocketAddr,
        identity: Option<Arc<Keypair>>,
        local_name: String,
        peer_key: Option<[u8; PUBKEY_LEN]>,
        local_tree: Option<Arc<Node>>,
        nat_events: Option<mpsc::UnboundedSender<SocketAddr>>,
        timing: SessionTiming,
    ) -> Result<Arc<Self>, SessionError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(SessionEngine {
            socket,
            remote,
            identity,
            local_name,
            local_tree,
            flags: Mutex::new(SessionFlags::fresh(peer_key)),
            correlation: DashMap::new(),
            next_request_id: AtomicU32::new(1),
            shutdown_tx,
            timing,
            nat_events,
        }))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("a connected UDP socket always has a local address")
    }

    pub async fn state(&self) -> HandshakeState {
        self.flags.lock().await.state
    }

    /// The peer's root hash, once `exchange_root` has completed.
    pub async fn peer_root(&self) -> Option<[u8; HASH_LEN]> {
        self.flags.lock().await.peer_root
    }

    /// The peer's public key, if it presented one during `exchange_public_key`.
    pub async fn peer_public_key(&self) -> Option<[u8; 64]> {
        self.flags.lock().await.peer_key
    }

    /// Drops every outstanding waiter (its receiver observes `RecvError`,
    /// which the downloader maps to [`SessionError::Cancelled`]) and marks
    /// the session terminal. The read loop task observes the shutdown
    /// broadcast and exits on its next iteration.
    pub async fn disconnect(&self) {
        self.flags.lock().await.state = HandshakeState::Terminal;
        self.correlation.clear();
        let _ = self.shutdown_tx.send(());
    }

    fn next_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    async fn sign_if_able(&self, frame: &[u8]) -> Option<[u8; 64]> {
        self.identity.as_ref().and_then(|kp| kp.sign(frame))
    }

    async fn send_raw(&self, msg: &Message) -> Result<(), SessionError> {
        let mut frame = msg.encode()?;
        if let Some(sig) = self.sign_if_able(&frame).await {
            gridmesh_core::message::append_signature(&mut frame, &sig);
        }
        self.socket.send(&frame).await?;
        Ok(())
    }

    /// Sends `msg`, registers a waiter for its request id, and waits up to
    /// `timeout`. No retry — used by the keep-alive prober, which simply
    /// tries again on its own next tick.
    async fn request_once(
        &self,
        msg: Message,
        timeout: Duration,
    ) -> Result<(Message, Option<[u8; 64]>), SessionError> {
        let id = msg.request_id();
        let (tx, rx) = oneshot::channel();
        self.correlation.insert(id, tx);
        if let Err(e) = self.send_raw(&msg).await {
            self.correlation.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                self.correlation.remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Sends `build(id)`, retries once on timeout, then surfaces failure —
    /// the shape every fetch and handshake step uses (spec: "waits up to
    /// 5 seconds; on timeout it retransmits once, then surfaces failure").
    async fn request_with_retry(
        &self,
        build: impl Fn(u32) -> Message,
        timeout: Duration,
    ) -> Result<(Message, Option<[u8; 64]>), SessionError> {
        let id = self.next_id();
        match self.request_once(build(id), timeout).await {
            Ok(reply) => Ok(reply),
            Err(SessionError::Timeout) => self.request_once(build(id), timeout).await,
            Err(other) => Err(other),
        }
    }

    /// Drives one Hello → HelloReply step, advancing `hello_timeouts` on
    /// failure and flipping to `NatFallback` after five consecutive misses.
    pub async fn hello(&self) -> Result<(), SessionError> {
        {
            let mut flags = self.flags.lock().await;
            flags.state = HandshakeState::HelloSent;
        }
        let name = self.local_name.clone();
        let result = self
            .request_with_retry(
                |id| Message::Hello { request_id: id, extensions: 0, name: name.clone() },
                self.timing.handshake_step_timeout,
            )
            .await;
        let mut flags = self.flags.lock().await;
        match result {
            Ok(_) => {
                flags.state = HandshakeState::HelloDone;
                flags.hello_done = true;
                flags.hello_timeouts = 0;
                Ok(())
            }
            Err(SessionError::Timeout) => {
                flags.hello_timeouts += 1;
                if flags.hello_timeouts >= self.timing.hello_timeouts_before_nat_fallback {
                    flags.state = HandshakeState::NatFallback;
                    Err(SessionError::NatFallbackRequired)
                } else {
                    Err(SessionError::Timeout)
                }
            }
            Err(other) => Err(other),
        }
    }

    pub async fn exchange_public_key(&self) -> Result<(), SessionError> {
        self.flags.lock().await.state = HandshakeState::PubkeySent;
        let key = self.identity.as_ref().map(|kp| kp.public_key_bytes());
        let (reply, _) = self
            .request_with_retry(
                move |id| Message::PublicKey { request_id: id, key },
                self.timing.handshake_step_timeout,
            )
            .await?;
        let mut flags = self.flags.lock().await;
        if let Message::PublicKeyReply { key, .. } = reply {
            if let Some(k) = key {
                flags.peer_key = Some(k);
            }
        }
        flags.state = HandshakeState::PubkeyDone;
        Ok(())
    }

    pub async fn exchange_root(&self, local_root: [u8; HASH_LEN]) -> Result<(), SessionError> {
        self.flags.lock().await.state = HandshakeState::RootSent;
        let (reply, _) = self
            .request_with_retry(
                move |id| Message::Root { request_id: id, hash: local_root },
                self.timing.handshake_step_timeout,
            )
            .await?;
        let mut flags = self.flags.lock().await;
        if let Message::RootReply { hash, .. } = reply {
            flags.peer_root = Some(hash);
        }
        flags.state = HandshakeState::Established;
        Ok(())
    }

    /// Fetches one Datum by hash. Sequential per session: the caller
    /// (the downloader) must await this before issuing the next GetDatum.
    pub async fn get_datum(
        &self,
        hash: [u8; HASH_LEN],
    ) -> Result<(Message, Option<[u8; 64]>), SessionError> {
        self.request_with_retry(move |id| Message::GetDatum { request_id: id, hash }, self.timing.fetch_timeout)
            .await
    }

    /// Sends a NAT-traversal request carrying `stuck_peer`'s last known
    /// address, fire-and-forget: the directory's `NatTraversal` reply
    /// isn't correlated by request id (per the dispatch table it's handled
    /// like an unsolicited event) — it arrives on `nat_events` instead.
    pub async fn send_nat_traversal_request(&self, stuck_peer: SocketAddr) -> Result<(), SessionError> {
        let id = self.next_id();
        self.send_raw(&Message::NatTraversalRequest { request_id: id, addr: stuck_peer }).await
    }

    // ── Keep-alive ────────────────────────────────────────────────────────

    /// Runs until the session is terminal or two consecutive Hello probes
    /// go unanswered, per spec: 60s cadence, 5s probe timeout, two misses
    /// to declare dead.
    pub async fn run_keepalive(self: Arc<Self>) {
        let mut misses = 0u32;
        let mut ticker = tokio::time::interval(self.timing.keepalive_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if self.state().await == HandshakeState::Terminal {
                return;
            }
            let name = self.local_name.clone();
            let id = self.next_id();
            let probe = Message::Hello { request_id: id, extensions: 0, name };
            match self.request_once(probe, self.timing.keepalive_probe_timeout).await {
                Ok(_) => misses = 0,
                Err(SessionError::Timeout) => {
                    misses += 1;
                    if misses >= self.timing.keepalive_misses_before_dead {
                        tracing::warn!(remote = %self.remote, "session missed {misses} keep-alive probes, declaring dead");
                        self.disconnect().await;
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    // ── Inbound read loop ─────────────────────────────────────────────────

    pub fn spawn_read_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; gridmesh_core::wire::MAX_DATAGRAM_LEN];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    result = self.socket.recv(&mut buf) => {
                        match result {
                            Ok(n) => {
                                let datagram = buf[..n].to_vec();
                                let engine = Arc::clone(&self);
                                tokio::spawn(async move { engine.handle_inbound(&datagram).await });
                            }
                            Err(e) => {
                                tracing::warn!(remote = %self.remote, error = %e, "socket read failed, ending session");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle_inbound(self: Arc<Self>, datagram: &[u8]) {
        let (message, signature) = match Message::decode(datagram, false) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(remote = %self.remote, error = %e, "dropping malformed datagram");
                return;
            }
        };

        let signed_prefix_len = datagram.len() - signature.map_or(0, |_| 64);
        if !self.check_signature_policy(&datagram[..signed_prefix_len], signature).await {
            self.deliver(message.request_id(), Err(SessionError::BadSignature));
            let _ = self
                .send_raw(&Message::ErrorReply {
                    request_id: message.request_id(),
                    reason: "Bad signature".to_string(),
                })
                .await;
            return;
        }

        if let Err(e) = self.enforce_precondition(&message).await {
            let _ = self
                .send_raw(&Message::ErrorReply {
                    request_id: message.request_id(),
                    reason: "Please say hello first".to_string(),
                })
                .await;
            tracing::debug!(remote = %self.remote, error = %e, "precondition violated");
            return;
        }

        self.dispatch(message, signature).await;
    }

    async fn check_signature_policy(&self, signed_bytes: &[u8], signature: Option<[u8; 64]>) -> bool {
        let flags = self.flags.lock().await;
        let Some(peer_key) = flags.peer_key else { return true };
        match signature {
            Some(sig) => crypto::verify(&peer_key, signed_bytes, &sig),
            None => false,
        }
    }

    async fn enforce_precondition(&self, message: &Message) -> Result<(), SessionError> {
        let needs_hello = matches!(
            message,
            Message::PublicKey { .. }
                | Message::PublicKeyReply { .. }
                | Message::Root { .. }
                | Message::RootReply { .. }
                | Message::GetDatum { .. }
                | Message::Unknown { .. }
        );
        if !needs_hello {
            return Ok(());
        }
        let flags = self.flags.lock().await;
        if flags.hello_done {
            Ok(())
        } else {
            Err(SessionError::PreconditionViolated(
                message.tag().unwrap_or(Tag::NoOp),
            ))
        }
    }

    async fn dispatch(self: Arc<Self>, message: Message, signature: Option<[u8; 64]>) {
        match message {
            Message::NoOp { .. } => {}
            Message::Error { reason, request_id } | Message::ErrorReply { reason, request_id } => {
                tracing::info!(remote = %self.remote, %reason, "peer sent an error");
                self.deliver(request_id, Err(SessionError::PeerError(reason)));
            }
            Message::Hello { request_id, .. } => {
                self.flags.lock().await.hello_done = true;
                let was_nat_fallback = self.state().await == HandshakeState::NatFallback;
                let _ = self
                    .send_raw(&Message::HelloReply {
                        request_id,
                        extensions: 0,
                        name: self.local_name.clone(),
                    })
                    .await;
                if was_nat_fallback {
                    let _ = self.hello().await;
                }
            }
            Message::PublicKey { request_id, .. } => {
                let key = self.identity.as_ref().map(|kp| kp.public_key_bytes());
                let _ = self.send_raw(&Message::PublicKeyReply { request_id, key }).await;
            }
            Message::Root { request_id, .. } => {
                let hash = self.local_tree.as_ref().map(|n| n.hash).unwrap_or([0u8; HASH_LEN]);
                let _ = self.send_raw(&Message::RootReply { request_id, hash }).await;
            }
            Message::GetDatum { request_id, hash } => {
                self.serve_get_datum(request_id, hash).await;
            }
            Message::NatTraversalRequest { request_id, .. } => {
                let _ = self
                    .send_raw(&Message::ErrorReply {
                        request_id,
                        reason: "we are not the directory".to_string(),
                    })
                    .await;
            }
            Message::NatTraversal { addr, .. } => {
                if let Some(tx) = &self.nat_events {
                    let _ = tx.send(addr);
                }
            }
            Message::HelloReply { request_id, .. } => {
                self.deliver(request_id, Ok((message, signature)));
            }
            Message::PublicKeyReply { request_id, .. }
            | Message::RootReply { request_id, .. }
            | Message::Datum { request_id, .. }
            | Message::NoDatum { request_id, .. } => {
                self.deliver(request_id, Ok((message, signature)));
            }
            Message::Unknown { request_id, .. } => {
                tracing::debug!(remote = %self.remote, request_id, "unrecognized tag");
            }
        }
    }

    fn deliver(&self, request_id: u32, outcome: Result<(Message, Option<[u8; 64]>), SessionError>) {
        match self.correlation.remove(&request_id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(remote = %self.remote, request_id, "no waiter for this reply");
            }
        }
    }

    /// Sends an `ErrorReply` unprompted by a freshly-dispatched inbound
    /// message — used by the downloader when a reply it already pulled off
    /// the correlation table turns out to violate the protocol (a
    /// mismatched embedded hash field).
    pub async fn send_error_reply(&self, request_id: u32, reason: impl Into<String>) {
        let _ = self.send_raw(&Message::ErrorReply { request_id, reason: reason.into() }).await;
    }

    async fn serve_get_datum(&self, request_id: u32, hash: [u8; HASH_LEN]) {
        let found = self.local_tree.as_ref().and_then(|root| find_by_hash(root, &hash));
        match found {
            Some(node) => {
                let body = merkle::encode_datum_body(node);
                let _ = self
                    .send_raw(&Message::Datum { request_id, hash, kind: node.datum_kind(), body })
                    .await;
            }
            None => {
                let _ = self.send_raw(&Message::NoDatum { request_id, hash }).await;
            }
        }
    }
}

fn find_by_hash<'a>(node: &'a Node, hash: &[u8; HASH_LEN]) -> Option<&'a Node> {
    if &node.hash == hash {
        return Some(node);
    }
    match &node.kind {
        gridmesh_core::merkle::NodeKind::Chunk(_) => None,
        gridmesh_core::merkle::NodeKind::Internal(children) => {
            children.iter().find_map(|c| find_by_hash(c, hash))
        }
        gridmesh_core::merkle::NodeKind::Directory(entries) => {
            entries.iter().find_map(|e| find_by_hash(&e.child, hash))
        }
    }
}
