//! The orchestrator: registration handshake with the directory, the
//! connect-to-peer handshake, and the download driver. Ties
//! `gridmesh-core` (identity, local tree), `gridmesh-directory` (the four
//! HTTP lookups), and `gridmesh-session` (the per-peer engine) together —
//! this is the one place process-wide state lives, per spec §9's "a
//! correct implementation threads a session context explicitly and
//! reserves process-wide state for (a) the local key pair, (b) the local
//! exported tree, (c) the directory HTTPS client."

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use gridmesh_core::config::GridmeshConfig;
use gridmesh_core::crypto::{self, Keypair};
use gridmesh_core::merkle::{self, Node};
use gridmesh_core::wire::{HASH_LEN, PUBKEY_LEN};
use gridmesh_directory::DirectoryClient;
use gridmesh_session::{download_node, HandshakeState, SessionEngine, SessionError, SessionTiming};
use std::net::IpAddr;
use tokio::sync::{mpsc, Mutex};

use crate::keyfile;

const NAT_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: GridmeshConfig,
    identity: Mutex<Arc<Keypair>>,
    local_tree: Mutex<Option<Arc<Node>>>,
    directory_http: DirectoryClient,
    directory_session: Mutex<Option<Arc<SessionEngine>>>,
    nat_tx: mpsc::UnboundedSender<SocketAddr>,
    nat_rx: Mutex<mpsc::UnboundedReceiver<SocketAddr>>,
    peers: DashMap<String, Arc<SessionEngine>>,
    current: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(config: GridmeshConfig) -> Result<Self> {
        let identity = keyfile::load_or_generate(&config.identity.keypair_path)
            .context("loading or generating the local keypair")?;
        identity.set_signing_enabled(config.session.signature_enabled);
        let local_tree = match &config.identity.export_path {
            Some(path) => Some(Arc::new(
                merkle::build_from_path(path)
                    .with_context(|| format!("building the Merkle tree for {}", path.display()))?,
            )),
            None => None,
        };
        let directory_http = DirectoryClient::new(config.directory.base_url.clone());
        let (nat_tx, nat_rx) = mpsc::unbounded_channel();
        Ok(Orchestrator {
            config,
            identity: Mutex::new(Arc::new(identity)),
            local_tree: Mutex::new(local_tree),
            directory_http,
            directory_session: Mutex::new(None),
            nat_tx,
            nat_rx: Mutex::new(nat_rx),
            peers: DashMap::new(),
            current: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.identity.name
    }

    pub async fn identity(&self) -> Arc<Keypair> {
        Arc::clone(&*self.identity.lock().await)
    }

    pub async fn local_root(&self) -> [u8; HASH_LEN] {
        self.local_tree.lock().await.as_ref().map(|n| n.hash).unwrap_or([0u8; HASH_LEN])
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .config
            .network
            .bind_addr
            .parse()
            .with_context(|| format!("invalid network.bind_addr {:?}", self.config.network.bind_addr))?;
        Ok(SocketAddr::new(ip, self.config.network.bind_port))
    }

    // ── Key management (generateKey / importKey / exportKey) ────────────────

    pub async fn generate_key(&self) -> Result<()> {
        let kp = keyfile::generate_and_save(&self.config.identity.keypair_path)?;
        kp.set_signing_enabled(self.config.session.signature_enabled);
        *self.identity.lock().await = Arc::new(kp);
        Ok(())
    }

    pub async fn import_key(&self, path: &Path) -> Result<()> {
        let kp = keyfile::load(path)?;
        kp.set_signing_enabled(self.config.session.signature_enabled);
        *self.identity.lock().await = Arc::new(kp);
        Ok(())
    }

    pub async fn export_key(&self, path: &Path) -> Result<()> {
        keyfile::save(&*self.identity.lock().await, path)
    }

    pub async fn set_signing_enabled(&self, on: bool) {
        self.identity.lock().await.set_signing_enabled(on);
    }

    // ── Registration (§4.6) ─────────────────────────────────────────────────

    /// Opens a UDP session toward the directory's datagram endpoint, says
    /// Hello, and leaves the session's read loop + keep-alive running so
    /// the directory's subsequent PublicKey/Root requests are answered by
    /// the session engine's ordinary server-role dispatch.
    pub async fn register(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .directory
            .udp_addr
            .parse()
            .with_context(|| format!("invalid directory.udp_addr {:?}", self.config.directory.udp_addr))?;
        let identity = self.identity().await;
        let tree = self.local_tree.lock().await.clone();
        let engine = SessionEngine::connect(
            addr,
            Some(identity),
            self.config.identity.name.clone(),
            None,
            tree,
            Some(self.nat_tx.clone()),
            SessionTiming::from(&self.config.session),
        )
        .await?;
        Arc::clone(&engine).spawn_read_loop();
        engine.hello().await.context("Hello handshake with the directory failed")?;
        tokio::spawn(Arc::clone(&engine).run_keepalive());
        *self.directory_session.lock().await = Some(engine);
        Ok(())
    }

    // ── Directory lookups (§4.5) ─────────────────────────────────────────────

    pub async fn list_peers(&self) -> Result<Vec<String>> {
        Ok(self.directory_http.list_peers().await?)
    }

    pub async fn get_addresses(&self, name: &str) -> Result<Option<Vec<String>>> {
        Ok(self.directory_http.peer_addresses(name).await?)
    }

    pub async fn get_key(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.directory_http.peer_key(name).await?)
    }

    pub async fn get_root_hash(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.directory_http.peer_root(name).await?)
    }

    // ── Connect-to-peer handshake ────────────────────────────────────────────

    pub async fn connect(&self, name: &str) -> Result<()> {
        let addresses = self
            .directory_http
            .peer_addresses(name)
            .await?
            .ok_or_else(|| anyhow!("directory has no addresses on file for {name}"))?;
        let first =
            addresses.first().ok_or_else(|| anyhow!("directory published zero addresses for {name}"))?;
        let addr: SocketAddr =
            first.parse().with_context(|| format!("address {first:?} for {name} is not host:port"))?;
        let peer_key = match self.directory_http.peer_key(name).await? {
            Some(bytes) => Some(
                crypto::decode_public_key_bytes(&bytes)
                    .map_err(|e| anyhow!("directory published an invalid public key for {name}: {e}"))?,
            ),
            None => None,
        };

        let engine = self.open_session(addr, peer_key).await?;
        let engine = self.drive_handshake(engine, addr, peer_key).await?;
        engine.exchange_public_key().await?;
        let local_root = self.local_root().await;
        engine.exchange_root(local_root).await?;
        tokio::spawn(Arc::clone(&engine).run_keepalive());

        self.peers.insert(name.to_string(), engine);
        *self.current.lock().await = Some(name.to_string());
        Ok(())
    }

    async fn open_session(
        &self,
        addr: SocketAddr,
        peer_key: Option<[u8; PUBKEY_LEN]>,
    ) -> Result<Arc<SessionEngine>> {
        let identity = self.identity().await;
        let tree = self.local_tree.lock().await.clone();
        let engine = SessionEngine::connect(
            addr,
            Some(identity),
            self.config.identity.name.clone(),
            peer_key,
            tree,
            None,
            SessionTiming::from(&self.config.session),
        )
        .await?;
        Arc::clone(&engine).spawn_read_loop();
        Ok(engine)
    }

    /// Drives the Hello step, falling back to NAT traversal through the
    /// directory once (state machine §4.3: `NatFallback` after five
    /// consecutive Hello timeouts). The original socket is permanently
    /// connected to the unreachable address, so a fallback opens a fresh
    /// session toward the address the directory relays and retries Hello on
    /// *that* session, handing the caller back whichever engine ended up
    /// succeeding.
    async fn drive_handshake(
        &self,
        engine: Arc<SessionEngine>,
        original_addr: SocketAddr,
        peer_key: Option<[u8; PUBKEY_LEN]>,
    ) -> Result<Arc<SessionEngine>> {
        match engine.hello().await {
            Ok(()) => Ok(engine),
            Err(SessionError::NatFallbackRequired) => {
                engine.disconnect().await;
                let relayed = self.nat_fallback(original_addr).await?;
                tracing::info!(%relayed, "NAT traversal relayed a new address, opening a fresh session");
                let fresh = self.open_session(relayed, peer_key).await?;
                fresh.hello().await.context("Hello still failed after NAT traversal")?;
                Ok(fresh)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn nat_fallback(&self, stuck_peer: SocketAddr) -> Result<SocketAddr> {
        let directory = self
            .directory_session
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("not registered with a directory, cannot NAT-traverse"))?;
        directory.send_nat_traversal_request(stuck_peer).await?;
        let mut rx = self.nat_rx.lock().await;
        tokio::time::timeout(NAT_RELAY_TIMEOUT, rx.recv())
            .await
            .context("directory did not relay a NAT-traversal address in time")?
            .ok_or_else(|| anyhow!("NAT-traversal channel closed"))
    }

    // ── Disconnect / exit ────────────────────────────────────────────────────

    pub async fn disconnect_current(&self) -> Result<()> {
        let name = self
            .current
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("not connected to a peer"))?;
        self.disconnect(&name).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        if let Some((_, engine)) = self.peers.remove(name) {
            engine.disconnect().await;
        }
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(name) {
            *current = None;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for entry in self.peers.iter() {
            entry.value().disconnect().await;
        }
        self.peers.clear();
        *self.current.lock().await = None;
        if let Some(dir) = self.directory_session.lock().await.take() {
            dir.disconnect().await;
        }
    }

    // ── Download (§4.4) ──────────────────────────────────────────────────────

    pub async fn download(&self, peer: Option<&str>, hash: [u8; HASH_LEN], dest: &Path) -> Result<()> {
        let name = match peer {
            Some(n) => n.to_string(),
            None => self
                .current
                .lock()
                .await
                .clone()
                .ok_or_else(|| anyhow!("not connected to any peer; use connect <name> first"))?,
        };
        let engine = self
            .peers
            .get(&name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| anyhow!("not connected to {name}"))?;
        if engine.state().await != HandshakeState::Established {
            bail!("session with {name} is not Established yet");
        }
        let node = download_node(&engine, hash).await?;
        merkle::write_to_path(&node, dest)?;
        Ok(())
    }
}
