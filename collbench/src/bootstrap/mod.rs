//! Process group: rendezvous through a seed, then a full QUIC mesh.
//!
//! [`UniqueId::create`] starts the seed and yields the id every process
//! passes to [`Bootstrap::initialize`]. Once initialized, a [`Bootstrap`]
//! offers `barrier`, `broadcast`, `gather` and `all_gather` over raw bytes,
//! plus the setup lane used by the registrar.

mod collectives;
mod local;

pub use local::{bootstrap_local, bootstrap_local_with_hosts};

use crate::cluster::{JoinRequest, SeedNode, WorkerNode};
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::protocol::codec::{encode_message, read_framed};
use crate::protocol::{BenchMessage, PeerEntry};
use crate::topology::HostLayout;
use crate::transport::{PeerConnection, PeerRouter, ProxyState, TransportListener};
use crate::types::{Priority, Rank};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rendezvous address shared by all processes of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueId {
    seed: SocketAddr,
}

impl UniqueId {
    /// Start a seed on `bind` for `world_size` workers.
    ///
    /// Only one process (or a launcher) calls this; the id is then handed to
    /// every process, e.g. through a command-line flag.
    pub fn create(
        bind: SocketAddr,
        world_size: u32,
        config: &BenchConfig,
    ) -> Result<(Self, SeedService)> {
        let service = SeedService::start(bind, world_size, config)?;
        Ok((service.id(), service))
    }

    pub fn from_addr(seed: SocketAddr) -> Self {
        Self { seed }
    }

    pub fn seed_addr(&self) -> SocketAddr {
        self.seed
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.seed)
    }
}

impl std::str::FromStr for UniqueId {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Self::from_addr)
            .map_err(|e| BenchError::Config(format!("invalid seed address {s:?}: {e}")))
    }
}

/// A seed node running in the background.
pub struct SeedService {
    id: UniqueId,
    handle: tokio::task::JoinHandle<Result<Vec<PeerEntry>>>,
}

impl SeedService {
    pub fn start(bind: SocketAddr, world_size: u32, config: &BenchConfig) -> Result<Self> {
        if world_size == 0 {
            return Err(BenchError::Config("world size must be at least 1".into()));
        }
        let seed = SeedNode::bind(bind, world_size)?
            .with_formation_timeout(config.setup_timeout)
            .with_cluster_token(config.cluster_token.clone());
        let id = UniqueId::from_addr(seed.local_addr());
        let handle = tokio::spawn(async move { seed.form_cluster().await });
        Ok(Self { id, handle })
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    /// Wait for formation to finish and return the distributed peer table.
    pub async fn join(self) -> Result<Vec<PeerEntry>> {
        self.handle
            .await
            .map_err(|e| BenchError::transport(format!("seed task panicked: {e}")))?
    }
}

/// Per-process options for [`Bootstrap::initialize`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Explicit rank; `None` lets the seed assign one in join order.
    pub rank: Option<Rank>,
    pub world_size: u32,
    /// Overrides the machine hostname used for node grouping.
    pub hostname: Option<String>,
    /// Address of this process's mesh listener.
    pub bind_addr: SocketAddr,
}

impl InitOptions {
    pub fn new(world_size: u32) -> Self {
        Self {
            rank: None,
            world_size,
            hostname: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

/// An initialized member of the process group.
///
/// Holds one [`PeerConnection`] (send side) and one [`PeerRouter`]
/// (receive side) per peer, plus the [`ProxyState`] the routers apply
/// channel traffic to.
pub struct Bootstrap {
    rank: Rank,
    world_size: u32,
    hosts: Vec<String>,
    layout: HostLayout,
    peers: HashMap<Rank, Arc<PeerConnection>>,
    routers: HashMap<Rank, PeerRouter>,
    _router_handles: Vec<tokio::task::JoinHandle<Result<()>>>,
    _listener: TransportListener,
    proxy: Arc<ProxyState>,
    barrier_epoch: AtomicU64,
    collective_timeout: Duration,
    setup_timeout: Duration,
}

impl Bootstrap {
    /// Join the run identified by `id` and connect to every peer.
    pub async fn initialize(id: UniqueId, options: InitOptions, config: &BenchConfig) -> Result<Self> {
        if let Some(rank) = options.rank {
            if rank >= options.world_size {
                return Err(BenchError::InvalidRank {
                    rank,
                    world_size: options.world_size,
                });
            }
        }

        let listener = TransportListener::bind(options.bind_addr)?;
        let hostname = options
            .hostname
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        let request = JoinRequest {
            requested_rank: options.rank,
            hostname,
            cluster_token: config.cluster_token.clone(),
        };

        let worker = tokio::time::timeout(
            config.setup_timeout,
            WorkerNode::join(&listener, id.seed_addr(), request),
        )
        .await
        .map_err(|_| BenchError::SetupTimeout {
            rank: options.rank.unwrap_or(0),
            timeout_ms: config.setup_timeout.as_millis() as u64,
        })??;

        if worker.world_size != options.world_size {
            return Err(BenchError::Config(format!(
                "seed formed a world of {} ranks, expected {}",
                worker.world_size, options.world_size
            )));
        }

        let conns = tokio::time::timeout(config.setup_timeout, build_mesh(&listener, &worker))
            .await
            .map_err(|_| BenchError::SetupTimeout {
                rank: worker.rank,
                timeout_ms: config.setup_timeout.as_millis() as u64,
            })??;

        let hosts: Vec<String> = worker.peers.iter().map(|p| p.hostname.clone()).collect();
        let layout = HostLayout::from_hosts(&hosts, worker.rank)?;

        let proxy = ProxyState::new(worker.rank);
        let mut peers = HashMap::new();
        let mut routers = HashMap::new();
        let mut handles = Vec::new();
        for (peer_rank, conn) in conns {
            let (router, handle) = PeerRouter::spawn(peer_rank, conn.clone(), Arc::clone(&proxy));
            peers.insert(peer_rank, Arc::new(PeerConnection::new(peer_rank, conn)));
            routers.insert(peer_rank, router);
            handles.push(handle);
        }

        tracing::info!(
            rank = worker.rank,
            world_size = worker.world_size,
            ranks_per_node = layout.ranks_per_node,
            "process group initialized"
        );

        Ok(Self {
            rank: worker.rank,
            world_size: worker.world_size,
            hosts,
            layout,
            peers,
            routers,
            _router_handles: handles,
            _listener: listener,
            proxy,
            barrier_epoch: AtomicU64::new(0),
            collective_timeout: config.collective_timeout,
            setup_timeout: config.setup_timeout,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn ranks_per_node(&self) -> u32 {
        self.layout.ranks_per_node
    }

    pub fn local_rank(&self) -> u32 {
        self.layout.local_rank
    }

    pub fn num_nodes(&self) -> u32 {
        self.layout.num_nodes
    }

    /// Hostname this process joined with.
    pub fn hostname(&self) -> &str {
        &self.hosts[self.rank as usize]
    }

    pub fn collective_timeout(&self) -> Duration {
        self.collective_timeout
    }

    pub fn setup_timeout(&self) -> Duration {
        self.setup_timeout
    }

    /// Send side of the link to `rank`.
    pub fn peer(&self, rank: Rank) -> Result<&Arc<PeerConnection>> {
        self.peers.get(&rank).ok_or(BenchError::UnknownPeer { rank })
    }

    pub fn proxy(&self) -> &Arc<ProxyState> {
        &self.proxy
    }

    pub(crate) fn next_barrier_epoch(&self) -> u64 {
        self.barrier_epoch.fetch_add(1, Ordering::Relaxed)
    }

    fn router(&self, src: Rank) -> Result<&PeerRouter> {
        self.routers
            .get(&src)
            .ok_or(BenchError::UnknownPeer { rank: src })
    }

    pub(crate) async fn recv_control(&self, src: Rank) -> Result<BenchMessage> {
        self.router(src)?.recv_control(src).await
    }

    /// Next `Connect`/`Memory` message from `src`.
    pub async fn recv_setup(&self, src: Rank) -> Result<BenchMessage> {
        self.router(src)?.recv_setup(src).await
    }

    pub(crate) async fn recv_raw(&self, src: Rank) -> Result<Vec<u8>> {
        self.router(src)?.recv_raw(src).await
    }

    /// Send a setup message to `dst` on the framed lane.
    pub async fn send_setup(&self, dst: Rank, msg: &BenchMessage) -> Result<()> {
        self.peer(dst)?.send_message(msg, Priority::Realtime).await
    }
}

/// Connect to every peer: dial higher ranks, accept lower ranks.
///
/// The dialing side opens a bidirectional stream and announces itself with
/// `MeshHello`, since accepted connections carry no rank.
async fn build_mesh(
    listener: &TransportListener,
    worker: &WorkerNode,
) -> Result<Vec<(Rank, quinn::Connection)>> {
    let me = worker.rank;

    let dial = futures::future::try_join_all(
        worker
            .peers
            .iter()
            .filter(|p| p.rank > me)
            .map(|p| dial_peer(listener, me, p)),
    );
    let accept = async {
        let mut accepted = Vec::with_capacity(me as usize);
        for _ in 0..me {
            accepted.push(accept_peer(listener, worker.world_size).await?);
        }
        Ok::<_, BenchError>(accepted)
    };

    let (mut dialed, accepted) = tokio::try_join!(dial, accept)?;
    dialed.extend(accepted);

    let mut seen: Vec<Rank> = dialed.iter().map(|(r, _)| *r).collect();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != dialed.len() {
        return Err(BenchError::transport("duplicate mesh connection"));
    }
    Ok(dialed)
}

async fn dial_peer(
    listener: &TransportListener,
    me: Rank,
    peer: &PeerEntry,
) -> Result<(Rank, quinn::Connection)> {
    let addr: SocketAddr = peer.addr.parse().map_err(|e| BenchError::ConnectionFailed {
        rank: peer.rank,
        reason: format!("bad mesh address {:?}: {e}", peer.addr),
    })?;
    let conn = listener
        .connect(addr)
        .await
        .map_err(|e| BenchError::ConnectionFailed {
            rank: peer.rank,
            reason: e.to_string(),
        })?;

    let (mut send, _recv) = conn
        .open_bi()
        .await
        .map_err(|e| BenchError::transport_with_source("open mesh hello stream", e))?;
    let buf = encode_message(&BenchMessage::MeshHello { rank: me }, Priority::Critical)?;
    send.write_all(&buf)
        .await
        .map_err(|e| BenchError::transport_with_source("send mesh hello", e))?;
    send.finish()
        .map_err(|e| BenchError::transport_with_source("finish mesh hello", e))?;

    tracing::debug!(rank = me, peer = peer.rank, "mesh link dialed");
    Ok((peer.rank, conn))
}

async fn accept_peer(listener: &TransportListener, world_size: u32) -> Result<(Rank, quinn::Connection)> {
    let conn = listener.accept().await?;
    let (_send, mut recv) = conn
        .accept_bi()
        .await
        .map_err(|e| BenchError::transport_with_source("accept mesh hello stream", e))?;
    match read_framed(&mut recv, "mesh hello").await? {
        BenchMessage::MeshHello { rank } if rank < world_size => Ok((rank, conn)),
        BenchMessage::MeshHello { rank } => Err(BenchError::InvalidRank { rank, world_size }),
        other => Err(BenchError::DecodeFailed(format!(
            "expected MeshHello, got {other:?}"
        ))),
    }
}
