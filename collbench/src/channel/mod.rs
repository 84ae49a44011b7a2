//! Channels: the communication handles the timed loop uses.
//!
//! [`setup_mesh`] registers the benchmark buffers, connects to every peer
//! and exchanges memory handles. A [`ChannelStrategy`] then turns the
//! resulting [`Mesh`] into one channel per peer:
//!
//! - [`IndexedChannels`]: [`SimpleChannel`]s addressed through a
//!   [`ChannelService`] table
//! - [`DirectChannels`]: [`DirectChannel`]s backed by a [`DirectEpoch`]

mod direct;
mod service;

pub use direct::{DirectChannel, DirectEpoch};
pub use service::{ChannelService, ConnectionId, MemoryEntry, MemoryId, SimpleChannel};

use crate::comm::{Communicator, Connection, RegisteredMemory, RemoteMemoryHandle};
use crate::device::DeviceBuffer;
use crate::error::Result;
use crate::topology::RankTopology;
use std::sync::Arc;
use std::time::Duration;

/// Connection tag used by the benchmark mesh.
pub const MESH_TAG: u32 = 0;

/// Connections and exchanged memories, one entry per peer in increasing
/// rank order.
pub struct Mesh {
    pub connections: Vec<Arc<Connection>>,
    pub remote_memories: Vec<RemoteMemoryHandle>,
    pub input: RegisteredMemory,
    /// `None` for in-place runs.
    pub output: Option<RegisteredMemory>,
}

impl Mesh {
    /// The buffer peers write into.
    pub fn target(&self) -> &RegisteredMemory {
        self.output.as_ref().unwrap_or(&self.input)
    }
}

/// Register `input` (and `output`, when out-of-place) and connect to every
/// peer. Collective.
///
/// Each peer receives the handle of the buffer it should write into: the
/// output buffer when there is one, the input otherwise.
pub async fn setup_mesh(
    comm: &Communicator,
    topology: &RankTopology,
    input: &DeviceBuffer,
    output: Option<&DeviceBuffer>,
) -> Result<Mesh> {
    let transports = topology.registration_transports();
    let input = comm.register_memory(input, transports)?;
    let output = match output {
        Some(buf) if !buf.same_allocation(input.data()) => {
            Some(comm.register_memory(buf, transports)?)
        }
        _ => None,
    };
    let target = output.as_ref().unwrap_or(&input);

    let mut connections = Vec::new();
    let mut remote_memories = Vec::new();
    for peer in (0..topology.world_size()).filter(|r| *r != topology.rank()) {
        connections.push(comm.connect(peer, MESH_TAG, topology.classify(peer))?);
        remote_memories.push(comm.exchange_memory(peer, MESH_TAG, target)?);
    }

    comm.finalize_setup().await?;

    Ok(Mesh {
        connections,
        remote_memories,
        input,
        output,
    })
}

/// Turns a finished mesh into per-peer channels.
pub trait ChannelStrategy {
    type Channel;

    fn build(&self, mesh: &Mesh) -> Result<Vec<Self::Channel>>;
}

/// Builds [`SimpleChannel`]s, registering everything in `service`.
pub struct IndexedChannels {
    pub service: Arc<ChannelService>,
}

impl ChannelStrategy for IndexedChannels {
    type Channel = SimpleChannel;

    fn build(&self, mesh: &Mesh) -> Result<Vec<SimpleChannel>> {
        let local = self
            .service
            .add_memory(MemoryEntry::Local(mesh.input.clone()))?;
        mesh.connections
            .iter()
            .zip(&mesh.remote_memories)
            .map(|(conn, remote)| {
                let cid = self.service.add_connection(Arc::clone(conn))?;
                let rid = self
                    .service
                    .add_memory(MemoryEntry::Remote(remote.get()?.clone()))?;
                self.service.channel(cid, rid, local)
            })
            .collect()
    }
}

/// Builds [`DirectChannel`]s over the mesh's raw buffers.
pub struct DirectChannels {
    pub wait_timeout: Duration,
}

impl ChannelStrategy for DirectChannels {
    type Channel = DirectChannel;

    fn build(&self, mesh: &Mesh) -> Result<Vec<DirectChannel>> {
        mesh.connections
            .iter()
            .zip(&mesh.remote_memories)
            .map(|(conn, remote)| {
                DirectChannel::new(
                    DirectEpoch::new(Arc::clone(conn), self.wait_timeout),
                    remote.get()?.clone(),
                    mesh.input.data().clone(),
                    mesh.output.as_ref().map(|m| m.data().clone()),
                )
            })
            .collect()
    }
}
