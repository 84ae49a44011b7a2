use crate::protocol::header::MessageType;
use crate::types::Rank;

/// One row of the peer table the seed hands out.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub rank: Rank,
    /// Address of the peer's mesh listener.
    pub addr: String,
    /// Host the peer runs on; ranks sharing it form one node.
    pub hostname: String,
}

/// Wire form of a registered memory region, as seen by a peer.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub id: u64,
    pub owner: Rank,
    pub base: u64,
    pub len: u64,
    /// Bit set of transport codes the region accepts writes over.
    pub transports: u16,
}

/// Control messages exchanged between benchmark processes.
///
/// Benchmark payloads never flow through this enum: channel puts and signals
/// use a dedicated ordered stream with a fixed binary frame.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum BenchMessage {
    /// Worker to seed: join request.
    Hello {
        protocol_version: u16,
        requested_rank: Option<Rank>,
        /// Port of the worker's mesh listener.
        mesh_port: u16,
        hostname: String,
        cluster_token: Vec<u8>,
    },

    /// Seed to worker: rank assignment and the full peer table.
    Welcome {
        rank: Rank,
        world_size: u32,
        peers: Vec<PeerEntry>,
    },

    /// First message on every mesh connection, from the dialing side.
    MeshHello { rank: Rank },

    Barrier { epoch: u64 },

    BarrierAck { epoch: u64 },

    /// Announces the transport this side chose for connection `tag`.
    Connect { tag: u32, transport: u8 },

    /// Publishes a registered memory region under `tag`.
    Memory {
        tag: u32,
        descriptor: MemoryDescriptor,
    },
}

impl BenchMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            BenchMessage::Hello { .. }
            | BenchMessage::Welcome { .. }
            | BenchMessage::MeshHello { .. } => MessageType::Bootstrap,
            BenchMessage::Barrier { .. } | BenchMessage::BarrierAck { .. } => {
                MessageType::Control
            }
            BenchMessage::Connect { .. } | BenchMessage::Memory { .. } => MessageType::Setup,
        }
    }
}
