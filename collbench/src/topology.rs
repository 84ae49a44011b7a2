//! Where each rank sits and how it reaches its peers.
//!
//! [`HostLayout`] groups the bootstrap peer table by hostname to find how
//! many ranks share a node. [`RankTopology`] then turns `(rank, peer)` into a
//! [`Transport`] with a pure function, so both ends of every link agree.

use crate::error::{BenchError, Result};
use crate::types::{NodeId, Rank, Transport, TransportSet};

/// Immutable placement of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankTopology {
    rank: Rank,
    world_size: u32,
    ranks_per_node: u32,
    device: usize,
    fabric: Transport,
}

impl RankTopology {
    /// Validate the placement and derive the remote interface from `device`.
    pub fn new(rank: Rank, world_size: u32, ranks_per_node: u32, device: usize) -> Result<Self> {
        if ranks_per_node == 0 {
            return Err(BenchError::Config("ranks per node must be at least 1".into()));
        }
        if rank >= world_size {
            return Err(BenchError::InvalidRank { rank, world_size });
        }
        let fabric = Transport::fabric(device)?;
        Ok(Self {
            rank,
            world_size,
            ranks_per_node,
            device,
            fabric,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn ranks_per_node(&self) -> u32 {
        self.ranks_per_node
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn node_of(&self, rank: Rank) -> NodeId {
        rank / self.ranks_per_node
    }

    pub fn this_node(&self) -> NodeId {
        self.node_of(self.rank)
    }

    /// Transport used to reach `peer`: the local fast path when it shares
    /// this rank's node, otherwise this rank's fabric interface.
    pub fn classify(&self, peer: Rank) -> Transport {
        if self.node_of(peer) == self.this_node() {
            Transport::LocalFastPath
        } else {
            self.fabric
        }
    }

    /// Every transport a benchmark buffer must accept writes over.
    pub fn registration_transports(&self) -> TransportSet {
        Transport::LocalFastPath | self.fabric
    }
}

/// Ranks grouped by the host they run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub ranks_per_node: u32,
    pub local_rank: u32,
    pub num_nodes: u32,
}

impl HostLayout {
    /// Derive the layout from `hosts[r]` = hostname of rank `r`.
    ///
    /// Every host must carry the same number of ranks. A layout whose hosts
    /// are not contiguous rank blocks is accepted with a warning, since node
    /// ids are computed as `rank / ranks_per_node`.
    pub fn from_hosts(hosts: &[String], rank: Rank) -> Result<Self> {
        let own = hosts
            .get(rank as usize)
            .ok_or(BenchError::InvalidRank {
                rank,
                world_size: hosts.len() as u32,
            })?;

        // Unique hostnames in order of first appearance, with rank counts.
        let mut seen: indexmap::IndexMap<&str, u32> = indexmap::IndexMap::new();
        for host in hosts {
            *seen.entry(host.as_str()).or_default() += 1;
        }

        let ranks_per_node = seen.get(own.as_str()).copied().unwrap_or(1);
        if let Some((host, count)) = seen.iter().find(|(_, c)| **c != ranks_per_node) {
            return Err(BenchError::Config(format!(
                "non-uniform layout: host {host} runs {count} ranks, host {own} runs {ranks_per_node}"
            )));
        }

        let contiguous = hosts
            .chunks(ranks_per_node as usize)
            .all(|block| block.iter().all(|h| h == &block[0]));
        if !contiguous {
            tracing::warn!(
                rank,
                ranks_per_node,
                "ranks are not grouped by host in contiguous blocks; node ids follow rank order"
            );
        }

        Ok(Self {
            ranks_per_node,
            local_rank: rank % ranks_per_node,
            num_nodes: seen.len() as u32,
        })
    }
}
