use crate::error::{BenchError, Result};
use crate::protocol::codec::{encode_message, read_framed};
use crate::protocol::{BenchMessage, PeerEntry};
use crate::transport::TransportListener;
use crate::types::{PROTOCOL_VERSION, Priority, Rank};
use std::net::SocketAddr;

/// What a worker asks of the seed when it joins.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// Explicit rank, e.g. from a launcher's `RANK` variable.
    pub requested_rank: Option<Rank>,
    pub hostname: String,
    pub cluster_token: Vec<u8>,
}

/// Result of connecting to the seed node and completing the handshake.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub rank: Rank,
    pub world_size: u32,
    /// Every member of the cluster, sorted by rank.
    pub peers: Vec<PeerEntry>,
}

impl WorkerNode {
    /// Join the cluster through the seed at `seed_addr`.
    ///
    /// The worker dials from `listener`'s endpoint and advertises the
    /// listener's port as its mesh address, so peers can reach it once the
    /// seed distributes the table.
    pub async fn join(
        listener: &TransportListener,
        seed_addr: SocketAddr,
        request: JoinRequest,
    ) -> Result<Self> {
        let conn = listener
            .connect(seed_addr)
            .await
            .map_err(|e| BenchError::ConnectionFailed {
                rank: request.requested_rank.unwrap_or(0),
                reason: format!("seed at {seed_addr}: {e}"),
            })?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| BenchError::transport_with_source("open bi to seed", e))?;

        let hello = BenchMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            requested_rank: request.requested_rank,
            mesh_port: listener.local_addr().port(),
            hostname: request.hostname,
            cluster_token: request.cluster_token,
        };
        let buf = encode_message(&hello, Priority::Critical)?;
        send.write_all(&buf)
            .await
            .map_err(|e| BenchError::transport_with_source("send hello", e))?;

        let welcome = read_framed(&mut recv, "welcome").await?;
        // Tells the seed the table arrived.
        conn.close(0u32.into(), b"joined");

        match welcome {
            BenchMessage::Welcome {
                rank,
                world_size,
                peers,
            } => {
                if rank >= world_size {
                    return Err(BenchError::InvalidRank { rank, world_size });
                }
                if peers.len() != world_size as usize {
                    return Err(BenchError::DecodeFailed(format!(
                        "welcome lists {} peers for world size {world_size}",
                        peers.len()
                    )));
                }
                tracing::debug!(rank, world_size, "joined cluster");
                Ok(Self {
                    rank,
                    world_size,
                    peers,
                })
            }
            other => Err(BenchError::DecodeFailed(format!(
                "expected Welcome, got {other:?}"
            ))),
        }
    }

    /// This worker's entry in the peer table.
    pub fn entry(&self, rank: Rank) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.rank == rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SeedNode;
    use std::time::Duration;

    fn request(rank: Option<Rank>, host: &str) -> JoinRequest {
        JoinRequest {
            requested_rank: rank,
            hostname: host.into(),
            cluster_token: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_worker_formation() {
        let seed = SeedNode::bind("127.0.0.1:0".parse().unwrap(), 2).unwrap();
        let seed_addr = seed.local_addr();
        let seed_task = tokio::spawn(async move { seed.form_cluster().await });

        let l0 = TransportListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let l1 = TransportListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let (w0, w1) = tokio::try_join!(
            WorkerNode::join(&l0, seed_addr, request(Some(1), "node-a")),
            WorkerNode::join(&l1, seed_addr, request(None, "node-b")),
        )
        .unwrap();

        assert_eq!(w0.rank, 1);
        assert_eq!(w1.rank, 0);
        assert_eq!(w0.world_size, 2);
        assert_eq!(w0.peers, w1.peers);
        assert_eq!(w1.entry(1).unwrap().hostname, "node-a");
        assert_eq!(
            w0.entry(1).unwrap().addr,
            l0.local_addr().to_string()
        );

        let peers = seed_task.await.unwrap().unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn test_seed_times_out_on_missing_workers() {
        let seed = SeedNode::bind("127.0.0.1:0".parse().unwrap(), 3)
            .unwrap()
            .with_formation_timeout(Duration::from_millis(200));
        let err = seed.form_cluster().await.unwrap_err();
        assert!(matches!(
            err,
            BenchError::ClusterFormationTimeout {
                joined: 0,
                expected: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_seed_rejects_wrong_token() {
        let seed = SeedNode::bind("127.0.0.1:0".parse().unwrap(), 1)
            .unwrap()
            .with_cluster_token(b"right".to_vec());
        let seed_addr = seed.local_addr();
        let seed_task = tokio::spawn(async move { seed.form_cluster().await });

        let listener = TransportListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut req = request(None, "node-a");
        req.cluster_token = b"wrong".to_vec();
        let joined = tokio::time::timeout(
            Duration::from_secs(5),
            WorkerNode::join(&listener, seed_addr, req),
        )
        .await;

        assert!(matches!(
            seed_task.await.unwrap(),
            Err(BenchError::ClusterTokenMismatch)
        ));
        assert!(!matches!(joined, Ok(Ok(_))));
    }
}
