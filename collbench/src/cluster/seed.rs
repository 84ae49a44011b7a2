use crate::error::{BenchError, Result};
use crate::protocol::codec::{encode_message, read_framed};
use crate::protocol::{BenchMessage, PeerEntry};
use crate::transport::TransportListener;
use crate::types::{PROTOCOL_VERSION, Priority, Rank};
use std::net::SocketAddr;
use std::time::Duration;

/// The seed node orchestrates cluster formation.
///
/// It listens for workers, checks their handshake, assigns ranks (honouring
/// requested ranks) and hands every worker the full peer table. The seed is
/// not a member of the benchmark; it exits once every worker has its table.
pub struct SeedNode {
    listener: TransportListener,
    expected_world_size: u32,
    formation_timeout: Duration,
    cluster_token: Vec<u8>,
}

struct Joiner {
    requested_rank: Option<Rank>,
    mesh_addr: SocketAddr,
    hostname: String,
    conn: quinn::Connection,
    send: quinn::SendStream,
}

impl SeedNode {
    pub fn bind(addr: SocketAddr, expected_world_size: u32) -> Result<Self> {
        let listener = TransportListener::bind(addr)?;
        Ok(Self {
            listener,
            expected_world_size,
            formation_timeout: Duration::from_secs(60),
            cluster_token: Vec::new(),
        })
    }

    pub fn with_formation_timeout(mut self, timeout: Duration) -> Self {
        self.formation_timeout = timeout;
        self
    }

    /// Require workers to present `token` in their `Hello`.
    pub fn with_cluster_token(mut self, token: Vec<u8>) -> Self {
        self.cluster_token = token;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Wait for all expected workers, then send each its `Welcome`.
    ///
    /// Returns the peer table once every worker has read its `Welcome` and
    /// closed the bootstrap connection.
    pub async fn form_cluster(&self) -> Result<Vec<PeerEntry>> {
        let deadline = tokio::time::Instant::now() + self.formation_timeout;
        let mut joiners: Vec<Joiner> = Vec::new();

        while (joiners.len() as u32) < self.expected_world_size {
            let conn = tokio::select! {
                result = self.listener.accept() => result?,
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(BenchError::ClusterFormationTimeout {
                        joined: joiners.len() as u32,
                        expected: self.expected_world_size,
                    });
                }
            };
            let joiner = self.handshake(conn).await?;
            tracing::info!(
                requested = ?joiner.requested_rank,
                host = %joiner.hostname,
                "worker joined: total={}/{}",
                joiners.len() + 1,
                self.expected_world_size
            );
            joiners.push(joiner);
        }

        let requests: Vec<Option<Rank>> = joiners.iter().map(|j| j.requested_rank).collect();
        let ranks = assign_ranks(&requests, self.expected_world_size)?;

        let mut peers: Vec<PeerEntry> = joiners
            .iter()
            .zip(&ranks)
            .map(|(j, &rank)| PeerEntry {
                rank,
                addr: j.mesh_addr.to_string(),
                hostname: j.hostname.clone(),
            })
            .collect();
        peers.sort_by_key(|p| p.rank);

        let mut conns = Vec::with_capacity(joiners.len());
        for (joiner, rank) in joiners.into_iter().zip(ranks) {
            let Joiner { conn, mut send, .. } = joiner;
            let welcome = BenchMessage::Welcome {
                rank,
                world_size: self.expected_world_size,
                peers: peers.clone(),
            };
            let buf = encode_message(&welcome, Priority::Critical)?;
            send.write_all(&buf).await.map_err(|e| {
                BenchError::transport_with_source(format!("send welcome to rank {rank}"), e)
            })?;
            send.finish()
                .map_err(|e| BenchError::transport_with_source("finish welcome stream", e))?;
            conns.push(conn);
        }

        // Workers close the bootstrap link after reading their Welcome.
        for conn in conns {
            tokio::select! {
                _ = conn.closed() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("seed: worker did not acknowledge Welcome before the deadline");
                }
            }
        }

        Ok(peers)
    }

    async fn handshake(&self, conn: quinn::Connection) -> Result<Joiner> {
        let (send, mut recv) = conn
            .accept_bi()
            .await
            .map_err(|e| BenchError::transport_with_source("accept bi from new worker", e))?;

        match read_framed(&mut recv, "hello").await? {
            BenchMessage::Hello {
                protocol_version,
                requested_rank,
                mesh_port,
                hostname,
                cluster_token,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(BenchError::ProtocolMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if cluster_token != self.cluster_token {
                    return Err(BenchError::ClusterTokenMismatch);
                }
                let mesh_addr = SocketAddr::new(conn.remote_address().ip(), mesh_port);
                Ok(Joiner {
                    requested_rank,
                    mesh_addr,
                    hostname,
                    conn,
                    send,
                })
            }
            other => Err(BenchError::DecodeFailed(format!(
                "expected Hello, got {other:?}"
            ))),
        }
    }
}

/// Give every joiner a rank: requested ranks first, then the lowest free
/// ranks in join order.
pub(crate) fn assign_ranks(requests: &[Option<Rank>], world_size: u32) -> Result<Vec<Rank>> {
    let mut taken = vec![false; world_size as usize];
    for &rank in requests.iter().flatten() {
        let slot = taken
            .get_mut(rank as usize)
            .ok_or(BenchError::InvalidRank { rank, world_size })?;
        if *slot {
            return Err(BenchError::Config(format!(
                "rank {rank} requested by more than one worker"
            )));
        }
        *slot = true;
    }

    let mut free = (0..world_size).filter(|r| !taken[*r as usize]);
    requests
        .iter()
        .map(|req| match req {
            Some(rank) => Ok(*rank),
            None => free.next().ok_or_else(|| {
                BenchError::Config(format!("more workers than world size {world_size}"))
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let seed = SeedNode::bind(addr, 2).unwrap();
        assert_ne!(seed.local_addr().port(), 0);
    }

    #[test]
    fn test_assign_ranks_in_join_order() {
        assert_eq!(assign_ranks(&[None, None, None], 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_assign_ranks_honours_requests() {
        let ranks = assign_ranks(&[None, Some(0), None, Some(3)], 4).unwrap();
        assert_eq!(ranks, vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_assign_ranks_rejects_conflicts() {
        assert!(assign_ranks(&[Some(1), Some(1)], 2).is_err());
        assert!(matches!(
            assign_ranks(&[Some(5)], 2),
            Err(BenchError::InvalidRank { rank: 5, .. })
        ));
    }
}
