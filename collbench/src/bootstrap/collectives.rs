use super::Bootstrap;
use crate::error::{BenchError, Result};
use crate::protocol::BenchMessage;
use crate::types::{Priority, Rank};
use std::time::Duration;

/// Threshold: use two-phase barrier for small worlds, dissemination for larger.
const DISSEMINATION_THRESHOLD: u32 = 5;

fn failed(operation: &'static str, rank: Rank, reason: impl Into<String>) -> BenchError {
    BenchError::CollectiveFailed {
        operation,
        rank,
        reason: reason.into(),
    }
}

async fn bounded<T>(
    operation: &'static str,
    rank: Rank,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| {
            failed(
                operation,
                rank,
                format!("timed out after {}ms", timeout.as_millis()),
            )
        })?
        .map_err(|e| failed(operation, rank, e.to_string()))
}

impl Bootstrap {
    /// Block until every rank reaches this point.
    ///
    /// Two-phase through rank 0 for small worlds, dissemination otherwise.
    pub async fn barrier(&self) -> Result<()> {
        let world = self.world_size();
        if world <= 1 {
            return Ok(());
        }
        if world < DISSEMINATION_THRESHOLD {
            self.two_phase_barrier().await
        } else {
            self.dissemination_barrier().await
        }
    }

    async fn two_phase_barrier(&self) -> Result<()> {
        let epoch = self.next_barrier_epoch();
        let timeout = self.collective_timeout();

        if self.rank() == 0 {
            for r in 1..self.world_size() {
                match bounded("barrier", r, timeout, self.recv_control(r)).await? {
                    BenchMessage::Barrier { epoch: e } if e == epoch => {}
                    other => {
                        return Err(failed(
                            "barrier",
                            r,
                            format!("expected Barrier(epoch={epoch}), got {other:?}"),
                        ));
                    }
                }
            }
            let ack = BenchMessage::BarrierAck { epoch };
            for r in 1..self.world_size() {
                self.peer(r)?
                    .send_message(&ack, Priority::Critical)
                    .await
                    .map_err(|e| failed("barrier", r, e.to_string()))?;
            }
        } else {
            self.peer(0)?
                .send_message(&BenchMessage::Barrier { epoch }, Priority::Critical)
                .await
                .map_err(|e| failed("barrier", 0, e.to_string()))?;
            match bounded("barrier", 0, timeout, self.recv_control(0)).await? {
                BenchMessage::BarrierAck { epoch: e } if e == epoch => {}
                other => {
                    return Err(failed(
                        "barrier",
                        0,
                        format!("expected BarrierAck(epoch={epoch}), got {other:?}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// In round `k`, rank `i` signals `(i + 2^k) % N` and hears from
    /// `(i - 2^k) % N`.
    async fn dissemination_barrier(&self) -> Result<()> {
        let epoch = self.next_barrier_epoch();
        let rank = self.rank();
        let world = self.world_size();
        let timeout = self.collective_timeout();
        let rounds = u32::BITS - (world - 1).leading_zeros();

        for round in 0..rounds {
            let distance = 1u32 << round;
            let send_to = (rank + distance) % world;
            let recv_from = (rank + world - distance) % world;
            let msg = BenchMessage::Barrier { epoch };

            let send = async {
                self.peer(send_to)?
                    .send_message(&msg, Priority::Critical)
                    .await
                    .map_err(|e| failed("barrier", send_to, e.to_string()))
            };
            let recv = async {
                match bounded("barrier", recv_from, timeout, self.recv_control(recv_from)).await? {
                    BenchMessage::Barrier { epoch: e } if e == epoch => Ok(()),
                    other => Err(failed(
                        "barrier",
                        recv_from,
                        format!("expected Barrier(epoch={epoch}) in round {round}, got {other:?}"),
                    )),
                }
            };
            tokio::try_join!(send, recv)?;
        }
        Ok(())
    }

    /// Send `data` to `dst` on the raw lane.
    pub async fn send_bytes(&self, dst: Rank, data: &[u8]) -> Result<()> {
        self.peer(dst)?
            .send_raw(data)
            .await
            .map_err(|e| failed("send", dst, e.to_string()))
    }

    /// Next raw payload from `src`.
    pub async fn recv_bytes(&self, src: Rank) -> Result<Vec<u8>> {
        bounded("recv", src, self.collective_timeout(), self.recv_raw(src)).await
    }

    /// Every rank returns `root`'s `data`; non-root ranks' `data` is ignored.
    pub async fn broadcast_bytes(&self, root: Rank, data: &[u8]) -> Result<Vec<u8>> {
        if root >= self.world_size() {
            return Err(BenchError::InvalidRank {
                rank: root,
                world_size: self.world_size(),
            });
        }
        if self.rank() == root {
            let sends = (0..self.world_size())
                .filter(|r| *r != root)
                .map(|r| self.send_bytes(r, data));
            futures::future::try_join_all(sends).await?;
            Ok(data.to_vec())
        } else {
            self.recv_bytes(root).await
        }
    }

    /// Contribution of every rank, indexed by rank.
    pub async fn all_gather_bytes(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let me = self.rank();
        let world = self.world_size();

        let sends = (0..world)
            .filter(|r| *r != me)
            .map(|r| self.send_bytes(r, data));
        let recvs = (0..world).map(|r| async move {
            if r == me {
                Ok(data.to_vec())
            } else {
                self.recv_bytes(r).await
            }
        });
        let (_, gathered) = tokio::try_join!(
            futures::future::try_join_all(sends),
            futures::future::try_join_all(recvs),
        )?;
        Ok(gathered)
    }

    /// Contributions of every rank on `root` (indexed by rank), `None` elsewhere.
    pub async fn gather_bytes(&self, root: Rank, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if root >= self.world_size() {
            return Err(BenchError::InvalidRank {
                rank: root,
                world_size: self.world_size(),
            });
        }
        if self.rank() != root {
            self.send_bytes(root, data).await?;
            return Ok(None);
        }
        let recvs = (0..self.world_size()).map(|r| async move {
            if r == root {
                Ok(data.to_vec())
            } else {
                self.recv_bytes(r).await
            }
        });
        Ok(Some(futures::future::try_join_all(recvs).await?))
    }
}
