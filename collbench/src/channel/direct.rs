use crate::comm::{Connection, RemoteMemory};
use crate::device::DeviceBuffer;
use crate::error::{BenchError, Result};
use crate::types::Rank;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Signal bookkeeping for one connection: the peer's counter is bumped by
/// `signal`, the local one is awaited by `wait`.
pub struct DirectEpoch {
    connection: Arc<Connection>,
    expected: AtomicU64,
    timeout: Duration,
}

impl DirectEpoch {
    pub fn new(connection: Arc<Connection>, timeout: Duration) -> Self {
        let expected = AtomicU64::new(connection.inbound().value());
        Self {
            connection,
            expected,
            timeout,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn signal(&self) -> Result<()> {
        self.connection.signal().await
    }

    pub async fn wait(&self) -> Result<()> {
        let target = self.expected.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::time::timeout(self.timeout, self.connection.inbound().wait_for(target))
            .await
            .map_err(|_| BenchError::CollectiveFailed {
                operation: "epoch wait",
                rank: self.connection.peer(),
                reason: format!(
                    "signal {target} not received after {}ms",
                    self.timeout.as_millis()
                ),
            })?
    }
}

/// Peer-to-peer channel: an epoch, the peer's memory and raw local buffers.
pub struct DirectChannel {
    epoch: DirectEpoch,
    remote: RemoteMemory,
    input: DeviceBuffer,
    output: Option<DeviceBuffer>,
}

impl DirectChannel {
    pub fn new(
        epoch: DirectEpoch,
        remote: RemoteMemory,
        input: DeviceBuffer,
        output: Option<DeviceBuffer>,
    ) -> Result<Self> {
        let transport = epoch.connection().remote_transport()?;
        if !remote.transports.contains(transport) {
            return Err(BenchError::TransportNotRegistered {
                memory_id: remote.id,
                transport,
            });
        }
        Ok(Self {
            epoch,
            remote,
            input,
            output,
        })
    }

    pub fn peer(&self) -> Rank {
        self.epoch.connection().peer()
    }

    pub fn input(&self) -> &DeviceBuffer {
        &self.input
    }

    pub fn output(&self) -> Option<&DeviceBuffer> {
        self.output.as_ref()
    }

    /// Copy `len` input bytes at `src_offset` into the peer's memory.
    pub async fn put(&self, dst_offset: usize, src_offset: usize, len: usize) -> Result<()> {
        self.epoch
            .connection()
            .put(&self.remote, dst_offset, &self.input, src_offset, len)
            .await
    }

    pub async fn signal(&self) -> Result<()> {
        self.epoch.signal().await
    }

    pub async fn put_with_signal(&self, dst_offset: usize, src_offset: usize, len: usize) -> Result<()> {
        self.put(dst_offset, src_offset, len).await?;
        self.signal().await
    }

    pub async fn wait(&self) -> Result<()> {
        self.epoch.wait().await
    }
}
