use crate::comm::{Connection, RegisteredMemory, RemoteMemory};
use crate::error::{BenchError, Result};
use crate::types::Rank;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub usize);

#[derive(Debug, Clone)]
pub enum MemoryEntry {
    Local(RegisteredMemory),
    Remote(RemoteMemory),
}

/// Tables of connections and memories that indexed channels address.
///
/// Data only moves while the proxy is running.
pub struct ChannelService {
    connections: RwLock<Vec<Arc<Connection>>>,
    memories: RwLock<Vec<MemoryEntry>>,
    running: AtomicBool,
    wait_timeout: Duration,
}

impl ChannelService {
    pub fn new(wait_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::new(Vec::new()),
            memories: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            wait_timeout,
        })
    }

    pub fn add_connection(&self, conn: Arc<Connection>) -> Result<ConnectionId> {
        let mut table = self
            .connections
            .write()
            .map_err(|_| BenchError::LockPoisoned("connection table"))?;
        table.push(conn);
        Ok(ConnectionId(table.len() - 1))
    }

    pub fn add_memory(&self, entry: MemoryEntry) -> Result<MemoryId> {
        let mut table = self
            .memories
            .write()
            .map_err(|_| BenchError::LockPoisoned("memory table"))?;
        table.push(entry);
        Ok(MemoryId(table.len() - 1))
    }

    fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .map_err(|_| BenchError::LockPoisoned("connection table"))?
            .get(id.0)
            .cloned()
            .ok_or_else(|| BenchError::Config(format!("no connection at index {}", id.0)))
    }

    fn memory(&self, id: MemoryId) -> Result<MemoryEntry> {
        self.memories
            .read()
            .map_err(|_| BenchError::LockPoisoned("memory table"))?
            .get(id.0)
            .cloned()
            .ok_or_else(|| BenchError::Config(format!("no memory at index {}", id.0)))
    }

    fn remote(&self, id: MemoryId) -> Result<RemoteMemory> {
        match self.memory(id)? {
            MemoryEntry::Remote(m) => Ok(m),
            MemoryEntry::Local(_) => Err(BenchError::Config(format!(
                "memory {} is local, expected a remote destination",
                id.0
            ))),
        }
    }

    fn local(&self, id: MemoryId) -> Result<RegisteredMemory> {
        match self.memory(id)? {
            MemoryEntry::Local(m) => Ok(m),
            MemoryEntry::Remote(_) => Err(BenchError::Config(format!(
                "memory {} is remote, expected a local source",
                id.0
            ))),
        }
    }

    /// Build a channel from table entries.
    ///
    /// Fails unless `dst` is a remote memory registered for the transport
    /// the connection delivers over.
    pub fn channel(
        self: &Arc<Self>,
        conn: ConnectionId,
        dst: MemoryId,
        src: MemoryId,
    ) -> Result<SimpleChannel> {
        let connection = self.connection(conn)?;
        let remote = self.remote(dst)?;
        self.local(src)?;
        let transport = connection.remote_transport()?;
        if !remote.transports.contains(transport) {
            return Err(BenchError::TransportNotRegistered {
                memory_id: remote.id,
                transport,
            });
        }
        Ok(SimpleChannel {
            service: Arc::clone(self),
            conn,
            dst,
            src,
            peer: connection.peer(),
            expected: AtomicU64::new(connection.inbound().value()),
        })
    }

    pub fn start_proxy(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn stop_proxy(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BenchError::ServiceStopped)
        }
    }
}

/// A channel addressed through a [`ChannelService`]:
/// `(connection, remote memory, local memory)` indices.
pub struct SimpleChannel {
    service: Arc<ChannelService>,
    conn: ConnectionId,
    dst: MemoryId,
    src: MemoryId,
    peer: Rank,
    expected: AtomicU64,
}

impl SimpleChannel {
    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Copy `len` bytes of the local memory at `src_offset` to the remote
    /// memory at `dst_offset`.
    pub async fn put(&self, dst_offset: usize, src_offset: usize, len: usize) -> Result<()> {
        self.service.ensure_running()?;
        let conn = self.service.connection(self.conn)?;
        let dst = self.service.remote(self.dst)?;
        let src = self.service.local(self.src)?;
        conn.put(&dst, dst_offset, src.data(), src_offset, len).await
    }

    pub async fn signal(&self) -> Result<()> {
        self.service.ensure_running()?;
        self.service.connection(self.conn)?.signal().await
    }

    pub async fn put_with_signal(&self, dst_offset: usize, src_offset: usize, len: usize) -> Result<()> {
        self.put(dst_offset, src_offset, len).await?;
        self.signal().await
    }

    /// Wait for the peer's next signal on this channel.
    pub async fn wait(&self) -> Result<()> {
        self.service.ensure_running()?;
        let conn = self.service.connection(self.conn)?;
        let target = self.expected.fetch_add(1, Ordering::AcqRel) + 1;
        let timeout = self.service.wait_timeout;
        tokio::time::timeout(timeout, conn.inbound().wait_for(target))
            .await
            .map_err(|_| BenchError::CollectiveFailed {
                operation: "channel wait",
                rank: self.peer,
                reason: format!(
                    "signal {target} not received after {}ms",
                    timeout.as_millis()
                ),
            })?
    }
}
