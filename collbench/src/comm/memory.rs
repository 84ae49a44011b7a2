use crate::device::DeviceBuffer;
use crate::error::{BenchError, Result};
use crate::protocol::MemoryDescriptor;
use crate::transport::ProxyState;
use crate::types::{Rank, TransportSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Exposure of one buffer in the proxy; withdrawn when dropped.
pub(crate) struct Registration {
    id: u64,
    proxy: Arc<ProxyState>,
}

impl Registration {
    pub(crate) fn new(id: u64, proxy: Arc<ProxyState>) -> Self {
        Self { id, proxy }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.proxy.withdraw(self.id) {
            tracing::warn!(id = self.id, "withdrawing registered memory failed: {e}");
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

/// A local buffer exposed to peers for remote writes.
///
/// Clones share one registration. Peers' writes are accepted until the last
/// clone drops.
#[derive(Debug, Clone)]
pub struct RegisteredMemory {
    pub(crate) registration: Arc<Registration>,
    pub(crate) owner: Rank,
    pub(crate) buffer: DeviceBuffer,
    pub(crate) transports: TransportSet,
}

impl RegisteredMemory {
    pub fn id(&self) -> u64 {
        self.registration.id
    }

    pub fn owner(&self) -> Rank {
        self.owner
    }

    pub fn transports(&self) -> TransportSet {
        self.transports
    }

    /// The underlying device buffer.
    pub fn data(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn descriptor(&self) -> MemoryDescriptor {
        MemoryDescriptor {
            id: self.id(),
            owner: self.owner,
            base: self.buffer.addr(),
            len: self.buffer.len() as u64,
            transports: self.transports.bits(),
        }
    }
}

/// Read-only view of a peer's registered memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMemory {
    pub id: u64,
    pub owner: Rank,
    pub base: u64,
    pub len: u64,
    pub transports: TransportSet,
}

impl From<MemoryDescriptor> for RemoteMemory {
    fn from(d: MemoryDescriptor) -> Self {
        Self {
            id: d.id,
            owner: d.owner,
            base: d.base,
            len: d.len,
            transports: TransportSet::from_bits(d.transports),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Resolved,
}

/// A peer's memory descriptor, filled in by `finalize_setup`.
#[derive(Debug, Clone)]
pub struct RemoteMemoryHandle {
    peer: Rank,
    tag: u32,
    slot: Arc<OnceLock<RemoteMemory>>,
}

impl RemoteMemoryHandle {
    pub(crate) fn pending(peer: Rank, tag: u32) -> Self {
        Self {
            peer,
            tag,
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn resolve(&self, memory: RemoteMemory) -> Result<()> {
        self.slot
            .set(memory)
            .map_err(|_| BenchError::Config(format!(
                "remote memory from rank {} (tag {}) resolved twice",
                self.peer, self.tag
            )))
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn state(&self) -> HandleState {
        if self.slot.get().is_some() {
            HandleState::Resolved
        } else {
            HandleState::Pending
        }
    }

    /// The resolved descriptor; an error while setup is still pending.
    pub fn get(&self) -> Result<&RemoteMemory> {
        self.slot.get().ok_or(BenchError::SetupPending {
            what: "remote memory",
            peer: self.peer,
            tag: self.tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;

    #[test]
    fn test_handle_pending_then_resolved() {
        let handle = RemoteMemoryHandle::pending(3, 0);
        assert_eq!(handle.state(), HandleState::Pending);
        assert!(matches!(
            handle.get(),
            Err(BenchError::SetupPending { peer: 3, tag: 0, .. })
        ));

        let desc = MemoryDescriptor {
            id: 1,
            owner: 3,
            base: 0x1000,
            len: 64,
            transports: TransportSet::from(Transport::LocalFastPath).bits(),
        };
        handle.resolve(desc.into()).unwrap();
        assert_eq!(handle.state(), HandleState::Resolved);
        let remote = handle.get().unwrap();
        assert_eq!(remote.len, 64);
        assert!(remote.transports.contains(Transport::LocalFastPath));

        let clone = handle.clone();
        assert_eq!(clone.state(), HandleState::Resolved);
        assert!(handle.resolve(remote.clone()).is_err());
    }
}
