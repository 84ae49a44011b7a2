use crate::device::DeviceBuffer;
use crate::error::{BenchError, Result};
use crate::types::{Rank, Transport, TransportSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::Notify;

/// Size of an encoded [`ChannelFrame`] header.
pub(crate) const CHANNEL_FRAME_SIZE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    /// Write `len` payload bytes into a registered region.
    Put = 1,
    /// Bump the receiver's signal counter for this connection.
    Signal = 2,
}

/// Fixed binary header for traffic on the channel lane.
///
/// ```text
/// [0]      kind: u8
/// [1]      transport code: u8
/// [2..6]   connection tag: u32 LE
/// [6..14]  memory id: u64 LE
/// [14..22] offset: u64 LE
/// [22..30] payload length: u64 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelFrame {
    pub kind: FrameKind,
    pub transport: Transport,
    pub tag: u32,
    pub memory_id: u64,
    pub offset: u64,
    pub len: u64,
}

impl ChannelFrame {
    pub fn put(transport: Transport, tag: u32, memory_id: u64, offset: u64, len: u64) -> Self {
        Self {
            kind: FrameKind::Put,
            transport,
            tag,
            memory_id,
            offset,
            len,
        }
    }

    pub fn signal(transport: Transport, tag: u32) -> Self {
        Self {
            kind: FrameKind::Signal,
            transport,
            tag,
            memory_id: 0,
            offset: 0,
            len: 0,
        }
    }

    pub fn encode(&self) -> [u8; CHANNEL_FRAME_SIZE] {
        let mut buf = [0u8; CHANNEL_FRAME_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.transport.code();
        buf[2..6].copy_from_slice(&self.tag.to_le_bytes());
        buf[6..14].copy_from_slice(&self.memory_id.to_le_bytes());
        buf[14..22].copy_from_slice(&self.offset.to_le_bytes());
        buf[22..30].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CHANNEL_FRAME_SIZE]) -> Option<Self> {
        let kind = match buf[0] {
            1 => FrameKind::Put,
            2 => FrameKind::Signal,
            _ => return None,
        };
        let transport = Transport::from_code(buf[1])?;
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        Some(Self {
            kind,
            transport,
            tag: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            memory_id: u64_at(6),
            offset: u64_at(14),
            len: u64_at(22),
        })
    }
}

/// Monotonic counter of signals received on one connection.
///
/// A connection whose inbound traffic was rejected is faulted: every later
/// wait on it fails instead of returning on a signal that followed bad data.
#[derive(Debug, Default)]
pub struct SignalCounter {
    value: AtomicU64,
    notify: Notify,
    fault: OnceLock<String>,
}

impl SignalCounter {
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.get().map(String::as_str)
    }

    pub(crate) fn increment(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub(crate) fn fail(&self, reason: String) {
        let _ = self.fault.set(reason);
        self.notify.notify_waiters();
    }

    /// Resolve once the counter reaches `target`; an error if the
    /// connection has faulted.
    pub async fn wait_for(&self, target: u64) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.fault() {
                return Err(BenchError::ChannelFault(reason.to_string()));
            }
            if self.value() >= target {
                return Ok(());
            }
            notified.await;
        }
    }
}

struct Region {
    buffer: DeviceBuffer,
    transports: TransportSet,
}

/// Receive-side state shared by every router of one process.
///
/// Holds the regions peers may write into and the per-connection signal
/// counters. Routers apply channel frames here; local channel code waits on
/// the counters.
pub struct ProxyState {
    rank: Rank,
    next_memory_id: AtomicU64,
    regions: RwLock<HashMap<u64, Region>>,
    signals: Mutex<HashMap<(Rank, u32), Arc<SignalCounter>>>,
}

impl ProxyState {
    pub fn new(rank: Rank) -> Arc<Self> {
        Arc::new(Self {
            rank,
            next_memory_id: AtomicU64::new(1),
            regions: RwLock::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        })
    }

    /// A memory id not yet handed out in this process.
    pub fn next_memory_id(&self) -> u64 {
        self.next_memory_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Accept remote writes into `buffer` over any transport in `transports`.
    pub fn expose(&self, memory_id: u64, buffer: DeviceBuffer, transports: TransportSet) -> Result<()> {
        self.regions
            .write()
            .map_err(|_| BenchError::LockPoisoned("proxy regions"))?
            .insert(memory_id, Region { buffer, transports });
        Ok(())
    }

    pub fn withdraw(&self, memory_id: u64) -> Result<()> {
        self.regions
            .write()
            .map_err(|_| BenchError::LockPoisoned("proxy regions"))?
            .remove(&memory_id);
        Ok(())
    }

    /// Counter for signals arriving from `peer` on connection `tag`.
    pub fn counter(&self, peer: Rank, tag: u32) -> Result<Arc<SignalCounter>> {
        let mut signals = self
            .signals
            .lock()
            .map_err(|_| BenchError::LockPoisoned("proxy signals"))?;
        Ok(Arc::clone(signals.entry((peer, tag)).or_default()))
    }

    pub(crate) fn apply_put(
        &self,
        memory_id: u64,
        offset: u64,
        payload: &[u8],
        transport: Transport,
    ) -> Result<()> {
        let regions = self
            .regions
            .read()
            .map_err(|_| BenchError::LockPoisoned("proxy regions"))?;
        let region = regions
            .get(&memory_id)
            .ok_or(BenchError::UnknownMemory { memory_id })?;
        if !region.transports.contains(transport) {
            return Err(BenchError::TransportNotRegistered {
                memory_id,
                transport,
            });
        }
        let offset = usize::try_from(offset).map_err(|_| BenchError::OutOfBounds {
            offset: usize::MAX,
            len: payload.len(),
            capacity: region.buffer.len(),
        })?;
        region.buffer.write(offset, payload)
    }

    pub(crate) fn apply_signal(&self, peer: Rank, tag: u32) -> Result<()> {
        self.counter(peer, tag)?.increment();
        Ok(())
    }

    /// Fault connection `tag` from `peer` after one of its frames was rejected.
    pub(crate) fn reject(&self, peer: Rank, tag: u32, err: &BenchError) -> Result<()> {
        self.counter(peer, tag)?
            .fail(format!("write from rank {peer} on tag {tag} rejected: {err}"));
        Ok(())
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }
}
