use crate::comm::RemoteMemory;
use crate::device::DeviceBuffer;
use crate::error::{BenchError, Result};
use crate::transport::proxy::ChannelFrame;
use crate::transport::{PeerConnection, SignalCounter};
use crate::types::{Rank, Transport};
use std::sync::{Arc, OnceLock};

/// Link from this process to one peer, tagged with its transport.
///
/// Created by [`Communicator::connect`](super::Communicator::connect) and
/// usable once `finalize_setup` has learnt the transport the peer chose.
/// Frames name the peer's transport, since that is the interface remote
/// writes land on.
pub struct Connection {
    peer: Rank,
    tag: u32,
    transport: Transport,
    remote_transport: OnceLock<Transport>,
    link: Arc<PeerConnection>,
    inbound: Arc<SignalCounter>,
}

impl Connection {
    pub(crate) fn new(
        peer: Rank,
        tag: u32,
        transport: Transport,
        link: Arc<PeerConnection>,
        inbound: Arc<SignalCounter>,
    ) -> Self {
        Self {
            peer,
            tag,
            transport,
            remote_transport: OnceLock::new(),
            link,
            inbound,
        }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Transport chosen by this side.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Transport chosen by the peer.
    pub fn remote_transport(&self) -> Result<Transport> {
        self.remote_transport
            .get()
            .copied()
            .ok_or(BenchError::SetupPending {
                what: "connection",
                peer: self.peer,
                tag: self.tag,
            })
    }

    pub fn is_ready(&self) -> bool {
        self.remote_transport.get().is_some()
    }

    pub(crate) fn mark_ready(&self, remote: Transport) {
        let _ = self.remote_transport.set(remote);
    }

    /// Signals received from the peer on this connection.
    pub fn inbound(&self) -> &Arc<SignalCounter> {
        &self.inbound
    }

    /// Copy `len` bytes from `src[src_offset..]` into `dst[dst_offset..]`.
    pub async fn put(
        &self,
        dst: &RemoteMemory,
        dst_offset: usize,
        src: &DeviceBuffer,
        src_offset: usize,
        len: usize,
    ) -> Result<()> {
        let remote = self.remote_transport()?;
        if !dst.transports.contains(remote) {
            return Err(BenchError::TransportNotRegistered {
                memory_id: dst.id,
                transport: remote,
            });
        }
        let end = dst_offset.checked_add(len);
        if end.is_none_or(|end| end as u64 > dst.len) {
            return Err(BenchError::OutOfBounds {
                offset: dst_offset,
                len,
                capacity: dst.len as usize,
            });
        }
        let payload = src.read(src_offset, len)?;
        let frame = ChannelFrame::put(remote, self.tag, dst.id, dst_offset as u64, len as u64);
        self.link.send_channel_frame(frame, &payload).await
    }

    /// Bump the peer's inbound counter for this connection.
    pub async fn signal(&self) -> Result<()> {
        let remote = self.remote_transport()?;
        self.link
            .send_channel_frame(ChannelFrame::signal(remote, self.tag), &[])
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("tag", &self.tag)
            .field("transport", &self.transport)
            .field("remote_transport", &self.remote_transport.get())
            .finish()
    }
}
