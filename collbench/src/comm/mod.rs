//! Connection and memory registrar.
//!
//! Connections and memory exchanges are declared first and completed
//! collectively by [`Communicator::finalize_setup`]; nothing they return is
//! usable before that.

mod connection;
mod memory;

pub use connection::Connection;
pub use memory::{HandleState, RegisteredMemory, RemoteMemory, RemoteMemoryHandle};

use memory::Registration;

use crate::bootstrap::Bootstrap;
use crate::device::DeviceBuffer;
use crate::error::{BenchError, Result};
use crate::protocol::BenchMessage;
use crate::types::{Rank, Transport, TransportSet};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Requests queued until the next `finalize_setup`.
#[derive(Default)]
struct SetupQueue {
    connects: Vec<Arc<Connection>>,
    sends: Vec<(Rank, BenchMessage)>,
    recvs: Vec<RemoteMemoryHandle>,
}

pub struct Communicator {
    bootstrap: Arc<Bootstrap>,
    queue: Mutex<SetupQueue>,
}

impl Communicator {
    pub fn new(bootstrap: Arc<Bootstrap>) -> Self {
        Self {
            bootstrap,
            queue: Mutex::new(SetupQueue::default()),
        }
    }

    pub fn bootstrap(&self) -> &Arc<Bootstrap> {
        &self.bootstrap
    }

    pub fn rank(&self) -> Rank {
        self.bootstrap.rank()
    }

    fn queue(&self) -> Result<std::sync::MutexGuard<'_, SetupQueue>> {
        self.queue
            .lock()
            .map_err(|_| BenchError::LockPoisoned("setup queue"))
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer == self.rank() {
            return Err(BenchError::Config(format!(
                "rank {peer} cannot connect to itself"
            )));
        }
        if peer >= self.bootstrap.world_size() {
            return Err(BenchError::InvalidRank {
                rank: peer,
                world_size: self.bootstrap.world_size(),
            });
        }
        Ok(())
    }

    /// Expose `buffer` to remote writes over `transports` until the returned
    /// registration (and every clone of it) is dropped.
    pub fn register_memory(
        &self,
        buffer: &DeviceBuffer,
        transports: TransportSet,
    ) -> Result<RegisteredMemory> {
        if transports.is_empty() {
            return Err(BenchError::platform(
                "cannot register memory with an empty transport set",
            ));
        }
        if buffer.is_empty() {
            return Err(BenchError::platform("cannot register an empty buffer"));
        }
        let proxy = self.bootstrap.proxy();
        let id = proxy.next_memory_id();
        proxy.expose(id, buffer.clone(), transports)?;
        tracing::debug!(rank = self.rank(), id, len = buffer.len(), %transports, "memory registered");
        Ok(RegisteredMemory {
            registration: Arc::new(Registration::new(id, Arc::clone(proxy))),
            owner: self.rank(),
            buffer: buffer.clone(),
            transports,
        })
    }

    /// Declare a connection to `peer`. Usable after `finalize_setup`.
    pub fn connect(&self, peer: Rank, tag: u32, transport: Transport) -> Result<Arc<Connection>> {
        self.check_peer(peer)?;
        let link = Arc::clone(self.bootstrap.peer(peer)?);
        let inbound = self.bootstrap.proxy().counter(peer, tag)?;
        let conn = Arc::new(Connection::new(peer, tag, transport, link, inbound));
        let mut queue = self.queue()?;
        queue.connects.push(Arc::clone(&conn));
        queue.sends.push((
            peer,
            BenchMessage::Connect {
                tag,
                transport: transport.code(),
            },
        ));
        Ok(conn)
    }

    /// Queue `mem`'s descriptor for delivery to `peer`.
    pub fn send_memory(&self, mem: &RegisteredMemory, peer: Rank, tag: u32) -> Result<()> {
        self.check_peer(peer)?;
        self.queue()?.sends.push((
            peer,
            BenchMessage::Memory {
                tag,
                descriptor: mem.descriptor(),
            },
        ));
        Ok(())
    }

    /// Expect a descriptor from `peer`; the handle resolves during setup.
    pub fn recv_memory(&self, peer: Rank, tag: u32) -> Result<RemoteMemoryHandle> {
        self.check_peer(peer)?;
        let handle = RemoteMemoryHandle::pending(peer, tag);
        self.queue()?.recvs.push(handle.clone());
        Ok(handle)
    }

    pub fn exchange_memory(
        &self,
        peer: Rank,
        tag: u32,
        mem: &RegisteredMemory,
    ) -> Result<RemoteMemoryHandle> {
        self.send_memory(mem, peer, tag)?;
        self.recv_memory(peer, tag)
    }

    /// Complete every queued request. Collective.
    ///
    /// Sends the queued `Connect` and `Memory` messages, receives the
    /// expected ones from each peer (matched by kind and tag, in arrival
    /// order), checks both sides of each connection agree on the transport
    /// class, then ends with a barrier.
    pub async fn finalize_setup(&self) -> Result<()> {
        let queue = std::mem::take(&mut *self.queue()?);
        let boot = &self.bootstrap;

        let mut outgoing: HashMap<Rank, Vec<BenchMessage>> = HashMap::new();
        for (peer, msg) in queue.sends {
            outgoing.entry(peer).or_default().push(msg);
        }
        let sends = outgoing.into_iter().map(|(peer, msgs)| async move {
            for msg in &msgs {
                boot.send_setup(peer, msg).await?;
            }
            Ok::<_, BenchError>(())
        });

        let mut expected: HashMap<Rank, PeerExpectations> = HashMap::new();
        for conn in queue.connects {
            expected
                .entry(conn.peer())
                .or_default()
                .connects
                .entry(conn.tag())
                .or_default()
                .push_back(conn);
        }
        for handle in queue.recvs {
            expected
                .entry(handle.peer())
                .or_default()
                .memories
                .entry(handle.tag())
                .or_default()
                .push_back(handle);
        }
        let timeout = boot.setup_timeout();
        let recvs = expected.into_iter().map(|(peer, exp)| async move {
            tokio::time::timeout(timeout, self.receive_from(peer, exp))
                .await
                .map_err(|_| BenchError::SetupTimeout {
                    rank: peer,
                    timeout_ms: timeout.as_millis() as u64,
                })?
        });

        tokio::try_join!(
            futures::future::try_join_all(sends),
            futures::future::try_join_all(recvs),
        )?;

        boot.barrier().await
    }

    async fn receive_from(&self, peer: Rank, mut exp: PeerExpectations) -> Result<()> {
        while !exp.is_done() {
            match self.bootstrap.recv_setup(peer).await? {
                BenchMessage::Connect { tag, transport } => {
                    let remote = Transport::from_code(transport).ok_or_else(|| {
                        BenchError::DecodeFailed(format!("unknown transport code {transport}"))
                    })?;
                    let conn = pop(&mut exp.connects, tag).ok_or_else(|| {
                        BenchError::Config(format!(
                            "unexpected connect from rank {peer} with tag {tag}"
                        ))
                    })?;
                    if conn.transport().is_local() != remote.is_local() {
                        return Err(BenchError::TransportMismatch {
                            peer,
                            tag,
                            local: conn.transport(),
                            remote,
                        });
                    }
                    conn.mark_ready(remote);
                }
                BenchMessage::Memory { tag, descriptor } => {
                    let handle = pop(&mut exp.memories, tag).ok_or_else(|| {
                        BenchError::Config(format!(
                            "unexpected memory from rank {peer} with tag {tag}"
                        ))
                    })?;
                    handle.resolve(descriptor.into())?;
                }
                other => {
                    return Err(BenchError::DecodeFailed(format!(
                        "unexpected setup message from rank {peer}: {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct PeerExpectations {
    connects: HashMap<u32, VecDeque<Arc<Connection>>>,
    memories: HashMap<u32, VecDeque<RemoteMemoryHandle>>,
}

impl PeerExpectations {
    fn is_done(&self) -> bool {
        self.connects.values().all(VecDeque::is_empty) && self.memories.values().all(VecDeque::is_empty)
    }
}

fn pop<T>(queues: &mut HashMap<u32, VecDeque<T>>, tag: u32) -> Option<T> {
    queues.get_mut(&tag).and_then(VecDeque::pop_front)
}
