use crate::error::{BenchError, Result};
use crate::protocol::BenchMessage;
use crate::protocol::codec::encode_message;
use crate::transport::proxy::ChannelFrame;
use crate::types::{Priority, Rank};
use tokio::sync::Mutex;

/// Stream type tag: first byte on every QUIC uni stream.
pub(crate) const STREAM_TAG_FRAMED: u8 = 0x01;
pub(crate) const STREAM_TAG_RAW: u8 = 0x02;
pub(crate) const STREAM_TAG_CHANNEL: u8 = 0x03;

const LANE_TAGS: [u8; 3] = [STREAM_TAG_FRAMED, STREAM_TAG_RAW, STREAM_TAG_CHANNEL];

/// The send side of the link to one peer.
///
/// Traffic is split into three lanes, each carried by one long-lived QUIC
/// uni stream opened on first use: framed control messages, raw collective
/// bytes and channel frames. A lane is a single stream, so frames on it
/// arrive in the order they were written. The remote `PeerRouter` reads
/// the lanes back.
pub struct PeerConnection {
    pub rank: Rank,
    pub(crate) conn: quinn::Connection,
    lanes: [Mutex<Option<quinn::SendStream>>; 3],
}

impl PeerConnection {
    pub fn new(rank: Rank, conn: quinn::Connection) -> Self {
        Self {
            rank,
            conn,
            lanes: Default::default(),
        }
    }

    /// Send a control message on the framed lane.
    pub async fn send_message(&self, msg: &BenchMessage, priority: Priority) -> Result<()> {
        let buf = encode_message(msg, priority)?;
        let len = (buf.len() as u64).to_le_bytes();
        self.write_lane(0, &[&len, &buf]).await
    }

    /// Send length-prefixed raw bytes on the raw lane.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let len = (data.len() as u64).to_le_bytes();
        self.write_lane(1, &[&len, data]).await
    }

    /// Send a channel frame (and its payload, for puts) on the channel lane.
    pub(crate) async fn send_channel_frame(&self, frame: ChannelFrame, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(frame.len as usize, payload.len());
        self.write_lane(2, &[&frame.encode(), payload]).await
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.conn.remote_address()
    }

    /// Write all `parts` as one frame while holding the lane.
    async fn write_lane(&self, lane: usize, parts: &[&[u8]]) -> Result<()> {
        let tag = LANE_TAGS[lane];
        let mut guard = self.lanes[lane].lock().await;
        if guard.is_none() {
            *guard = Some(self.open_lane(tag).await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(BenchError::transport("lane stream missing after open"));
        };
        for part in parts {
            if let Err(e) = stream.write_all(part).await {
                // Reopen on next use; the remote router drops the broken stream.
                *guard = None;
                return Err(BenchError::transport_with_source(
                    format!("write to rank {} on lane 0x{tag:02x}", self.rank),
                    e,
                ));
            }
        }
        Ok(())
    }

    async fn open_lane(&self, tag: u8) -> Result<quinn::SendStream> {
        let mut stream = self
            .conn
            .open_uni()
            .await
            .map_err(|e| BenchError::transport_with_source("open uni stream", e))?;
        stream
            .write_all(&[tag])
            .await
            .map_err(|e| BenchError::transport_with_source("write stream tag", e))?;
        Ok(stream)
    }
}
