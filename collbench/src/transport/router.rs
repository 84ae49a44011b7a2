use crate::error::{BenchError, Result};
use crate::protocol::BenchMessage;
use crate::protocol::codec::decode_message;
use crate::transport::connection::{STREAM_TAG_CHANNEL, STREAM_TAG_FRAMED, STREAM_TAG_RAW};
use crate::transport::proxy::{CHANNEL_FRAME_SIZE, ChannelFrame, FrameKind, ProxyState};
use crate::types::Rank;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Channel capacity per message lane.
const LANE_CAPACITY: usize = 256;

/// Maximum frame size accepted by the router (4 GiB).
const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Receive side of the link to one peer.
///
/// A background task accepts the peer's uni streams and reads each one to
/// completion, frame by frame:
///
/// - framed lane: `Barrier`/`BarrierAck` go to **`control`**,
///   `Connect`/`Memory` go to **`setup`**
/// - raw lane: payloads go to **`raw`**
/// - channel lane: puts and signals are applied to the shared [`ProxyState`]
pub struct PeerRouter {
    pub control: Mutex<mpsc::Receiver<BenchMessage>>,
    pub setup: Mutex<mpsc::Receiver<BenchMessage>>,
    pub raw: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[derive(Clone)]
struct RouterSenders {
    rank: Rank,
    control: mpsc::Sender<BenchMessage>,
    setup: mpsc::Sender<BenchMessage>,
    raw: mpsc::Sender<Vec<u8>>,
    proxy: Arc<ProxyState>,
}

impl PeerRouter {
    /// Spawn a background receive loop for `conn` and return the router.
    pub fn spawn(
        rank: Rank,
        conn: quinn::Connection,
        proxy: Arc<ProxyState>,
    ) -> (Self, tokio::task::JoinHandle<Result<()>>) {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(LANE_CAPACITY);
        let (setup_tx, setup_rx) = mpsc::channel(LANE_CAPACITY);
        let (raw_tx, raw_rx) = mpsc::channel(LANE_CAPACITY);

        let senders = RouterSenders {
            rank,
            control: ctrl_tx,
            setup: setup_tx,
            raw: raw_tx,
            proxy,
        };

        let handle = tokio::spawn(accept_loop(conn, senders));

        let router = Self {
            control: Mutex::new(ctrl_rx),
            setup: Mutex::new(setup_rx),
            raw: Mutex::new(raw_rx),
        };
        (router, handle)
    }

    pub async fn recv_control(&self, rank: Rank) -> Result<BenchMessage> {
        self.control
            .lock()
            .await
            .recv()
            .await
            .ok_or(BenchError::PeerDisconnected { rank })
    }

    pub async fn recv_setup(&self, rank: Rank) -> Result<BenchMessage> {
        self.setup
            .lock()
            .await
            .recv()
            .await
            .ok_or(BenchError::PeerDisconnected { rank })
    }

    pub async fn recv_raw(&self, rank: Rank) -> Result<Vec<u8>> {
        self.raw
            .lock()
            .await
            .recv()
            .await
            .ok_or(BenchError::PeerDisconnected { rank })
    }
}

async fn accept_loop(conn: quinn::Connection, tx: RouterSenders) -> Result<()> {
    loop {
        let stream = match conn.accept_uni().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(rank = tx.rank, "router: connection closed: {e}");
                return Ok(());
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move { handle_stream(stream, &tx).await });
    }
}

/// Read the lane tag, then every frame on the stream until it ends.
async fn handle_stream(mut stream: quinn::RecvStream, tx: &RouterSenders) {
    let mut tag_buf = [0u8; 1];
    if stream.read_exact(&mut tag_buf).await.is_err() {
        tracing::warn!(
            rank = tx.rank,
            "router: failed to read stream tag, skipping stream"
        );
        return;
    }

    match tag_buf[0] {
        STREAM_TAG_FRAMED => {
            while let Some(buf) = read_length_prefixed(&mut stream, tx.rank, "framed").await {
                match decode_message(&buf) {
                    Ok((_, msg)) => dispatch_framed(msg, tx).await,
                    Err(e) => tracing::warn!(rank = tx.rank, "router: framed decode failed: {e}"),
                }
            }
        }
        STREAM_TAG_RAW => {
            while let Some(buf) = read_length_prefixed(&mut stream, tx.rank, "raw").await {
                if tx.raw.send(buf).await.is_err() {
                    tracing::warn!(rank = tx.rank, "router: raw receiver dropped");
                    return;
                }
            }
        }
        STREAM_TAG_CHANNEL => read_channel_frames(&mut stream, tx).await,
        other => {
            tracing::warn!(
                rank = tx.rank,
                "router: unknown stream tag 0x{:02x}, skipping stream",
                other
            );
        }
    }
}

async fn dispatch_framed(msg: BenchMessage, tx: &RouterSenders) {
    let lane = match &msg {
        BenchMessage::Barrier { .. } | BenchMessage::BarrierAck { .. } => &tx.control,
        BenchMessage::Connect { .. } | BenchMessage::Memory { .. } => &tx.setup,
        other => {
            tracing::warn!(rank = tx.rank, "router: unexpected {other:?} on mesh link");
            return;
        }
    };
    if lane.send(msg).await.is_err() {
        tracing::warn!(rank = tx.rank, "router: lane receiver dropped");
    }
}

async fn read_channel_frames(stream: &mut quinn::RecvStream, tx: &RouterSenders) {
    let mut header = [0u8; CHANNEL_FRAME_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut header).await {
            tracing::debug!(rank = tx.rank, "router: channel lane ended: {e}");
            return;
        }
        let Some(frame) = ChannelFrame::decode(&header) else {
            tracing::warn!(rank = tx.rank, "router: malformed channel frame, dropping lane");
            return;
        };
        let applied = match frame.kind {
            FrameKind::Put => {
                if frame.len > MAX_MESSAGE_SIZE {
                    tracing::warn!(rank = tx.rank, "router: put of {} bytes too large", frame.len);
                    return;
                }
                let mut payload = vec![0u8; frame.len as usize];
                if let Err(e) = stream.read_exact(&mut payload).await {
                    tracing::warn!(rank = tx.rank, "router: put payload read failed: {e}");
                    return;
                }
                tx.proxy
                    .apply_put(frame.memory_id, frame.offset, &payload, frame.transport)
            }
            FrameKind::Signal => tx.proxy.apply_signal(tx.rank, frame.tag),
        };
        if let Err(e) = applied {
            tracing::warn!(rank = tx.rank, tag = frame.tag, "router: channel frame rejected: {e}");
            if let Err(e) = tx.proxy.reject(tx.rank, frame.tag, &e) {
                tracing::warn!(rank = tx.rank, "router: cannot fault connection: {e}");
            }
        }
    }
}

async fn read_length_prefixed(
    stream: &mut quinn::RecvStream,
    rank: Rank,
    label: &str,
) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        tracing::debug!(rank, "router: {label} lane ended: {e}");
        return None;
    }
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        tracing::warn!(
            rank,
            "router: {label} message too large ({len} bytes), dropping lane"
        );
        return None;
    }
    let mut buf = vec![0u8; len as usize];
    if let Err(e) = stream.read_exact(&mut buf).await {
        tracing::warn!(rank, "router: {label} payload read failed: {e}");
        return None;
    }
    Some(buf)
}
