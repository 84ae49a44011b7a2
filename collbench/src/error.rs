use crate::types::{Rank, Transport};

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid size {input:?}: expected a number with an optional K/M/G suffix")]
    InvalidSize { input: String },

    #[error("connection to rank {rank} failed: {reason}")]
    ConnectionFailed { rank: Rank, reason: String },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("rank {rank} not found in cluster")]
    UnknownPeer { rank: Rank },

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("cluster formation timed out: {joined}/{expected} nodes joined")]
    ClusterFormationTimeout { joined: u32, expected: u32 },

    #[error("cluster token mismatch: bootstrap authentication failed")]
    ClusterTokenMismatch,

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("QUIC transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("platform error: {message}")]
    Platform {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("setup timed out after {timeout_ms}ms waiting on rank {rank}")]
    SetupTimeout { rank: Rank, timeout_ms: u64 },

    #[error("{what} for rank {peer} (tag {tag}) is not available until setup completes")]
    SetupPending {
        what: &'static str,
        peer: Rank,
        tag: u32,
    },

    #[error("transport mismatch with rank {peer} (tag {tag}): local {local}, remote {remote}")]
    TransportMismatch {
        peer: Rank,
        tag: u32,
        local: Transport,
        remote: Transport,
    },

    #[error("memory {memory_id} is not registered for transport {transport}")]
    TransportNotRegistered { memory_id: u64, transport: Transport },

    #[error("memory {memory_id} is not registered in this process")]
    UnknownMemory { memory_id: u64 },

    #[error("access of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("channel fault: {0}")]
    ChannelFault(String),

    #[error("channel service is not running")]
    ServiceStopped,

    #[error("invalid timing state: cannot {action} while {state}")]
    InvalidTimingState {
        action: &'static str,
        state: &'static str,
    },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl BenchError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Platform` error with just a message.
    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Platform` error with a message and a source error.
    pub fn platform_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Platform {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for errors the sweep reports before any collective starts.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::InvalidSize { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = BenchError::ConnectionFailed {
            rank: 3,
            reason: "timeout".into(),
        };
        assert_eq!(e.to_string(), "connection to rank 3 failed: timeout");
    }

    #[test]
    fn test_setup_pending_display() {
        let e = BenchError::SetupPending {
            what: "remote memory",
            peer: 2,
            tag: 0,
        };
        assert_eq!(
            e.to_string(),
            "remote memory for rank 2 (tag 0) is not available until setup completes"
        );
    }

    #[test]
    fn test_transport_mismatch_display() {
        let e = BenchError::TransportMismatch {
            peer: 1,
            tag: 0,
            local: Transport::LocalFastPath,
            remote: Transport::RemoteFabric(3),
        };
        assert_eq!(
            e.to_string(),
            "transport mismatch with rank 1 (tag 0): local ipc, remote fabric3"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let err: BenchError = io_err.into();
        assert!(err.to_string().contains("port busy"));
    }

    #[test]
    fn test_is_config() {
        assert!(BenchError::Config("min > max".into()).is_config());
        assert!(BenchError::InvalidSize { input: "x".into() }.is_config());
        assert!(!BenchError::platform("oom").is_config());
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<BenchError> = vec![
            BenchError::Config("bad".into()),
            BenchError::InvalidSize { input: "12Q".into() },
            BenchError::ConnectionFailed {
                rank: 0,
                reason: "x".into(),
            },
            BenchError::PeerDisconnected { rank: 1 },
            BenchError::UnknownPeer { rank: 2 },
            BenchError::ProtocolMismatch {
                local: 1,
                remote: 2,
            },
            BenchError::DecodeFailed("bad".into()),
            BenchError::EncodeFailed("bad".into()),
            BenchError::ClusterFormationTimeout {
                joined: 2,
                expected: 4,
            },
            BenchError::ClusterTokenMismatch,
            BenchError::InvalidRank {
                rank: 5,
                world_size: 4,
            },
            BenchError::transport("conn reset"),
            BenchError::Tls("bad cert".into()),
            BenchError::platform("oom"),
            BenchError::CollectiveFailed {
                operation: "barrier",
                rank: 2,
                reason: "peer disconnected".into(),
            },
            BenchError::SetupTimeout {
                rank: 1,
                timeout_ms: 100,
            },
            BenchError::TransportNotRegistered {
                memory_id: 4,
                transport: Transport::LocalFastPath,
            },
            BenchError::UnknownMemory { memory_id: 9 },
            BenchError::OutOfBounds {
                offset: 8,
                len: 8,
                capacity: 12,
            },
            BenchError::ServiceStopped,
            BenchError::InvalidTimingState {
                action: "replay",
                state: "idle",
            },
            BenchError::Stream("capture already active".into()),
            BenchError::LockPoisoned("memory table"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
