pub mod aggregate;
pub mod bootstrap;
pub mod channel;
pub mod check;
pub mod cluster;
pub mod collectives;
pub mod comm;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod timing;
pub mod topology;
pub mod transport;
pub mod types;

pub use bootstrap::{Bootstrap, InitOptions, UniqueId, bootstrap_local};
pub use channel::{ChannelService, DirectChannel, SimpleChannel};
pub use cluster::{SeedNode, WorkerNode};
pub use collectives::{AllGather, SendRecv};
pub use comm::{Communicator, Connection, RegisteredMemory, RemoteMemoryHandle};
pub use config::{BenchConfig, TestArgs};
pub use device::{DeviceBuffer, HostPlatform, Platform, Stream};
pub use engine::{TestCollective, TestEngine};
pub use error::{BenchError, Result};
pub use report::{Reporter, ResultRow};
pub use runner::{RunOutcome, run};
pub use topology::RankTopology;
pub use types::{Rank, ReduceMode, Transport, TransportSet};
