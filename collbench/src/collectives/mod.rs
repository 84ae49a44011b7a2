//! Reference collectives for exercising the engine.

mod allgather;
mod sendrecv;

pub use allgather::AllGather;
pub use sendrecv::SendRecv;
