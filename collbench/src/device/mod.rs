mod buffer;
mod host;
mod platform;
mod stream;

pub use buffer::DeviceBuffer;
pub use host::HostPlatform;
pub use platform::{DeviceProperties, Platform};
pub use stream::{DeviceOp, Graph, GraphExec, Stream, device_op};
