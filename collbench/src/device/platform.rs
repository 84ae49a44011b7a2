use crate::device::DeviceBuffer;
use crate::error::Result;

/// Static properties of one device, as printed in the run preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    /// Total device memory in bytes.
    pub total_memory: u64,
    /// Bus id in `domain:bus:device.function` form.
    pub pci_bus_id: String,
}

/// The device layer the harness drives: selection, properties and memory.
///
/// - `HostPlatform` (built-in): host memory standing in for device memory.
/// - Accelerator platforms are implemented outside this crate.
pub trait Platform: Send + Sync {
    /// Number of devices visible to this process.
    fn device_count(&self) -> Result<usize>;

    /// Make `ordinal` the current device of this process.
    fn set_device(&self, ordinal: usize) -> Result<()>;

    fn properties(&self, ordinal: usize) -> Result<DeviceProperties>;

    /// Allocate `bytes` of zeroed memory on device `ordinal`.
    fn alloc(&self, ordinal: usize, bytes: usize) -> Result<DeviceBuffer>;
}
