use crate::device::{DeviceBuffer, DeviceProperties, Platform};
use crate::error::{BenchError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Platform backed by host memory.
///
/// Each emulated device reports a configurable amount of total memory and
/// refuses allocations beyond it, so memory clamping and allocation failures
/// behave as they would on real hardware.
#[derive(Debug)]
pub struct HostPlatform {
    devices: usize,
    total_memory: u64,
    name: String,
    current: AtomicUsize,
    usage: Vec<Arc<AtomicU64>>,
}

impl HostPlatform {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            total_memory: 16 << 30,
            name: "Host Emulated Device".to_string(),
            current: AtomicUsize::new(0),
            usage: (0..devices).map(|_| Arc::new(AtomicU64::new(0))).collect(),
        }
    }

    /// Report `bytes` of total memory per device.
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory = bytes;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Device selected by the last `set_device` call.
    pub fn current_device(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated on `ordinal`.
    pub fn used_memory(&self, ordinal: usize) -> u64 {
        self.usage
            .get(ordinal)
            .map(|u| u.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn check_ordinal(&self, ordinal: usize) -> Result<()> {
        if ordinal >= self.devices {
            return Err(BenchError::platform(format!(
                "invalid device ordinal {ordinal}: {} device(s) present",
                self.devices
            )));
        }
        Ok(())
    }
}

impl Platform for HostPlatform {
    fn device_count(&self) -> Result<usize> {
        Ok(self.devices)
    }

    fn set_device(&self, ordinal: usize) -> Result<()> {
        self.check_ordinal(ordinal)?;
        self.current.store(ordinal, Ordering::Relaxed);
        Ok(())
    }

    fn properties(&self, ordinal: usize) -> Result<DeviceProperties> {
        self.check_ordinal(ordinal)?;
        Ok(DeviceProperties {
            name: self.name.clone(),
            total_memory: self.total_memory,
            pci_bus_id: format!("0000:{ordinal:02x}:00.0"),
        })
    }

    fn alloc(&self, ordinal: usize, bytes: usize) -> Result<DeviceBuffer> {
        self.check_ordinal(ordinal)?;
        let usage = &self.usage[ordinal];
        let used = usage.load(Ordering::Relaxed);
        if used.saturating_add(bytes as u64) > self.total_memory {
            return Err(BenchError::platform(format!(
                "out of memory on device {ordinal}: requested {bytes} bytes, {} of {} in use",
                used, self.total_memory
            )));
        }
        Ok(DeviceBuffer::new_zeroed(ordinal, bytes, Arc::clone(usage)))
    }
}
