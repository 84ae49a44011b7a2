use crate::error::{BenchError, Result};
use crate::types::ELEMENT_BYTES;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Start of the emulated device address space.
const ADDRESS_BASE: u64 = 0x7f00_0000_0000;

/// Allocation granularity of the emulated address space.
const ADDRESS_ALIGN: u64 = 512;

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(ADDRESS_BASE);

/// A device memory allocation.
///
/// Cloning is cheap and yields another handle to the same memory. Reads and
/// writes are bounds-checked; the owning platform's usage counter is
/// released when the last handle drops.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
}

struct Allocation {
    device: usize,
    addr: u64,
    len: usize,
    data: RwLock<Vec<u8>>,
    usage: Arc<AtomicU64>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.usage.fetch_sub(self.len as u64, Ordering::Relaxed);
    }
}

impl DeviceBuffer {
    pub(crate) fn new_zeroed(device: usize, bytes: usize, usage: Arc<AtomicU64>) -> Self {
        let span = (bytes as u64).div_ceil(ADDRESS_ALIGN).max(1) * ADDRESS_ALIGN;
        let addr = NEXT_ADDRESS.fetch_add(span, Ordering::Relaxed);
        usage.fetch_add(bytes as u64, Ordering::Relaxed);
        Self {
            inner: Arc::new(Allocation {
                device,
                addr,
                len: bytes,
                data: RwLock::new(vec![0u8; bytes]),
                usage,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device ordinal the memory lives on.
    pub fn device(&self) -> usize {
        self.inner.device
    }

    /// Base device address.
    pub fn addr(&self) -> u64 {
        self.inner.addr
    }

    /// True if both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let data = self
            .inner
            .data
            .read()
            .map_err(|_| BenchError::LockPoisoned("device buffer"))?;
        check_range(offset, len, data.len())?;
        Ok(data[offset..offset + len].to_vec())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|_| BenchError::LockPoisoned("device buffer"))?;
        check_range(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy the whole allocation into host memory.
    pub fn copy_to_host(&self) -> Result<Vec<u8>> {
        self.read(0, self.len())
    }

    /// Write `values` as little-endian `i32` starting at element `first`.
    pub fn write_i32(&self, first: usize, values: &[i32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(first * ELEMENT_BYTES, &bytes)
    }

    /// Read `count` little-endian `i32` elements starting at element `first`.
    pub fn read_i32(&self, first: usize, count: usize) -> Result<Vec<i32>> {
        let bytes = self.read(first * ELEMENT_BYTES, count * ELEMENT_BYTES)?;
        Ok(bytes
            .chunks_exact(ELEMENT_BYTES)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DeviceBuffer(device={}, addr=0x{:x}, {}B)",
            self.inner.device,
            self.inner.addr,
            self.inner.len
        )
    }
}

fn check_range(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(BenchError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}
