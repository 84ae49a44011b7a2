//! Element-wise result checks on the `i32` view of a buffer.

use crate::device::DeviceBuffer;
use crate::error::Result;

/// Number of positions where `received` differs from `expected`.
///
/// Elements missing from either side count as mismatches.
pub fn count_mismatches(received: &[i32], expected: &[i32]) -> u64 {
    let differing = received
        .iter()
        .zip(expected)
        .filter(|(r, e)| r != e)
        .count();
    (differing + received.len().abs_diff(expected.len())) as u64
}

/// Compare the first `expected.len()` elements of `buffer` against
/// `expected`, with one copy off the device.
pub fn check(buffer: &DeviceBuffer, expected: &[i32]) -> Result<u64> {
    let received = buffer.read_i32(0, expected.len())?;
    Ok(count_mismatches(&received, expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostPlatform, Platform};

    #[test]
    fn test_count_mismatches() {
        assert_eq!(count_mismatches(&[1, 2, 3], &[1, 2, 3]), 0);
        assert_eq!(count_mismatches(&[1, 0, 3, 0], &[1, 2, 3, 4]), 2);
        assert_eq!(count_mismatches(&[1, 2], &[1, 2, 3]), 1);
    }

    #[test]
    fn test_check_device_buffer() {
        let platform = HostPlatform::new(1);
        let buf = platform.alloc(0, 64).unwrap();
        let expected: Vec<i32> = (0..16).collect();
        buf.write_i32(0, &expected).unwrap();
        assert_eq!(check(&buf, &expected).unwrap(), 0);

        buf.write_i32(5, &[-1, -1, -1]).unwrap();
        assert_eq!(check(&buf, &expected).unwrap(), 3);
        assert_eq!(check(&buf, &expected[..4]).unwrap(), 0);
        assert!(check(&buf, &vec![0; 17]).is_err());
    }
}
