//! Run parameters for the benchmark.
//!
//! [`BenchConfig`] holds the tunables (iteration counts, reduction mode,
//! timeouts) with defaults that can be overridden via environment variables
//! prefixed `COLLBENCH_`. [`TestArgs`] describes one sweep: the size range
//! and this process's place in the cluster. Both are passed explicitly to
//! every component; nothing here is global.

use crate::error::{BenchError, Result};
use crate::types::{Rank, ReduceMode};
use std::time::Duration;

/// Bytes kept free on every device when clamping the largest size.
pub const DEFAULT_RESERVED_BYTES: u64 = 1 << 30;

/// Tuning parameters for timing, aggregation and the transport.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Operations captured into one graph.
    pub iters: u32,

    /// Untimed runs before the sweep, at both ends of the size range.
    pub warmup_iters: u32,

    /// Times the captured graph is replayed per measurement.
    pub graph_launches: u32,

    /// How per-rank times are combined into the reported time.
    pub reduce_mode: ReduceMode,

    /// Device memory left untouched when clamping the largest size.
    pub reserved_bytes: u64,

    /// Timeout for individual receives, barriers and channel waits.
    pub collective_timeout: Duration,

    /// Timeout for bootstrap and setup finalization.
    pub setup_timeout: Duration,

    /// Shared secret checked by the seed during bootstrap.
    pub cluster_token: Vec<u8>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iters: 20,
            warmup_iters: 10,
            graph_launches: 15,
            reduce_mode: ReduceMode::Mean,
            reserved_bytes: DEFAULT_RESERVED_BYTES,
            collective_timeout: Duration::from_secs(30),
            setup_timeout: Duration::from_secs(60),
            cluster_token: Vec::new(),
        }
    }
}

impl BenchConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `COLLBENCH_ITERS`
    /// - `COLLBENCH_WARMUP_ITERS`
    /// - `COLLBENCH_GRAPH_LAUNCHES`
    /// - `COLLBENCH_AVERAGE` (0 rank0, 1 mean, 2 min, 3 max, 4 sum)
    /// - `COLLBENCH_RESERVED_BYTES`
    /// - `COLLBENCH_COLLECTIVE_TIMEOUT_SECS`
    /// - `COLLBENCH_SETUP_TIMEOUT_SECS`
    /// - `COLLBENCH_CLUSTER_TOKEN`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("COLLBENCH_ITERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.iters = n;
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_WARMUP_ITERS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.warmup_iters = n;
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_GRAPH_LAUNCHES") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.graph_launches = n;
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_AVERAGE") {
            match v.parse::<i64>().map(ReduceMode::from_flag) {
                Ok(Ok(mode)) => cfg.reduce_mode = mode,
                _ => tracing::warn!("ignoring invalid COLLBENCH_AVERAGE={v}"),
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_RESERVED_BYTES") {
            if let Ok(n) = parse_size(&v) {
                cfg.reserved_bytes = n as u64;
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_COLLECTIVE_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.collective_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_SETUP_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.setup_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("COLLBENCH_CLUSTER_TOKEN") {
            cfg.cluster_token = v.into_bytes();
        }

        cfg
    }

    /// Reject values the timing loop cannot work with.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.iters == 0 {
            return Err(BenchError::Config("iters must be at least 1".into()));
        }
        if self.graph_launches == 0 {
            return Err(BenchError::Config(
                "graph launches must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One sweep's size range plus this process's coordinates in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestArgs {
    pub min_bytes: usize,
    pub max_bytes: usize,
    /// Additive increment, used when `step_factor <= 1`.
    pub step_bytes: usize,
    /// Multiplicative increment, used when greater than 1.
    pub step_factor: usize,
    pub world_size: u32,
    pub rank: Rank,
    /// Device ordinal used by this process.
    pub device: usize,
    pub local_rank: u32,
    pub ranks_per_node: u32,
    /// Selects a kernel variant within the collective under test.
    pub kernel_num: u32,
    /// Check received data after each timed size.
    pub validate: bool,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            min_bytes: 32 << 20,
            max_bytes: 32 << 20,
            step_bytes: 1 << 20,
            step_factor: 1,
            world_size: 1,
            rank: 0,
            device: 0,
            local_rank: 0,
            ranks_per_node: 1,
            kernel_num: 0,
            validate: true,
        }
    }
}

impl TestArgs {
    /// Reject size ranges the sweep would never finish or never start.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.min_bytes > self.max_bytes {
            return Err(BenchError::Config(format!(
                "invalid sizes for 'minbytes' and 'maxbytes': {} > {}",
                self.min_bytes, self.max_bytes
            )));
        }
        if self.min_bytes < self.max_bytes {
            if self.step_factor > 1 && self.min_bytes == 0 {
                return Err(BenchError::Config(
                    "a multiplicative step needs 'minbytes' > 0".into(),
                ));
            }
            if self.step_factor <= 1 && self.step_bytes == 0 {
                return Err(BenchError::Config(
                    "'stepbytes' must be positive when 'stepfactor' <= 1".into(),
                ));
            }
        }
        if self.world_size == 0 {
            return Err(BenchError::Config("world size must be positive".into()));
        }
        if self.rank >= self.world_size {
            return Err(BenchError::InvalidRank {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        if self.ranks_per_node == 0 {
            return Err(BenchError::Config("ranks per node must be positive".into()));
        }
        Ok(())
    }

    /// The sizes visited by the sweep, in order.
    pub fn sizes(&self) -> SizeSweep {
        SizeSweep::new(
            self.min_bytes,
            self.max_bytes,
            self.step_bytes,
            self.step_factor,
        )
    }

    pub fn is_main_proc(&self) -> bool {
        self.rank == 0
    }
}

/// Iterator over swept sizes: `min`, then `x * factor` when the factor is
/// above 1, otherwise `x + step`, while the value stays at or below `max`.
#[derive(Debug, Clone)]
pub struct SizeSweep {
    next: Option<usize>,
    max: usize,
    step_bytes: usize,
    step_factor: usize,
}

impl SizeSweep {
    pub fn new(min: usize, max: usize, step_bytes: usize, step_factor: usize) -> Self {
        Self {
            next: Some(min),
            max,
            step_bytes,
            step_factor,
        }
    }
}

impl Iterator for SizeSweep {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next.filter(|&s| s <= self.max)?;
        let following = if self.step_factor > 1 {
            cur.checked_mul(self.step_factor)
        } else {
            cur.checked_add(self.step_bytes)
        };
        // A step that makes no progress yields the current size once.
        self.next = following.filter(|&n| n > cur);
        Some(cur)
    }
}

/// Parse a byte count such as `4096`, `64K`, `1.5M` or `2g`.
///
/// Suffixes are binary (K = 1024) and case-insensitive.
pub fn parse_size(input: &str) -> Result<usize> {
    let invalid = || BenchError::InvalidSize {
        input: input.to_string(),
    };
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let units: f64 = match suffix.trim() {
        "" => 1.0,
        "k" | "K" => 1024.0,
        "m" | "M" => 1024.0 * 1024.0,
        "g" | "G" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };
    let bytes = value * units;
    if !bytes.is_finite() || bytes > usize::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as usize)
}

/// Clamp the largest swept size to what fits in device memory.
///
/// `min_total_memory` is the smallest total device memory across all ranks.
/// Returns `Some(new_max)` when the size had to be reduced.
pub fn clamp_max_bytes(
    max_bytes: usize,
    min_total_memory: u64,
    reserved_bytes: u64,
    validate: bool,
) -> Option<usize> {
    let buffers = if validate { 3 } else { 2 };
    let limit = min_total_memory.saturating_sub(reserved_bytes) / buffers;
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    (max_bytes > limit).then_some(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("32M").unwrap(), 32 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert_eq!(parse_size("1.5M").unwrap(), 3 << 19);
        assert_eq!(parse_size(" 8 K ").unwrap(), 8192);
    }

    #[test]
    fn test_parse_size_invalid() {
        for bad in ["", "abc", "12Q", "-4K", "1..2", "K"] {
            assert!(parse_size(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_additive_sweep() {
        let sizes: Vec<usize> = SizeSweep::new(1024, 4096, 1024, 1).collect();
        assert_eq!(sizes, vec![1024, 2048, 3072, 4096]);

        // Stops at the largest value not above max.
        let sizes: Vec<usize> = SizeSweep::new(100, 350, 100, 0).collect();
        assert_eq!(sizes, vec![100, 200, 300]);
    }

    #[test]
    fn test_multiplicative_sweep() {
        let sizes: Vec<usize> = SizeSweep::new(8, 100, 999, 2).collect();
        assert_eq!(sizes, vec![8, 16, 32, 64]);
    }

    #[test]
    fn test_sweep_properties_over_ranges() {
        for min in [1usize, 3, 64, 1000] {
            for max in [min, min * 5 + 7, min * 64] {
                for step in [1usize, 7, 512] {
                    let sizes: Vec<usize> = SizeSweep::new(min, max, step, 1).collect();
                    assert_eq!(sizes[0], min);
                    assert!(sizes.windows(2).all(|w| w[1] == w[0] + step));
                    let last = *sizes.last().unwrap();
                    assert!(last <= max && last + step > max);
                }
                for factor in [2usize, 3, 10] {
                    let sizes: Vec<usize> = SizeSweep::new(min, max, 0, factor).collect();
                    assert_eq!(sizes[0], min);
                    assert!(sizes.windows(2).all(|w| w[1] == w[0] * factor));
                    let last = *sizes.last().unwrap();
                    assert!(last <= max && last * factor > max);
                }
            }
        }
    }

    #[test]
    fn test_single_size_without_step() {
        let sizes: Vec<usize> = SizeSweep::new(1 << 20, 1 << 20, 0, 1).collect();
        assert_eq!(sizes, vec![1 << 20]);
    }

    #[test]
    fn test_empty_sweep_when_min_above_max() {
        assert_eq!(SizeSweep::new(10, 5, 1, 1).count(), 0);
    }

    #[test]
    fn test_args_validation() {
        let mut args = TestArgs::default();
        assert!(args.ensure_valid().is_ok());

        args.min_bytes = args.max_bytes + 1;
        let err = args.ensure_valid().unwrap_err();
        assert!(err.to_string().contains("minbytes"), "got: {err}");

        let mut args = TestArgs {
            min_bytes: 1024,
            max_bytes: 4096,
            step_bytes: 0,
            ..TestArgs::default()
        };
        assert!(args.ensure_valid().is_err());
        args.step_factor = 2;
        assert!(args.ensure_valid().is_ok());

        let args = TestArgs {
            rank: 2,
            world_size: 2,
            ..TestArgs::default()
        };
        assert!(matches!(
            args.ensure_valid(),
            Err(BenchError::InvalidRank { .. })
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(BenchConfig::default().ensure_valid().is_ok());
        let cfg = BenchConfig {
            graph_launches: 0,
            ..BenchConfig::default()
        };
        assert!(cfg.ensure_valid().is_err());
        let cfg = BenchConfig {
            iters: 0,
            ..BenchConfig::default()
        };
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn test_clamp_bounds() {
        let gib: u64 = 1 << 30;
        for total in [2 * gib, 5 * gib, 16 * gib, 80 * gib] {
            for validate in [true, false] {
                let divisor = if validate { 3 } else { 2 };
                let limit = ((total - gib) / divisor) as usize;
                let clamped = clamp_max_bytes(usize::MAX, total, gib, validate).unwrap();
                assert_eq!(clamped, limit);
                assert!(clamped as u64 <= (total - gib) / divisor);
                assert_eq!(clamp_max_bytes(limit, total, gib, validate), None);
            }
        }
    }

    #[test]
    fn test_clamp_tiny_device() {
        assert_eq!(clamp_max_bytes(4096, 1 << 20, 1 << 30, true), Some(0));
    }
}
