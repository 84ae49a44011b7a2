//! Cross-rank reductions of scalars.
//!
//! Every rank gathers every contribution and folds them in rank order, so
//! all ranks compute bit-identical results.

use crate::bootstrap::Bootstrap;
use crate::error::{BenchError, Result};
use crate::types::{Rank, ReduceMode};

fn decode<const N: usize>(rank: usize, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| BenchError::CollectiveFailed {
        operation: "all_reduce",
        rank: rank as Rank,
        reason: format!("expected {N} bytes, got {}", bytes.len()),
    })
}

/// Fold per-rank values (indexed by rank) with `mode`.
pub fn fold_f64(values: &[f64], mode: ReduceMode) -> f64 {
    match mode {
        ReduceMode::RankZero => values.first().copied().unwrap_or(0.0),
        ReduceMode::Sum => values.iter().sum(),
        ReduceMode::Mean if values.is_empty() => 0.0,
        ReduceMode::Mean => values.iter().sum::<f64>() / values.len() as f64,
        ReduceMode::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        ReduceMode::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Reduce `value` across all ranks. Collective: every rank passes the same
/// `mode`.
pub async fn reduce_f64(bootstrap: &Bootstrap, value: f64, mode: ReduceMode) -> Result<f64> {
    let gathered = bootstrap.all_gather_bytes(&value.to_le_bytes()).await?;
    let values = gathered
        .iter()
        .enumerate()
        .map(|(r, b)| decode::<8>(r, b).map(f64::from_le_bytes))
        .collect::<Result<Vec<f64>>>()?;
    Ok(fold_f64(&values, mode))
}

/// Integer reductions used for counters and capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOp {
    Sum,
    Min,
    Max,
}

pub async fn reduce_u64(bootstrap: &Bootstrap, value: u64, op: CountOp) -> Result<u64> {
    let gathered = bootstrap.all_gather_bytes(&value.to_le_bytes()).await?;
    let values = gathered
        .iter()
        .enumerate()
        .map(|(r, b)| decode::<8>(r, b).map(u64::from_le_bytes))
        .collect::<Result<Vec<u64>>>()?;
    Ok(match op {
        CountOp::Sum => values.iter().fold(0u64, |acc, v| acc.saturating_add(*v)),
        CountOp::Min => values.iter().copied().min().unwrap_or(0),
        CountOp::Max => values.iter().copied().max().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_modes() {
        let v = [4.0, 1.0, 7.0, 2.0];
        assert_eq!(fold_f64(&v, ReduceMode::RankZero), 4.0);
        assert_eq!(fold_f64(&v, ReduceMode::Sum), 14.0);
        assert_eq!(fold_f64(&v, ReduceMode::Mean), 3.5);
        assert_eq!(fold_f64(&v, ReduceMode::Min), 1.0);
        assert_eq!(fold_f64(&v, ReduceMode::Max), 7.0);
    }

    #[test]
    fn test_mean_of_constant() {
        for n in 1..=8 {
            let v = vec![0.25; n];
            assert_eq!(fold_f64(&v, ReduceMode::Mean), 0.25);
        }
    }
}
