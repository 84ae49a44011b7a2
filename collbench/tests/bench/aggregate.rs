use collbench::ReduceMode;
use collbench::aggregate::{CountOp, reduce_f64, reduce_u64};

use super::helpers::run_ranks;

#[tokio::test]
async fn test_mean_of_constant() {
    let results = run_ranks(4, |boot| async move {
        reduce_f64(&boot, 2.5e-4, ReduceMode::Mean).await.unwrap()
    })
    .await;
    for v in results {
        assert!((v - 2.5e-4).abs() < 1e-12, "got {v}");
    }
}

#[tokio::test]
async fn test_rank_zero_mode_adopts_rank_zero() {
    let results = run_ranks(3, |boot| async move {
        let value = 1.0 + boot.rank() as f64;
        reduce_f64(&boot, value, ReduceMode::RankZero).await.unwrap()
    })
    .await;
    assert_eq!(results, vec![1.0; 3]);
}

#[tokio::test]
async fn test_count_sum_and_min() {
    let results = run_ranks(3, |boot| async move {
        let value = [4u64, 0, 7][boot.rank() as usize];
        let sum = reduce_u64(&boot, value, CountOp::Sum).await.unwrap();
        let min = reduce_u64(&boot, value, CountOp::Min).await.unwrap();
        (sum, min)
    })
    .await;
    assert_eq!(results, vec![(11, 0); 3]);
}
