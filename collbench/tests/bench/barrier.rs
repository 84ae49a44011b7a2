use super::helpers::run_ranks;

#[tokio::test]
async fn test_barrier_2_ranks() {
    run_ranks(2, |boot| async move {
        boot.barrier().await.unwrap();
        boot.barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_barrier_6_ranks_dissemination() {
    run_ranks(6, |boot| async move {
        boot.barrier().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_all_gather_bytes_in_rank_order() {
    let gathered = run_ranks(3, |boot| async move {
        let mine = vec![boot.rank() as u8; boot.rank() as usize + 1];
        boot.all_gather_bytes(&mine).await.unwrap()
    })
    .await;
    for per_rank in gathered {
        assert_eq!(per_rank, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
    }
}
