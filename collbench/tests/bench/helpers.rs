use collbench::bootstrap::bootstrap_local_with_hosts;
use collbench::{BenchConfig, Bootstrap};
use std::sync::Arc;
use std::time::Duration;

/// Small iteration counts and short timeouts so failures surface quickly.
pub fn test_config() -> BenchConfig {
    BenchConfig {
        iters: 2,
        warmup_iters: 1,
        graph_launches: 2,
        collective_timeout: Duration::from_secs(10),
        setup_timeout: Duration::from_secs(10),
        ..BenchConfig::default()
    }
}

/// Run `f` once per rank of an in-process group, one task per rank.
/// Results come back in rank order.
pub async fn run_ranks<F, Fut, T>(world_size: u32, f: F) -> Vec<T>
where
    F: Fn(Arc<Bootstrap>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let hosts = vec!["localhost"; world_size as usize];
    run_ranks_on_hosts(&hosts, f).await
}

/// Like [`run_ranks`], with rank `r` reporting `hosts[r]` as its hostname.
pub async fn run_ranks_on_hosts<F, Fut, T>(hosts: &[&str], f: F) -> Vec<T>
where
    F: Fn(Arc<Bootstrap>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let nodes = bootstrap_local_with_hosts(hosts, &test_config())
        .await
        .unwrap();
    let nodes: Vec<Arc<Bootstrap>> = nodes.into_iter().map(Arc::new).collect();

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(node).await }));
    }
    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.await.unwrap());
    }
    results
}
