use super::{Bootstrap, InitOptions, UniqueId};
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use std::net::SocketAddr;

/// Form a `world_size`-rank process group inside this process, on loopback.
///
/// Every rank runs as a tokio task and reports the same hostname, so the
/// whole group is one node. Returned in rank order.
pub async fn bootstrap_local(world_size: u32, config: &BenchConfig) -> Result<Vec<Bootstrap>> {
    let hosts = vec!["localhost"; world_size as usize];
    bootstrap_local_with_hosts(&hosts, config).await
}

/// Like [`bootstrap_local`], but rank `r` reports `hosts[r]` as its hostname,
/// which lets tests lay ranks out over several emulated nodes.
pub async fn bootstrap_local_with_hosts(hosts: &[&str], config: &BenchConfig) -> Result<Vec<Bootstrap>> {
    let world_size = hosts.len() as u32;
    let loopback: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 0));
    let (id, seed) = UniqueId::create(loopback, world_size, config)?;

    let mut handles = Vec::with_capacity(hosts.len());
    for (rank, host) in hosts.iter().enumerate() {
        let options = InitOptions {
            rank: Some(rank as u32),
            world_size,
            hostname: Some((*host).to_string()),
            bind_addr: loopback,
        };
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            Bootstrap::initialize(id, options, &config).await
        }));
    }

    let mut nodes = Vec::with_capacity(handles.len());
    for h in handles {
        nodes.push(
            h.await
                .map_err(|e| BenchError::transport(format!("worker task panicked: {e}")))??,
        );
    }
    seed.join().await?;

    nodes.sort_by_key(|b| b.rank());
    Ok(nodes)
}
