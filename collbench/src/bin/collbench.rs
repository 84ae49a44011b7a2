//! Collective micro-benchmark driver.
//!
//! ```bash
//! # Two ranks in one process, 1 KiB to 1 MiB doubling
//! collbench --local 2 -b 1K -e 1M -f 2
//!
//! # One process per rank; rank 0 also hosts the seed
//! collbench --serve-seed --seed 10.0.0.1:7000 --rank 0 --world-size 2 -b 64M -e 64M
//! collbench --seed 10.0.0.1:7000 --rank 1 --world-size 2 -b 64M -e 64M
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use collbench::bootstrap::{Bootstrap, InitOptions, UniqueId, bootstrap_local};
use collbench::config::{BenchConfig, TestArgs, parse_size};
use collbench::device::HostPlatform;
use collbench::types::ReduceMode;
use collbench::{AllGather, Reporter, RunOutcome, SendRecv};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Collective {
    Allgather,
    Sendrecv,
}

#[derive(Parser, Debug)]
#[command(name = "collbench")]
#[command(about = "Measure collective bandwidth across a process group")]
#[command(version)]
struct Cli {
    /// Smallest size swept (accepts K/M/G suffixes)
    #[arg(short = 'b', long = "minbytes", default_value = "32M")]
    min_bytes: String,

    /// Largest size swept
    #[arg(short = 'e', long = "maxbytes", default_value = "32M")]
    max_bytes: String,

    /// Additive increment between sizes
    #[arg(short = 'i', long = "stepbytes", default_value = "1M")]
    step_bytes: String,

    /// Multiplicative increment between sizes; wins over stepbytes when > 1
    #[arg(short = 'f', long = "stepfactor", default_value_t = 1)]
    step_factor: usize,

    /// Operations captured per graph
    #[arg(short = 'n', long = "iters")]
    iters: Option<u32>,

    /// Untimed runs at both ends of the size range
    #[arg(short = 'w', long = "warmup_iters")]
    warmup_iters: Option<u32>,

    /// Check results (0 or 1)
    #[arg(short = 'c', long = "check", default_value_t = 1)]
    check: u8,

    /// Graph replays per measurement
    #[arg(short = 'G', long = "cudagraph", allow_negative_numbers = true)]
    graph_launches: Option<i64>,

    /// Time reduction: 0 rank0, 1 mean, 2 min, 3 max, 4 sum
    #[arg(short = 'a', long = "average", allow_negative_numbers = true)]
    average: Option<i64>,

    /// Kernel variant of the collective
    #[arg(short = 'k', long = "kernel_num", default_value_t = 0)]
    kernel_num: u32,

    #[arg(long, value_enum, default_value = "allgather")]
    collective: Collective,

    /// Run this many ranks inside this process instead of joining a seed
    #[arg(long, conflicts_with_all = ["seed", "serve_seed"])]
    local: Option<u32>,

    /// Seed address to join, or to bind with --serve-seed
    #[arg(long, env = "COLLBENCH_SEED")]
    seed: Option<SocketAddr>,

    /// Host the seed in this process
    #[arg(long, requires = "seed")]
    serve_seed: bool,

    #[arg(long, env = "RANK")]
    rank: Option<u32>,

    #[arg(long, env = "WORLD_SIZE")]
    world_size: Option<u32>,

    /// Hostname used for node grouping
    #[arg(long)]
    hostname: Option<String>,

    /// Address of this process's mesh listener
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,
}

impl Cli {
    fn test_args(&self) -> Result<TestArgs> {
        if self.check > 1 {
            bail!("invalid check value {}: expected 0 or 1", self.check);
        }
        Ok(TestArgs {
            min_bytes: parse_size(&self.min_bytes)?,
            max_bytes: parse_size(&self.max_bytes)?,
            step_bytes: parse_size(&self.step_bytes)?,
            step_factor: self.step_factor,
            kernel_num: self.kernel_num,
            validate: self.check == 1,
            ..TestArgs::default()
        })
    }

    /// Environment defaults, overridden by explicit flags.
    fn bench_config(&self) -> Result<BenchConfig> {
        let mut config = BenchConfig::from_env();
        if let Some(n) = self.iters {
            config.iters = n;
        }
        if let Some(n) = self.warmup_iters {
            config.warmup_iters = n;
        }
        if let Some(g) = self.graph_launches {
            if g <= 0 {
                bail!("invalid number of graph launches {g}: must be positive");
            }
            config.graph_launches = u32::try_from(g).context("graph launches out of range")?;
        }
        if let Some(a) = self.average {
            config.reduce_mode = ReduceMode::from_flag(a)?;
        }
        config.ensure_valid()?;
        Ok(config)
    }
}

async fn run_rank(
    collective: Collective,
    bootstrap: Arc<Bootstrap>,
    args: TestArgs,
    config: BenchConfig,
) -> collbench::Result<RunOutcome> {
    let platform = HostPlatform::new(bootstrap.ranks_per_node() as usize);
    let mut reporter = Reporter::stdout(bootstrap.rank() == 0);
    match collective {
        Collective::Allgather => {
            collbench::run(bootstrap, &platform, args, config, AllGather::new(), &mut reporter).await
        }
        Collective::Sendrecv => {
            collbench::run(bootstrap, &platform, args, config, SendRecv::new(), &mut reporter).await
        }
    }
}

async fn run_local(cli: &Cli, world_size: u32, args: TestArgs, config: BenchConfig) -> Result<i32> {
    let nodes = bootstrap_local(world_size, &config)
        .await
        .context("forming in-process group")?;
    let handles: Vec<_> = nodes
        .into_iter()
        .map(|node| {
            let (args, config) = (args.clone(), config.clone());
            tokio::spawn(run_rank(cli.collective, Arc::new(node), args, config))
        })
        .collect();

    let mut code = 0;
    for h in handles {
        let outcome = h.await.context("rank task panicked")??;
        code = code.max(outcome.exit_code());
    }
    Ok(code)
}

async fn run_distributed(cli: &Cli, args: TestArgs, config: BenchConfig) -> Result<i32> {
    let world_size = cli.world_size.context("--world-size (or WORLD_SIZE) is required")?;
    let seed_addr = cli.seed.context("--seed (or COLLBENCH_SEED) is required")?;

    let (id, service) = if cli.serve_seed {
        let (id, service) = UniqueId::create(seed_addr, world_size, &config)?;
        tracing::info!(seed = %id, world_size, "seed listening");
        (id, Some(service))
    } else {
        (UniqueId::from_addr(seed_addr), None)
    };

    let options = InitOptions {
        rank: cli.rank,
        world_size,
        hostname: cli.hostname.clone(),
        bind_addr: cli.bind,
    };
    let bootstrap = Bootstrap::initialize(id, options, &config)
        .await
        .context("joining process group")?;
    if let Some(service) = service {
        service.join().await.context("seed formation")?;
    }

    let outcome = run_rank(cli.collective, Arc::new(bootstrap), args, config).await?;
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let args = cli.test_args()?;
    let config = cli.bench_config()?;

    let code = match cli.local {
        Some(0) => bail!("--local needs at least one rank"),
        Some(n) => run_local(&cli, n, args, config).await?,
        None => run_distributed(&cli, args, config).await?,
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("collbench").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&["-b", "1K", "-e", "1M", "-f", "2", "-n", "5", "-G", "3", "-a", "2", "-c", "0"]);
        let args = cli.test_args().unwrap();
        assert_eq!((args.min_bytes, args.max_bytes, args.step_factor), (1024, 1 << 20, 2));
        assert!(!args.validate);

        let config = cli.bench_config().unwrap();
        assert_eq!(config.iters, 5);
        assert_eq!(config.graph_launches, 3);
        assert_eq!(config.reduce_mode, ReduceMode::Min);
    }

    #[test]
    fn test_non_positive_graph_launches_rejected() {
        for g in ["0", "-2"] {
            let err = parse(&["-G", g]).bench_config().unwrap_err();
            assert!(err.to_string().contains("graph launches"), "{err}");
        }
    }

    #[test]
    fn test_unknown_average_mode_rejected() {
        let err = parse(&["-a", "7"]).bench_config().unwrap_err();
        assert!(err.to_string().contains("invalid average mode 7"), "{err}");
        assert!(parse(&["-a", "-1"]).bench_config().is_err());
    }

    #[test]
    fn test_check_flag_above_one_rejected() {
        let err = parse(&["-c", "2"]).test_args().unwrap_err();
        assert!(err.to_string().contains("invalid check value 2"), "{err}");
    }

    #[test]
    fn test_bad_size_suffix_rejected() {
        assert!(parse(&["-b", "12X"]).test_args().is_err());
    }

    #[test]
    fn test_local_conflicts_with_seed() {
        let result = Cli::try_parse_from(["collbench", "--local", "2", "--seed", "127.0.0.1:7000"]);
        assert!(result.is_err());
    }
}
