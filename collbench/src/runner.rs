//! Entry point of one benchmark run: preamble, setup, sweep and epilogue.

use crate::aggregate::{CountOp, reduce_u64};
use crate::bootstrap::Bootstrap;
use crate::config::{BenchConfig, TestArgs, clamp_max_bytes};
use crate::device::Platform;
use crate::engine::{TestCollective, TestEngine};
use crate::error::{BenchError, Result};
use crate::report::{Reporter, ResultRow};
use std::sync::Arc;

/// What a run produced on this process.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Report rows; empty on non-reporting ranks.
    pub rows: Vec<ResultRow>,
    /// Failed rows summed over every rank.
    pub errors: u64,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.errors == 0
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

fn preamble(args: &TestArgs, config: &BenchConfig) -> String {
    let (step, unit) = if args.step_factor > 1 {
        (args.step_factor, "factor")
    } else {
        (args.step_bytes, "bytes")
    };
    format!(
        "# minBytes {} maxBytes {} step: {}({}) warmup iters: {} iters: {} validation: {} graph: {} kernel num: {}\n#\n# Using devices\n",
        args.min_bytes,
        args.max_bytes,
        step,
        unit,
        config.warmup_iters,
        config.iters,
        u8::from(args.validate),
        config.graph_launches,
        args.kernel_num,
    )
}

fn device_line(args: &TestArgs, hostname: &str, platform: &dyn Platform) -> Result<String> {
    let props = platform.properties(args.device)?;
    Ok(format!(
        "#  Rank {:>2} Pid {:>6} on {:>10} device {:>2} [{}] {}\n",
        args.rank,
        std::process::id(),
        hostname,
        args.device,
        props.pci_bus_id,
        props.name
    ))
}

/// Run `coll` across the sweep described by `args`.
///
/// Rank, world size and node layout in `args` are taken from `bootstrap`;
/// the device is the local rank. Every rank must call this. Only rank 0
/// writes to `reporter`.
pub async fn run<C: TestCollective>(
    bootstrap: Arc<Bootstrap>,
    platform: &dyn Platform,
    mut args: TestArgs,
    config: BenchConfig,
    coll: C,
    reporter: &mut Reporter,
) -> Result<RunOutcome> {
    args.rank = bootstrap.rank();
    args.world_size = bootstrap.world_size();
    args.ranks_per_node = bootstrap.ranks_per_node();
    args.local_rank = bootstrap.local_rank();
    args.device = args.local_rank as usize;
    args.ensure_valid()?;
    config.ensure_valid()?;

    let device_count = platform.device_count()?;
    if args.device >= device_count {
        return Err(BenchError::Config(format!(
            "local rank {} has no device: {device_count} device(s) visible",
            args.local_rank
        )));
    }

    reporter.print(&preamble(&args, &config));
    let line = device_line(&args, bootstrap.hostname(), platform)?;
    if let Some(lines) = bootstrap.gather_bytes(0, line.as_bytes()).await? {
        for line in lines {
            reporter.print(&String::from_utf8_lossy(&line));
        }
    }

    let total = platform.properties(args.device)?.total_memory;
    let min_total = reduce_u64(&bootstrap, total, CountOp::Min).await?;
    if let Some(max) = clamp_max_bytes(args.max_bytes, min_total, config.reserved_bytes, args.validate) {
        reporter.print(&format!(
            "#\n# Reducing maxBytes to {max} due to memory limitation\n"
        ));
        tracing::warn!(rank = args.rank, from = args.max_bytes, to = max, "clamping max bytes");
        args.max_bytes = max;
        args.min_bytes = args.min_bytes.min(max);
    }

    platform.set_device(args.device)?;
    reporter.print("#\n# Initializing collbench\n");
    let mut engine = TestEngine::new(args, config, coll, Arc::clone(&bootstrap));
    engine.allocate(platform)?;

    reporter.print("# Setting up the connection in collbench\n");
    engine.setup().await?;
    bootstrap.barrier().await?;

    let rows = engine.run_test(reporter).await?;
    let errors = reduce_u64(&bootstrap, engine.errors(), CountOp::Sum).await?;
    reporter.print(&format!(
        "# Out of bounds values : {errors} {}\n#\n",
        if errors == 0 { "OK" } else { "FAILED" }
    ));
    tracing::info!(rank = bootstrap.rank(), errors, "run finished");

    Ok(RunOutcome { rows, errors })
}
