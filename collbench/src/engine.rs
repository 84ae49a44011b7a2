//! The sweep loop shared by every collective under test.
//!
//! A [`TestCollective`] knows how to size, connect, fill and launch one
//! collective. [`TestEngine`] drives it: warm-up, then for every swept size
//! a timed measurement, an optional validation run and a report row.

use crate::aggregate::{CountOp, reduce_f64, reduce_u64};
use crate::bootstrap::Bootstrap;
use crate::channel::ChannelService;
use crate::check::check;
use crate::comm::Communicator;
use crate::config::{BenchConfig, TestArgs};
use crate::device::{DeviceBuffer, Platform, Stream};
use crate::error::{BenchError, Result};
use crate::report::{Reporter, ResultRow};
use crate::timing::time_operation;
use crate::topology::RankTopology;
use crate::types::ELEMENT_BYTES;
use std::future::Future;
use std::sync::Arc;

/// Device buffers of one run, sized for the largest swept size.
#[derive(Debug, Clone)]
pub struct TestBuffers {
    pub input: DeviceBuffer,
    /// `None` for in-place collectives.
    pub output: Option<DeviceBuffer>,
}

impl TestBuffers {
    /// The buffer results land in.
    pub fn recv(&self) -> &DeviceBuffer {
        self.output.as_ref().unwrap_or(&self.input)
    }
}

/// Byte counts of the current problem instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollSizes {
    pub send_bytes: usize,
    pub recv_bytes: usize,
    pub expected_bytes: usize,
    /// Bytes the collective is parameterized by; reported as a count.
    pub param_bytes: usize,
}

/// Everything a collective needs to build its channels.
pub struct SetupContext<'a> {
    pub comm: &'a Communicator,
    pub topology: &'a RankTopology,
    pub service: &'a Arc<ChannelService>,
    pub buffers: &'a TestBuffers,
    pub config: &'a BenchConfig,
}

pub trait TestCollective: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn in_place(&self) -> bool;

    /// Allocate buffers for sizes up to `args.max_bytes` on `args.device`.
    fn allocate(&mut self, platform: &dyn Platform, args: &TestArgs) -> Result<TestBuffers>;

    /// Connect to peers and build channels. Collective.
    fn connect<'a>(&'a mut self, ctx: SetupContext<'a>) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Size the problem for `size` bytes.
    fn prepare(&mut self, args: &TestArgs, size: usize);

    /// Fill the input for the current size and compute the expected result.
    fn init_data(&self, args: &TestArgs, buffers: &TestBuffers, expected: &mut Vec<i32>) -> Result<()>;

    /// Enqueue one instance of the collective on `stream`.
    fn run(&self, args: &TestArgs, stream: &Stream) -> Result<()>;

    /// `(algbw, busbw)` in GB/s for one op taking `seconds`.
    fn bandwidth(&self, seconds: f64) -> (f64, f64);

    fn sizes(&self) -> CollSizes;
}

pub struct TestEngine<C: TestCollective> {
    args: TestArgs,
    config: BenchConfig,
    coll: C,
    bootstrap: Arc<Bootstrap>,
    comm: Communicator,
    service: Arc<ChannelService>,
    stream: Stream,
    buffers: Option<TestBuffers>,
    expected: Vec<i32>,
    errors: u64,
}

impl<C: TestCollective> TestEngine<C> {
    pub fn new(args: TestArgs, config: BenchConfig, coll: C, bootstrap: Arc<Bootstrap>) -> Self {
        let service = ChannelService::new(config.collective_timeout);
        Self {
            comm: Communicator::new(Arc::clone(&bootstrap)),
            args,
            config,
            coll,
            bootstrap,
            service,
            stream: Stream::new(),
            buffers: None,
            expected: Vec::new(),
            errors: 0,
        }
    }

    pub fn args(&self) -> &TestArgs {
        &self.args
    }

    pub fn collective(&self) -> &C {
        &self.coll
    }

    /// Rows with at least one mismatch on some rank, seen by this process.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn allocate(&mut self, platform: &dyn Platform) -> Result<()> {
        let buffers = self.coll.allocate(platform, &self.args)?;
        if self.coll.in_place() != buffers.output.is_none() {
            return Err(BenchError::platform(format!(
                "{} allocated buffers that do not match its in-place mode",
                self.coll.name()
            )));
        }
        self.buffers = Some(buffers);
        Ok(())
    }

    fn buffers(&self) -> Result<&TestBuffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| BenchError::platform("buffers used before allocate"))
    }

    /// Build channels, complete setup and start the proxy. Collective.
    pub async fn setup(&mut self) -> Result<()> {
        let topology = RankTopology::new(
            self.args.rank,
            self.args.world_size,
            self.args.ranks_per_node,
            self.args.device,
        )?;
        let buffers = self.buffers()?.clone();
        let ctx = SetupContext {
            comm: &self.comm,
            topology: &topology,
            service: &self.service,
            buffers: &buffers,
            config: &self.config,
        };
        self.coll.connect(ctx).await?;
        self.comm.finalize_setup().await?;
        self.service.start_proxy();
        tracing::debug!(rank = self.args.rank, collective = self.coll.name(), "setup complete");
        Ok(())
    }

    async fn warm_up(&mut self, size: usize) -> Result<()> {
        self.coll.prepare(&self.args, size);
        self.bootstrap.barrier().await?;
        for _ in 0..self.config.warmup_iters {
            self.coll.run(&self.args, &self.stream)?;
        }
        self.stream.synchronize().await
    }

    async fn validate(&mut self, size: usize) -> Result<u64> {
        let buffers = self.buffers()?.clone();
        self.coll.prepare(&self.args, size);
        self.coll.init_data(&self.args, &buffers, &mut self.expected)?;
        self.bootstrap.barrier().await?;
        self.coll.run(&self.args, &self.stream)?;
        self.stream.synchronize().await?;

        let count = self.coll.sizes().recv_bytes / ELEMENT_BYTES;
        let expected = self.expected.get(..count).ok_or_else(|| {
            BenchError::platform(format!(
                "{} produced {} expected elements, {count} needed",
                self.coll.name(),
                self.expected.len()
            ))
        })?;
        let local = check(buffers.recv(), expected)?;
        if local > 0 {
            tracing::warn!(rank = self.args.rank, size, mismatches = local, "data check failed");
        }
        reduce_u64(&self.bootstrap, local, CountOp::Sum).await
    }

    /// Warm up, then measure (and optionally validate) every swept size.
    ///
    /// Rows are printed and returned on the reporting rank only.
    pub async fn run_test(&mut self, reporter: &mut Reporter) -> Result<Vec<ResultRow>> {
        let buffers = self.buffers()?.clone();
        self.warm_up(self.args.max_bytes).await?;
        self.warm_up(self.args.min_bytes).await?;

        reporter.header();

        let mut rows = Vec::new();
        for size in self.args.sizes() {
            self.coll.prepare(&self.args, size);
            self.coll.init_data(&self.args, &buffers, &mut self.expected)?;
            let sizes = self.coll.sizes();

            let seconds = {
                let coll = &self.coll;
                let args = &self.args;
                time_operation(&self.bootstrap, &self.stream, &self.config, |s| coll.run(args, s))
                    .await?
            };
            let seconds = reduce_f64(&self.bootstrap, seconds, self.config.reduce_mode).await?;

            let wrong = if self.args.validate {
                let global = self.validate(size).await?;
                if global > 0 {
                    self.errors += 1;
                }
                Some(global)
            } else {
                None
            };

            let (algbw, busbw) = self.coll.bandwidth(seconds);
            let row = ResultRow {
                size: sizes.send_bytes.max(sizes.expected_bytes),
                count: sizes.param_bytes / ELEMENT_BYTES,
                in_place: self.coll.in_place(),
                time_sec: seconds,
                algbw,
                busbw,
                wrong,
            };
            if reporter.is_enabled() {
                reporter.row(&row);
                rows.push(row);
            }
        }
        reporter.print("\n");
        Ok(rows)
    }
}
