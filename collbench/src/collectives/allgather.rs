use crate::channel::{ChannelStrategy, IndexedChannels, SimpleChannel, setup_mesh};
use crate::config::TestArgs;
use crate::device::{Platform, Stream, device_op};
use crate::engine::{CollSizes, SetupContext, TestBuffers, TestCollective};
use crate::error::{BenchError, Result};
use crate::types::{ELEMENT_BYTES, Rank};
use std::future::Future;
use std::sync::Arc;

/// In-place all-gather over indexed channels.
///
/// Rank `r` owns elements `[r * count, (r + 1) * count)` of the buffer and
/// writes them into the same range of every peer's buffer. Element `g` of
/// the gathered buffer holds `g`.
///
/// Kernel 0 signals each peer right after its put; kernel 1 issues every
/// put first and signals afterwards.
#[derive(Default)]
pub struct AllGather {
    rank: Rank,
    world: u32,
    kernel: u32,
    /// Elements contributed per rank.
    count: usize,
    channels: Arc<Vec<SimpleChannel>>,
}

impl AllGather {
    pub const KERNELS: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    fn chunk_bytes(&self) -> usize {
        self.count * ELEMENT_BYTES
    }
}

impl TestCollective for AllGather {
    fn name(&self) -> &'static str {
        "allgather"
    }

    fn in_place(&self) -> bool {
        true
    }

    fn allocate(&mut self, platform: &dyn Platform, args: &TestArgs) -> Result<TestBuffers> {
        if args.kernel_num >= Self::KERNELS {
            return Err(BenchError::Config(format!(
                "allgather has no kernel {} (0..{})",
                args.kernel_num,
                Self::KERNELS
            )));
        }
        self.rank = args.rank;
        self.world = args.world_size;
        self.kernel = args.kernel_num;
        let input = platform.alloc(args.device, args.max_bytes.max(ELEMENT_BYTES))?;
        Ok(TestBuffers {
            input,
            output: None,
        })
    }

    fn connect<'a>(&'a mut self, ctx: SetupContext<'a>) -> impl Future<Output = Result<()>> + Send + 'a {
        async move {
            let mesh = setup_mesh(ctx.comm, ctx.topology, &ctx.buffers.input, None).await?;
            let strategy = IndexedChannels {
                service: Arc::clone(ctx.service),
            };
            self.channels = Arc::new(strategy.build(&mesh)?);
            Ok(())
        }
    }

    fn prepare(&mut self, _args: &TestArgs, size: usize) {
        self.count = size / ELEMENT_BYTES / self.world.max(1) as usize;
    }

    fn init_data(&self, _args: &TestArgs, buffers: &TestBuffers, expected: &mut Vec<i32>) -> Result<()> {
        let total = self.count * self.world as usize;
        let first = self.rank as usize * self.count;

        let mut data = vec![-1i32; total];
        for (i, v) in data[first..first + self.count].iter_mut().enumerate() {
            *v = (first + i) as i32;
        }
        buffers.input.write_i32(0, &data)?;

        expected.clear();
        expected.extend((0..total).map(|g| g as i32));
        Ok(())
    }

    fn run(&self, _args: &TestArgs, stream: &Stream) -> Result<()> {
        let channels = Arc::clone(&self.channels);
        let chunk = self.chunk_bytes();
        let offset = self.rank as usize * chunk;
        let kernel = self.kernel;
        stream.launch(device_op(move || {
            let channels = Arc::clone(&channels);
            async move {
                if kernel == 0 {
                    for ch in channels.iter() {
                        ch.put_with_signal(offset, offset, chunk).await?;
                    }
                } else {
                    for ch in channels.iter() {
                        ch.put(offset, offset, chunk).await?;
                    }
                    for ch in channels.iter() {
                        ch.signal().await?;
                    }
                }
                for ch in channels.iter() {
                    ch.wait().await?;
                }
                Ok(())
            }
        }))
    }

    fn bandwidth(&self, seconds: f64) -> (f64, f64) {
        if seconds <= 0.0 {
            return (0.0, 0.0);
        }
        let world = self.world as f64;
        let alg = (self.chunk_bytes() as f64 * world) / 1e9 / seconds;
        (alg, alg * (world - 1.0) / world)
    }

    fn sizes(&self) -> CollSizes {
        let chunk = self.chunk_bytes();
        CollSizes {
            send_bytes: chunk,
            recv_bytes: chunk * self.world as usize,
            expected_bytes: chunk * self.world as usize,
            param_bytes: chunk,
        }
    }
}
