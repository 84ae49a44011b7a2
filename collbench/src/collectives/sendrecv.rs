use crate::channel::{ChannelStrategy, DirectChannel, DirectChannels, setup_mesh};
use crate::config::TestArgs;
use crate::device::{DeviceBuffer, Platform, Stream, device_op};
use crate::engine::{CollSizes, SetupContext, TestBuffers, TestCollective};
use crate::error::{BenchError, Result};
use crate::types::{ELEMENT_BYTES, Rank};
use std::future::Future;
use std::sync::Arc;

/// Out-of-place ring exchange over direct channels.
///
/// Rank `r` writes its input into the output of rank `r + 1` and waits for
/// rank `r - 1`. Input element `i` on rank `r` is `r * count + i`.
#[derive(Default)]
pub struct SendRecv {
    rank: Rank,
    world: u32,
    count: usize,
    channels: Arc<Vec<DirectChannel>>,
    /// Used for the single-rank case, where the ring is a local copy.
    buffers: Option<TestBuffers>,
}

impl SendRecv {
    pub fn new() -> Self {
        Self::default()
    }

    fn bytes(&self) -> usize {
        self.count * ELEMENT_BYTES
    }

    /// Index of `peer` among the mesh channels (every rank except this one).
    fn channel_index(&self, peer: Rank) -> usize {
        if peer < self.rank {
            peer as usize
        } else {
            peer as usize - 1
        }
    }
}

async fn copy_local(input: &DeviceBuffer, output: &DeviceBuffer, bytes: usize) -> Result<()> {
    let data = input.read(0, bytes)?;
    output.write(0, &data)
}

impl TestCollective for SendRecv {
    fn name(&self) -> &'static str {
        "sendrecv"
    }

    fn in_place(&self) -> bool {
        false
    }

    fn allocate(&mut self, platform: &dyn Platform, args: &TestArgs) -> Result<TestBuffers> {
        if args.kernel_num != 0 {
            return Err(BenchError::Config(format!(
                "sendrecv has no kernel {}",
                args.kernel_num
            )));
        }
        self.rank = args.rank;
        self.world = args.world_size;
        let bytes = args.max_bytes.max(ELEMENT_BYTES);
        let buffers = TestBuffers {
            input: platform.alloc(args.device, bytes)?,
            output: Some(platform.alloc(args.device, bytes)?),
        };
        self.buffers = Some(buffers.clone());
        Ok(buffers)
    }

    fn connect<'a>(&'a mut self, ctx: SetupContext<'a>) -> impl Future<Output = Result<()>> + Send + 'a {
        async move {
            let mesh = setup_mesh(
                ctx.comm,
                ctx.topology,
                &ctx.buffers.input,
                ctx.buffers.output.as_ref(),
            )
            .await?;
            let strategy = DirectChannels {
                wait_timeout: ctx.config.collective_timeout,
            };
            self.channels = Arc::new(strategy.build(&mesh)?);
            Ok(())
        }
    }

    fn prepare(&mut self, _args: &TestArgs, size: usize) {
        self.count = size / ELEMENT_BYTES;
    }

    fn init_data(&self, _args: &TestArgs, buffers: &TestBuffers, expected: &mut Vec<i32>) -> Result<()> {
        let world = self.world.max(1) as usize;
        let rank = self.rank as usize;
        let prev = (rank + world - 1) % world;

        let input: Vec<i32> = (0..self.count).map(|i| (rank * self.count + i) as i32).collect();
        buffers.input.write_i32(0, &input)?;
        if let Some(output) = &buffers.output {
            output.write_i32(0, &vec![-1; self.count])?;
        }

        expected.clear();
        expected.extend((0..self.count).map(|i| (prev * self.count + i) as i32));
        Ok(())
    }

    fn run(&self, _args: &TestArgs, stream: &Stream) -> Result<()> {
        let bytes = self.bytes();
        if self.world <= 1 {
            let buffers = self
                .buffers
                .clone()
                .ok_or_else(|| BenchError::platform("sendrecv launched before allocate"))?;
            let Some(output) = buffers.output else {
                return Err(BenchError::platform("sendrecv needs an output buffer"));
            };
            let input = buffers.input;
            return stream.launch(device_op(move || {
                let (input, output) = (input.clone(), output.clone());
                async move { copy_local(&input, &output, bytes).await }
            }));
        }

        let next = self.channel_index((self.rank + 1) % self.world);
        let prev = self.channel_index((self.rank + self.world - 1) % self.world);
        let channels = Arc::clone(&self.channels);
        if channels.len() != self.world as usize - 1 {
            return Err(BenchError::platform("sendrecv launched before connect"));
        }
        stream.launch(device_op(move || {
            let channels = Arc::clone(&channels);
            async move {
                channels[next].put_with_signal(0, 0, bytes).await?;
                channels[prev].wait().await
            }
        }))
    }

    fn bandwidth(&self, seconds: f64) -> (f64, f64) {
        if seconds <= 0.0 {
            return (0.0, 0.0);
        }
        let bw = self.bytes() as f64 / 1e9 / seconds;
        (bw, bw)
    }

    fn sizes(&self) -> CollSizes {
        let bytes = self.bytes();
        CollSizes {
            send_bytes: bytes,
            recv_bytes: bytes,
            expected_bytes: bytes,
            param_bytes: bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostPlatform;

    fn args(rank: Rank, world: u32) -> TestArgs {
        TestArgs {
            min_bytes: 64,
            max_bytes: 64,
            rank,
            world_size: world,
            ..TestArgs::default()
        }
    }

    #[test]
    fn test_expected_comes_from_previous_rank() {
        let platform = HostPlatform::new(1);
        let mut coll = SendRecv::new();
        let a = args(0, 3);
        let buffers = coll.allocate(&platform, &a).unwrap();
        coll.prepare(&a, 16);
        let mut expected = Vec::new();
        coll.init_data(&a, &buffers, &mut expected).unwrap();
        assert_eq!(expected, vec![8, 9, 10, 11]);
        assert_eq!(buffers.input.read_i32(0, 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(coll.channel_index(2), 1);
    }

    #[tokio::test]
    async fn test_single_rank_copies_locally() {
        let platform = HostPlatform::new(1);
        let mut coll = SendRecv::new();
        let a = args(0, 1);
        let buffers = coll.allocate(&platform, &a).unwrap();
        coll.prepare(&a, 64);
        let mut expected = Vec::new();
        coll.init_data(&a, &buffers, &mut expected).unwrap();

        let stream = Stream::new();
        coll.run(&a, &stream).unwrap();
        stream.synchronize().await.unwrap();
        let output = buffers.output.as_ref().unwrap();
        assert_eq!(output.read_i32(0, 16).unwrap(), expected);
    }

    #[test]
    fn test_bandwidth_is_symmetric() {
        let mut coll = SendRecv::new();
        coll.prepare(&args(0, 2), 1_000_000);
        let (alg, bus) = coll.bandwidth(1e-3);
        assert_eq!(alg, bus);
        assert!((alg - 1.0).abs() < 1e-9);
    }
}
