use collbench::config::TestArgs;
use collbench::device::{DeviceBuffer, HostPlatform, Platform, Stream, device_op};
use collbench::engine::{CollSizes, SetupContext, TestBuffers, TestCollective};
use collbench::{AllGather, Bootstrap, Reporter, Result, RunOutcome, SendRecv};
use std::future::Future;
use std::sync::Arc;

use super::helpers::{run_ranks, test_config};

const MIB: usize = 1 << 20;

fn one_size(bytes: usize) -> TestArgs {
    TestArgs {
        min_bytes: bytes,
        max_bytes: bytes,
        step_factor: 1,
        validate: true,
        ..TestArgs::default()
    }
}

async fn run_with<C: TestCollective>(
    boot: Arc<Bootstrap>,
    args: TestArgs,
    coll: C,
) -> (RunOutcome, String) {
    let platform = HostPlatform::new(boot.ranks_per_node() as usize);
    let mut reporter = Reporter::captured(boot.rank() == 0);
    let outcome = collbench::run(boot, &platform, args, test_config(), coll, &mut reporter)
        .await
        .unwrap();
    (outcome, reporter.text().to_string())
}

/// Wraps a collective and overwrites three received elements on rank 1
/// once the collective has completed on the stream.
struct Corrupted<C> {
    inner: C,
    recv: Option<DeviceBuffer>,
}

impl<C> Corrupted<C> {
    fn new(inner: C) -> Self {
        Self { inner, recv: None }
    }
}

impl<C: TestCollective> TestCollective for Corrupted<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn in_place(&self) -> bool {
        self.inner.in_place()
    }

    fn allocate(&mut self, platform: &dyn Platform, args: &TestArgs) -> Result<TestBuffers> {
        let buffers = self.inner.allocate(platform, args)?;
        self.recv = Some(buffers.recv().clone());
        Ok(buffers)
    }

    fn connect<'a>(&'a mut self, ctx: SetupContext<'a>) -> impl Future<Output = Result<()>> + Send + 'a {
        self.inner.connect(ctx)
    }

    fn prepare(&mut self, args: &TestArgs, size: usize) {
        self.inner.prepare(args, size)
    }

    fn init_data(&self, args: &TestArgs, buffers: &TestBuffers, expected: &mut Vec<i32>) -> Result<()> {
        self.inner.init_data(args, buffers, expected)
    }

    fn run(&self, args: &TestArgs, stream: &Stream) -> Result<()> {
        self.inner.run(args, stream)?;
        if let (1, Some(recv)) = (args.rank, &self.recv) {
            let recv = recv.clone();
            stream.launch(device_op(move || {
                let recv = recv.clone();
                async move { recv.write_i32(0, &[-7, -7, -7]) }
            }))?;
        }
        Ok(())
    }

    fn bandwidth(&self, seconds: f64) -> (f64, f64) {
        self.inner.bandwidth(seconds)
    }

    fn sizes(&self) -> CollSizes {
        self.inner.sizes()
    }
}

#[tokio::test]
async fn test_allgather_2_ranks_validates() {
    let results = run_ranks(2, |boot| async move {
        run_with(boot, one_size(MIB), AllGather::new()).await
    })
    .await;

    let (outcome, text) = &results[0];
    assert_eq!(outcome.rows.len(), 1);
    let row = &outcome.rows[0];
    assert_eq!(row.size, MIB);
    assert_eq!(row.count, MIB / 4 / 2);
    assert!(row.in_place);
    assert_eq!(row.wrong, Some(0));
    assert!(row.time_sec > 0.0);
    assert!(text.contains("# Using devices\n#  Rank  0 Pid"));
    assert!(text.contains("#  Rank  1 Pid"));
    assert!(text.ends_with("# Out of bounds values : 0 OK\n#\n"), "{text}");

    for (outcome, _) in &results {
        assert_eq!(outcome.exit_code(), 0);
    }
    assert!(results[1].0.rows.is_empty());
    assert!(results[1].1.is_empty());
}

#[tokio::test]
async fn test_corrupted_received_data_is_reported() {
    let results = run_ranks(2, |boot| async move {
        run_with(boot, one_size(MIB), Corrupted::new(AllGather::new())).await
    })
    .await;

    let (outcome, text) = &results[0];
    assert_eq!(outcome.rows[0].wrong, Some(3));
    assert!(text.contains("FAILED"));
    for (outcome, _) in &results {
        assert!(outcome.errors > 0);
        assert_eq!(outcome.exit_code(), 1);
    }
}

#[tokio::test]
async fn test_allgather_kernel_1_three_ranks() {
    let results = run_ranks(3, |boot| async move {
        let args = TestArgs {
            kernel_num: 1,
            ..one_size(96 * 1024)
        };
        run_with(boot, args, AllGather::new()).await
    })
    .await;
    let row = &results[0].0.rows[0];
    assert_eq!(row.wrong, Some(0));
    assert_eq!(row.count, 96 * 1024 / 4 / 3);
}

#[tokio::test]
async fn test_sendrecv_ring_out_of_place() {
    let results = run_ranks(3, |boot| async move {
        run_with(boot, one_size(64 * 1024), SendRecv::new()).await
    })
    .await;
    let (outcome, text) = &results[0];
    let row = &outcome.rows[0];
    assert!(!row.in_place);
    assert_eq!(row.wrong, Some(0));
    assert_eq!(row.algbw, row.busbw);
    assert!(text.contains("# Out of bounds values : 0 OK"));
}

#[tokio::test]
async fn test_multiplicative_sweep_rows() {
    let results = run_ranks(2, |boot| async move {
        let args = TestArgs {
            min_bytes: 1024,
            max_bytes: 8192,
            step_factor: 2,
            ..one_size(0)
        };
        run_with(boot, args, SendRecv::new()).await
    })
    .await;
    let sizes: Vec<usize> = results[0].0.rows.iter().map(|r| r.size).collect();
    assert_eq!(sizes, vec![1024, 2048, 4096, 8192]);
    assert!(results[0].0.rows.iter().all(|r| r.wrong == Some(0)));
}

#[tokio::test]
async fn test_max_bytes_clamped_to_memory() {
    let results = run_ranks(2, |boot| async move {
        let platform = HostPlatform::new(2).with_total_memory((1 << 30) + 3 * 4096);
        let mut reporter = Reporter::captured(boot.rank() == 0);
        let args = TestArgs {
            min_bytes: 1024,
            max_bytes: 1 << 20,
            step_factor: 4,
            ..one_size(0)
        };
        let outcome = collbench::run(boot, &platform, args, test_config(), SendRecv::new(), &mut reporter)
            .await
            .unwrap();
        (outcome, reporter.text().to_string())
    })
    .await;
    let (outcome, text) = &results[0];
    assert!(text.contains("# Reducing maxBytes to 4096 due to memory limitation"));
    let sizes: Vec<usize> = outcome.rows.iter().map(|r| r.size).collect();
    assert_eq!(sizes, vec![1024, 4096]);
}

#[tokio::test]
async fn test_device_memory_released_after_run() {
    let results = run_ranks(2, |boot| async move {
        let platform = HostPlatform::new(boot.ranks_per_node() as usize);
        let device = boot.local_rank() as usize;
        let args = TestArgs {
            validate: false,
            ..one_size(64 * 1024)
        };
        for _ in 0..2 {
            let mut reporter = Reporter::captured(false);
            let outcome = collbench::run(
                Arc::clone(&boot),
                &platform,
                args.clone(),
                test_config(),
                SendRecv::new(),
                &mut reporter,
            )
            .await
            .unwrap();
            assert_eq!(outcome.rows.len(), usize::from(boot.rank() == 0));
            boot.barrier().await.unwrap();
            assert_eq!(platform.used_memory(device), 0);
        }
    })
    .await;
    assert_eq!(results.len(), 2);
}
