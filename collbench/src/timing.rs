//! Amortized timing through graph capture and replay.
//!
//! One measurement captures `iters` launches of the operation into a graph,
//! replays it `graph_launches` times back to back and synchronizes once, so
//! per-launch host overhead is spread over `iters * graph_launches` ops.

use crate::bootstrap::Bootstrap;
use crate::config::BenchConfig;
use crate::device::{GraphExec, Stream};
use crate::error::{BenchError, Result};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingState {
    Idle,
    Capturing,
    Captured,
    Replaying,
    Measured,
}

impl TimingState {
    fn name(self) -> &'static str {
        match self {
            TimingState::Idle => "idle",
            TimingState::Capturing => "capturing",
            TimingState::Captured => "captured",
            TimingState::Replaying => "replaying",
            TimingState::Measured => "measured",
        }
    }
}

/// State machine for one capture-replay measurement.
pub struct GraphTimer {
    state: TimingState,
    iters: u32,
    graph: Option<GraphExec>,
    ops: u64,
    started: Option<Instant>,
    elapsed: Duration,
}

impl GraphTimer {
    pub fn new() -> Self {
        Self {
            state: TimingState::Idle,
            iters: 0,
            graph: None,
            ops: 0,
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> TimingState {
        self.state
    }

    fn expect(&self, state: TimingState, action: &'static str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(BenchError::InvalidTimingState {
                action,
                state: self.state.name(),
            })
        }
    }

    pub fn begin_capture(&mut self, stream: &Stream) -> Result<()> {
        self.expect(TimingState::Idle, "begin capture")?;
        stream.begin_capture()?;
        self.state = TimingState::Capturing;
        Ok(())
    }

    /// Record one launch of the operation.
    pub fn record<F>(&mut self, stream: &Stream, mut issue: F) -> Result<()>
    where
        F: FnMut(&Stream) -> Result<()>,
    {
        self.expect(TimingState::Capturing, "record")?;
        if let Err(e) = issue(stream) {
            // Leave the stream usable; the measurement itself is lost.
            let _ = stream.end_capture();
            self.state = TimingState::Idle;
            return Err(e);
        }
        self.iters += 1;
        Ok(())
    }

    pub fn end_capture(&mut self, stream: &Stream) -> Result<()> {
        self.expect(TimingState::Capturing, "end capture")?;
        let graph = stream.end_capture()?;
        self.graph = Some(graph.instantiate()?);
        self.state = TimingState::Captured;
        Ok(())
    }

    /// Launch the graph `launches` times without waiting.
    pub fn replay(&mut self, stream: &Stream, launches: u32) -> Result<()> {
        self.expect(TimingState::Captured, "replay")?;
        let graph = self.graph.as_ref().ok_or(BenchError::InvalidTimingState {
            action: "replay",
            state: "captured without a graph",
        })?;
        self.started = Some(Instant::now());
        for _ in 0..launches {
            graph.launch(stream)?;
        }
        self.ops = u64::from(self.iters) * u64::from(launches);
        self.state = TimingState::Replaying;
        Ok(())
    }

    /// Synchronize and stop the clock.
    pub async fn finish(&mut self, stream: &Stream) -> Result<()> {
        self.expect(TimingState::Replaying, "finish")?;
        stream.synchronize().await?;
        self.elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.state = TimingState::Measured;
        Ok(())
    }

    /// Seconds per operation.
    pub fn per_op_seconds(&self) -> Result<f64> {
        self.expect(TimingState::Measured, "read the time")?;
        if self.ops == 0 {
            return Ok(0.0);
        }
        Ok(self.elapsed.as_secs_f64() / self.ops as f64)
    }
}

impl Default for GraphTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Time one operation on this rank. Collective (barrier before replay).
///
/// `issue` enqueues one instance of the operation on the stream.
pub async fn time_operation<F>(
    bootstrap: &Bootstrap,
    stream: &Stream,
    config: &BenchConfig,
    mut issue: F,
) -> Result<f64>
where
    F: FnMut(&Stream) -> Result<()>,
{
    let mut timer = GraphTimer::new();
    timer.begin_capture(stream)?;
    for _ in 0..config.iters {
        timer.record(stream, &mut issue)?;
    }
    timer.end_capture(stream)?;

    bootstrap.barrier().await?;

    timer.replay(stream, config.graph_launches)?;
    timer.finish(stream).await?;
    timer.per_op_seconds()
}
