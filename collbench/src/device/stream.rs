use crate::error::{BenchError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// A unit of device work. Ops are re-invocable so a captured graph can
/// replay them; each invocation returns a fresh future.
pub type DeviceOp = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`DeviceOp`].
pub fn device_op<F, Fut>(f: F) -> DeviceOp
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

enum Command {
    Run(DeviceOp),
    Fence(oneshot::Sender<Result<()>>),
}

/// An in-order execution queue, the host side's handle on device work.
///
/// Ops launched on a stream run one after another on a background task; the
/// host only waits at [`Stream::synchronize`]. The first failing op poisons
/// the stream: later ops are skipped and the error is returned by the next
/// synchronize. While capturing, launched ops are recorded into a [`Graph`]
/// instead of running.
pub struct Stream {
    tx: mpsc::UnboundedSender<Command>,
    capture: Mutex<Option<Vec<DeviceOp>>>,
}

impl Stream {
    /// Create a stream. Must be called within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(rx));
        Self {
            tx,
            capture: Mutex::new(None),
        }
    }

    /// Enqueue (or record, while capturing) one op.
    pub fn launch(&self, op: DeviceOp) -> Result<()> {
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| BenchError::LockPoisoned("stream capture"))?;
        if let Some(ops) = capture.as_mut() {
            ops.push(op);
            return Ok(());
        }
        self.tx
            .send(Command::Run(op))
            .map_err(|_| BenchError::Stream("stream worker stopped".into()))
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn begin_capture(&self) -> Result<()> {
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| BenchError::LockPoisoned("stream capture"))?;
        if capture.is_some() {
            return Err(BenchError::Stream("capture already in progress".into()));
        }
        *capture = Some(Vec::new());
        Ok(())
    }

    pub fn end_capture(&self) -> Result<Graph> {
        let mut capture = self
            .capture
            .lock()
            .map_err(|_| BenchError::LockPoisoned("stream capture"))?;
        let ops = capture
            .take()
            .ok_or_else(|| BenchError::Stream("end_capture without begin_capture".into()))?;
        Ok(Graph { ops })
    }

    /// Wait for every op launched so far and report the first failure.
    pub async fn synchronize(&self) -> Result<()> {
        if self.is_capturing() {
            return Err(BenchError::Stream(
                "synchronize is not permitted during capture".into(),
            ));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Fence(done_tx))
            .map_err(|_| BenchError::Stream("stream worker stopped".into()))?;
        done_rx
            .await
            .map_err(|_| BenchError::Stream("stream worker stopped".into()))?
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_queue(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut failed: Option<BenchError> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Run(op) => {
                if failed.is_some() {
                    continue;
                }
                if let Err(e) = op().await {
                    tracing::warn!("stream op failed, skipping remaining work: {e}");
                    failed = Some(e);
                }
            }
            Command::Fence(done) => {
                let _ = done.send(failed.take().map_or(Ok(()), Err));
            }
        }
    }
}

/// Ops recorded between `begin_capture` and `end_capture`.
pub struct Graph {
    ops: Vec<DeviceOp>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Freeze the recording into a launchable graph.
    pub fn instantiate(self) -> Result<GraphExec> {
        Ok(GraphExec {
            ops: self.ops.into(),
        })
    }
}

/// An instantiated graph; each launch enqueues every recorded op in order.
#[derive(Clone)]
pub struct GraphExec {
    ops: Arc<[DeviceOp]>,
}

impl GraphExec {
    pub fn launch(&self, stream: &Stream) -> Result<()> {
        for op in self.ops.iter() {
            stream.launch(Arc::clone(op))?;
        }
        Ok(())
    }
}
