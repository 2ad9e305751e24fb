//! Pipeline runner - reads, dispatches and writes lines
//!
//! The reader and writer run on the calling task; only the workers are
//! spawned, so the input and output channels need not be `'static`.

use super::{PipelineError, RunOutcome};
use crate::bus::EventBus;
use crate::metrics::PipelineMetrics;
use bytes::Bytes;
use kaiku_core::{HandlerError, Stage, codec};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Drop reason recorded for undecodable lines
pub const DECODE_ERROR: &str = "decode_error";

/// An input line tagged with its arrival position
struct Line {
    seq: u64,
    bytes: Vec<u8>,
}

/// Worker result for one line: the encoded output, if any
type Written = (u64, Option<Bytes>);

/// Pipeline runner - drives one input channel to completion
pub struct PipelineRunner {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) concurrency: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) metrics: Option<Arc<PipelineMetrics>>,
}

impl PipelineRunner {
    /// Run until end of input, shutdown, or a handler fault
    ///
    /// This will:
    /// 1. Read lines from `input` into the bounded queue
    /// 2. Decode and dispatch them on the worker pool
    /// 3. Write request-stage output to `output` in arrival order
    /// 4. On end of input, drain and return [`RunOutcome::Completed`]
    /// 5. When `shutdown` resolves or the input fails, stop reading, drain
    ///    what is queued and return [`RunOutcome::Interrupted`]
    ///
    /// A handler error or panic aborts the remaining work and is returned.
    pub async fn run<R, W, S>(
        self,
        input: R,
        output: W,
        shutdown: S,
    ) -> Result<RunOutcome, PipelineError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        info!(
            workers = self.concurrency,
            queue_capacity = self.queue_capacity,
            handlers = self.bus.handler_count(),
            "Pipeline started"
        );

        let (line_tx, line_rx) = mpsc::channel::<Line>(self.queue_capacity);
        let (out_tx, out_rx) = mpsc::channel::<Written>(self.queue_capacity);
        let line_rx = Arc::new(Mutex::new(line_rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            workers.spawn(work(
                worker,
                Arc::clone(&line_rx),
                Arc::clone(&self.bus),
                out_tx.clone(),
                self.metrics.clone(),
            ));
        }
        // Workers hold the only senders: the writer ends when they do
        drop(out_tx);

        let reader = async {
            Ok::<_, PipelineError>(read_lines(input, line_tx, shutdown, self.metrics.as_deref()).await)
        };
        let writer = write_lines(output, out_rx, self.metrics.as_deref());
        let joined = join_workers(workers);

        let result = tokio::try_join!(reader, writer, joined);
        let outcome = match result {
            Ok((outcome, (), ())) => outcome,
            Err(e) => {
                error!(error = %e, "Pipeline aborted");
                return Err(e);
            }
        };

        info!(
            ?outcome,
            misses = self.bus.misses(),
            pending = self.bus.pending_count(),
            "Pipeline finished"
        );
        Ok(outcome)
    }

    /// The bus the workers dispatch through
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Worker count
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

/// Read lines into the queue until end of input or shutdown
///
/// Dropping `tx` on return lets the workers drain and exit.
async fn read_lines<R, S>(
    mut input: R,
    tx: mpsc::Sender<Line>,
    shutdown: S,
    metrics: Option<&PipelineMetrics>,
) -> RunOutcome
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut seq = 0u64;

    loop {
        let mut bytes = Vec::new();
        let read = tokio::select! {
            biased;
            () = &mut shutdown => {
                info!(read = seq, "Shutdown requested, draining queue");
                return RunOutcome::Interrupted;
            }
            read = input.read_until(b'\n', &mut bytes) => read,
        };

        match read {
            Ok(0) => {
                debug!(read = seq, "End of input");
                return RunOutcome::Completed;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, read = seq, "Input read failed, draining queue");
                return RunOutcome::Interrupted;
            }
        }
        if bytes.trim_ascii().is_empty() {
            continue;
        }

        if let Some(metrics) = metrics {
            metrics.lines_read.inc();
        }
        let line = Line { seq, bytes };
        seq += 1;

        // A full queue parks the reader here
        let sent = tokio::select! {
            biased;
            () = &mut shutdown => {
                info!(read = seq, "Shutdown requested, draining queue");
                return RunOutcome::Interrupted;
            }
            sent = tx.send(line) => sent,
        };
        if sent.is_err() {
            // All workers are gone; the fault is reported by the join
            return RunOutcome::Interrupted;
        }
    }
}

/// One worker: dequeue, decode, dispatch, hand the result to the writer
async fn work(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Line>>>,
    bus: Arc<EventBus>,
    out: mpsc::Sender<Written>,
    metrics: Option<Arc<PipelineMetrics>>,
) -> Result<(), HandlerError> {
    loop {
        // Decode and admit while holding the queue, so a later stage never
        // overtakes the admission of an earlier one
        let (seq, admitted) = {
            let mut rx = rx.lock().await;
            let Some(line) = rx.recv().await else {
                break;
            };
            match codec::decode(&line.bytes) {
                Ok(msg) => {
                    if let Some(metrics) = &metrics {
                        metrics.record_message(msg.stage());
                    }
                    (line.seq, Some(bus.admit(msg)))
                }
                Err(e) => {
                    warn!(seq = line.seq, error = %e, "Dropping undecodable line");
                    if let Some(metrics) = &metrics {
                        metrics.record_dropped(DECODE_ERROR);
                    }
                    (line.seq, None)
                }
            }
        };

        let written = match admitted {
            Some(admitted) => {
                let stage = admitted.stage();
                match admitted.dispatch().await? {
                    Some(msg) if stage == Stage::Request => Some(codec::encode(&msg)),
                    _ => None,
                }
            }
            None => None,
        };

        if out.send((seq, written)).await.is_err() {
            break;
        }
    }
    debug!(worker, "Worker stopped");
    Ok(())
}

/// Write worker output in arrival order, flushing after each contiguous run
async fn write_lines<W>(
    mut output: W,
    mut rx: mpsc::Receiver<Written>,
    metrics: Option<&PipelineMetrics>,
) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
{
    let mut next = 0u64;
    let mut parked: BTreeMap<u64, Option<Bytes>> = BTreeMap::new();

    while let Some((seq, line)) = rx.recv().await {
        parked.insert(seq, line);

        let mut wrote = false;
        while let Some(line) = parked.remove(&next) {
            if let Some(bytes) = line {
                output.write_all(&bytes).await?;
                if let Some(metrics) = metrics {
                    metrics.lines_written.inc();
                }
                wrote = true;
            }
            next += 1;
        }
        if wrote {
            output.flush().await?;
        }
    }

    if !parked.is_empty() {
        warn!(parked = parked.len(), next, "Output left unwritten after a gap");
    }
    output.flush().await?;
    Ok(())
}

/// Wait for every worker; the first fault aborts the rest
async fn join_workers(mut workers: JoinSet<Result<(), HandlerError>>) -> Result<(), PipelineError> {
    while let Some(joined) = workers.join_next().await {
        let fault = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => PipelineError::Handler(e),
            Err(e) if e.is_panic() => PipelineError::Handler(panicked(e)),
            Err(e) => PipelineError::Task(e.to_string()),
        };
        workers.abort_all();
        return Err(fault);
    }
    Ok(())
}

fn panicked(err: JoinError) -> HandlerError {
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Panicked(message)
}
