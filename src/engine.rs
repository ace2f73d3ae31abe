//! Buffer and flush engine.
//!
//! Records are appended under one short-lived buffer lock. Every flush, whatever
//! triggered it, first takes the flush gate, so at most one batch is in flight.
//! The sink write happens with the gate held but the buffer lock released, which
//! keeps `append` prompt while a slow write is running.

mod stats;


pub use stats::FlushStats;

use crate::error::{AppendError, PersistenceError, ShutdownError};
use crate::record::Record;
use crate::sink::{PersistenceSink, RawRow};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Backlog size (in multiples of the batch size) at which a failing sink is reported loudly.
const BACKLOG_WARN_MULTIPLIER: usize = 10;
// Stand-in deadline for intervals too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushPolicy {
    pub max_buffer_size: usize,
    pub flush_interval: Duration,
}

impl FlushPolicy {
    pub fn new(max_buffer_size: usize, flush_interval: Duration) -> Self {
        Self {
            max_buffer_size: max_buffer_size.max(1),
            flush_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub count: usize,
    pub trigger: FlushTrigger,
}

#[derive(Debug, Default)]
struct BufferState {
    records: VecDeque<Record>,
    closed: bool,
    // A failed batch sits at the front; the next flush of any kind takes everything.
    retry_pending: bool,
}

impl BufferState {
    fn take_all(&mut self) -> Vec<Record> {
        self.records.drain(..).collect()
    }

    fn take_front(&mut self, n: usize) -> Vec<Record> {
        let n = n.min(self.records.len());
        self.records.drain(..n).collect()
    }

    /// Size-triggered batches are capped at `max_buffer_size` unless a failed
    /// batch is waiting, in which case the retry carries the whole merged buffer.
    fn take_size_batch(&mut self, max_buffer_size: usize) -> Vec<Record> {
        if self.retry_pending {
            self.take_all()
        } else {
            self.take_front(max_buffer_size)
        }
    }

    fn requeue_front(&mut self, batch: Vec<Record>) {
        let newer = std::mem::take(&mut self.records);
        self.records = VecDeque::from(batch);
        self.records.extend(newer);
        self.retry_pending = true;
    }
}

struct EngineInner<S> {
    sink: S,
    policy: FlushPolicy,
    buffer: Mutex<BufferState>,
    flush_gate: Arc<AsyncMutex<()>>,
    timer_reset: Notify,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
    stats: Arc<FlushStats>,
}

/// Cloneable handle to a running engine. All clones share one buffer.
pub struct FlushEngine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for FlushEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: PersistenceSink> FlushEngine<S> {
    /// Build the engine and start its interval timer. Must run inside a Tokio runtime.
    pub fn start(sink: S, policy: FlushPolicy) -> Self {
        let inner = Arc::new(EngineInner {
            sink,
            policy,
            buffer: Mutex::new(BufferState::default()),
            flush_gate: Arc::new(AsyncMutex::new(())),
            timer_reset: Notify::new(),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
            stats: Arc::new(FlushStats::new()),
        });
        let handle = spawn_timer(inner.clone());
        *lock(&inner.timer) = Some(handle);
        tracing::debug!(
            max_buffer_size = policy.max_buffer_size,
            flush_interval_ms = policy.flush_interval.as_millis() as u64,
            "flush engine started"
        );
        Self { inner }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.inner.policy
    }

    pub fn stats(&self) -> Arc<FlushStats> {
        self.inner.stats.clone()
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.inner.buffer).records.len()
    }

    /// Queue a record. Never waits on the sink.
    ///
    /// Reaching the size threshold moves the oldest `max_buffer_size` records (or,
    /// after a failed write, the whole buffer) into a batch right here and hands the
    /// write to a background task. If another flush is already in flight the
    /// records stay buffered for the next one.
    pub fn append(&self, record: Record) -> Result<(), AppendError> {
        let (gate, batch) = {
            let mut buffer = lock(&self.inner.buffer);
            if buffer.closed {
                return Err(AppendError::Closed(Box::new(record)));
            }
            buffer.records.push_back(record);
            let len = buffer.records.len();
            self.inner
                .stats
                .buffered
                .store(len as u64, Ordering::Relaxed);
            if len < self.inner.policy.max_buffer_size {
                return Ok(());
            }
            let Ok(gate) = self.inner.flush_gate.clone().try_lock_owned() else {
                tracing::trace!(len, "flush in flight; size-triggered flush deferred");
                return Ok(());
            };
            let batch = buffer.take_size_batch(self.inner.policy.max_buffer_size);
            self.inner
                .stats
                .buffered
                .store(buffer.records.len() as u64, Ordering::Relaxed);
            (gate, batch)
        };
        self.inner.spawn_size_flush(gate, batch);
        Ok(())
    }

    /// Flush everything currently buffered, waiting for any in-flight flush first.
    pub async fn flush_now(&self) -> Result<FlushResult, PersistenceError> {
        self.inner.flush_all(FlushTrigger::Manual).await
    }

    /// Stop the timer, drain the buffer once, and release the sink.
    ///
    /// Returns `Ok(None)` on every call after the first.
    pub async fn shutdown(&self) -> Result<Option<FlushResult>, ShutdownError> {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            tracing::debug!("flush engine already shut down");
            return Ok(None);
        }

        lock(&self.inner.buffer).closed = true;
        self.inner.cancel.cancel();
        let timer = lock(&self.inner.timer).take();
        if let Some(handle) = timer {
            if let Err(err) = handle.await {
                tracing::warn!(error=%err, "flush timer task failed");
            }
        }

        let flushed = self.inner.flush_all(FlushTrigger::Shutdown).await;
        let released = self.inner.sink.close().await;

        match flushed {
            Ok(result) => {
                released.map_err(ShutdownError::Release)?;
                tracing::info!(count = result.count, "final flush complete");
                Ok(Some(result))
            }
            Err(source) => {
                if let Err(err) = released {
                    tracing::warn!(error=%err, "failed to release sink after failed final flush");
                }
                let pending = self.buffered_len();
                tracing::error!(error=%source, pending, "final flush failed; buffered records will be lost");
                Err(ShutdownError::FinalFlush { pending, source })
            }
        }
    }
}

impl<S: PersistenceSink> EngineInner<S> {
    fn spawn_size_flush(self: &Arc<Self>, gate: OwnedMutexGuard<()>, batch: Vec<Record>) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.write(batch, FlushTrigger::Size).await {
                Ok(_) => inner.release_or_continue(gate),
                Err(err) => {
                    tracing::warn!(error=%err, "flush on batch size failed");
                    drop(gate);
                }
            }
        });
    }

    /// After a successful flush: chain another size-triggered flush if the buffer
    /// filled up meanwhile, otherwise release the gate under the buffer lock so the
    /// next `append` sees it free.
    fn release_or_continue(self: &Arc<Self>, gate: OwnedMutexGuard<()>) {
        let mut buffer = lock(&self.buffer);
        if buffer.records.len() >= self.policy.max_buffer_size {
            let batch = buffer.take_size_batch(self.policy.max_buffer_size);
            self.stats
                .buffered
                .store(buffer.records.len() as u64, Ordering::Relaxed);
            drop(buffer);
            self.spawn_size_flush(gate, batch);
        } else {
            drop(gate);
        }
    }

    async fn flush_all(self: &Arc<Self>, trigger: FlushTrigger) -> Result<FlushResult, PersistenceError> {
        let gate = self.flush_gate.clone().lock_owned().await;
        let batch = {
            let mut buffer = lock(&self.buffer);
            let batch = buffer.take_all();
            self.stats.buffered.store(0, Ordering::Relaxed);
            batch
        };
        if batch.is_empty() {
            return Ok(FlushResult { count: 0, trigger });
        }
        let result = self.write(batch, trigger).await;
        if result.is_ok() {
            self.release_or_continue(gate);
        }
        result
    }

    /// Write one batch with the gate held. On failure the batch goes back to the
    /// front of the buffer, ahead of anything appended during the write.
    async fn write(&self, batch: Vec<Record>, trigger: FlushTrigger) -> Result<FlushResult, PersistenceError> {
        let len = batch.len();
        let started = Instant::now();
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);

        let result = match batch
            .iter()
            .map(RawRow::from_record)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(rows) => self.sink.write_batch(&rows).await,
            Err(err) => Err(err.into()),
        };

        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);
        self.timer_reset.notify_one();

        match result {
            Ok(written) => {
                if written != len {
                    tracing::warn!(written, len, "sink reported a different row count than submitted");
                }
                lock(&self.buffer).retry_pending = false;
                let elapsed = started.elapsed();
                self.stats.record_success(len, elapsed);
                tracing::info!(
                    len,
                    trigger = trigger.as_str(),
                    micros = elapsed.as_micros() as u64,
                    "flushed records to database"
                );
                Ok(FlushResult { count: len, trigger })
            }
            Err(err) => {
                let failures = self.stats.record_failure(err.to_string());
                let backlog = {
                    let mut buffer = lock(&self.buffer);
                    buffer.requeue_front(batch);
                    let backlog = buffer.records.len();
                    self.stats
                        .buffered
                        .store(backlog as u64, Ordering::Relaxed);
                    backlog
                };
                tracing::error!(
                    error=%err,
                    len,
                    backlog,
                    failures,
                    trigger = trigger.as_str(),
                    "failed to flush records; batch requeued"
                );
                if backlog >= self.policy.max_buffer_size.saturating_mul(BACKLOG_WARN_MULTIPLIER) {
                    tracing::warn!(backlog, failures, "buffer backlog growing while sink is failing");
                }
                Err(err)
            }
        }
    }
}

fn spawn_timer<S: PersistenceSink>(inner: Arc<EngineInner<S>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = inner.policy.flush_interval;
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                _ = inner.timer_reset.notified() => {
                    sleep.as_mut().reset(deadline_after(interval));
                }
                _ = &mut sleep => {
                    match inner.flush_all(FlushTrigger::Interval).await {
                        Ok(result) if result.count > 0 => {
                            tracing::debug!(count = result.count, "timer triggered flush");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error=%err, "flush on interval failed"),
                    }
                    sleep.as_mut().reset(deadline_after(interval));
                }
            }
        }
        tracing::debug!("flush timer stopped");
    })
}

fn deadline_after(interval: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(interval).unwrap_or(now + FAR_FUTURE)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
