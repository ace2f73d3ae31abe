use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct FlushStats {
    pub buffered: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub flushed_total: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl FlushStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn record_success(&self, len: usize, elapsed: Duration) {
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        self.flushed_total.fetch_add(len as u64, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }

    /// Returns the number of failures in a row, including this one.
    pub(super) fn record_failure(&self, err: impl Into<String>) -> u64 {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}
