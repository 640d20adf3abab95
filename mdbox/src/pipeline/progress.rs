use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives row progress from pipeline workers.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, rows_done: usize, rows_total: usize);
}

/// Reports progress through `log::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, rows_done: usize, rows_total: usize) {
        let percent = if rows_total == 0 {
            100.0
        } else {
            rows_done as f64 * 100.0 / rows_total as f64
        };
        log::info!("Processed {}/{} rows ({:.1}%)", rows_done, rows_total, percent);
    }
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _rows_done: usize, _rows_total: usize) {}
}

/// Cooperative cancellation flag shared between a caller and a running
/// pipeline. Checked before each chunk is dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
