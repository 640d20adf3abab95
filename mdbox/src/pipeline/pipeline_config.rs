use crate::errors::{BoxError, BoxResult};

/// Samples a worker buffers before flushing into the tree
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Upper bound on converted samples between two split checks
pub const DEFAULT_MAX_SAMPLES_PER_PASS: usize = 10_000_000;

/// Upper bound on rows per dispatched chunk
pub const DEFAULT_CHUNK_ROW_COUNT: usize = 4096;

/// Rows between two progress reports
pub const DEFAULT_PROGRESS_INTERVAL_ROWS: usize = 1000;

/// Chunks queued per worker within one pass
const CHUNKS_PER_WORKER: usize = 4;

/// Sizing of a population run, computed once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub buffer_capacity: usize,
    pub chunk_row_count: usize,
    pub max_samples_per_pass: usize,
    pub progress_interval_rows: usize,
}

/// Rows per chunk and per pass for one input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub rows_per_chunk: usize,
    pub rows_per_pass: usize,
}

impl PipelineConfig {
    /// Sizes worker buffers so that all of them together hold at most a
    /// quarter of `memory_budget_samples`, which also becomes the per-pass
    /// sample cap.
    pub fn for_workers(worker_count: usize, memory_budget_samples: usize) -> Self {
        let worker_count = worker_count.max(1);
        let max_samples_per_pass = memory_budget_samples.max(1);
        let buffer_capacity =
            (max_samples_per_pass / (worker_count * CHUNKS_PER_WORKER)).clamp(1, DEFAULT_BUFFER_CAPACITY);
        PipelineConfig {
            worker_count,
            buffer_capacity,
            chunk_row_count: DEFAULT_CHUNK_ROW_COUNT,
            max_samples_per_pass,
            progress_interval_rows: DEFAULT_PROGRESS_INTERVAL_ROWS,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_chunk_row_count(mut self, rows: usize) -> Self {
        self.chunk_row_count = rows;
        self
    }

    pub fn with_max_samples_per_pass(mut self, samples: usize) -> Self {
        self.max_samples_per_pass = samples;
        self
    }

    pub fn with_progress_interval_rows(mut self, rows: usize) -> Self {
        self.progress_interval_rows = rows;
        self
    }

    pub fn validate(&self) -> BoxResult<()> {
        let fields = [
            ("worker_count", self.worker_count),
            ("buffer_capacity", self.buffer_capacity),
            ("chunk_row_count", self.chunk_row_count),
            ("max_samples_per_pass", self.max_samples_per_pass),
            ("progress_interval_rows", self.progress_interval_rows),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
            return Err(BoxError::InvalidConfiguration(format!(
                "{} must be positive",
                name
            )));
        }
        Ok(())
    }

    /// Chunk sizing for a table of `rows` rows holding `samples` samples.
    ///
    /// A chunk yields roughly `max_samples_per_pass / (workers * 4)`
    /// samples, capped at `chunk_row_count` rows; a pass covers about
    /// `max_samples_per_pass` samples and at least one chunk.
    pub fn plan(&self, rows: usize, samples: usize) -> ChunkPlan {
        let bins_per_row = (samples / rows.max(1)).max(1);
        let samples_per_chunk =
            (self.max_samples_per_pass / (self.worker_count.max(1) * CHUNKS_PER_WORKER)).max(1);
        let rows_per_chunk = (samples_per_chunk / bins_per_row).clamp(1, self.chunk_row_count.max(1));
        let rows_per_pass = (self.max_samples_per_pass / bins_per_row).max(rows_per_chunk);
        ChunkPlan {
            rows_per_chunk,
            rows_per_pass,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or_else(|err| {
                log::warn!("Failed to detect available parallelism: {}. Using one worker.", err);
                1
            });
        Self::for_workers(workers, DEFAULT_MAX_SAMPLES_PER_PASS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_workers_scales_buffers() {
        let config = PipelineConfig::for_workers(4, 1600);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.buffer_capacity, 100);
        assert_eq!(config.max_samples_per_pass, 1600);
        assert!(config.validate().is_ok());

        let big = PipelineConfig::for_workers(2, usize::MAX / 16);
        assert_eq!(big.buffer_capacity, DEFAULT_BUFFER_CAPACITY);

        let zero = PipelineConfig::for_workers(0, 0);
        assert_eq!(zero.worker_count, 1);
        assert!(zero.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = PipelineConfig::for_workers(2, 100).with_buffer_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(BoxError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_plan() {
        let config = PipelineConfig::for_workers(2, 800).with_chunk_row_count(50);
        // 10 bins per row: 100 samples per chunk, 80 rows per pass
        let plan = config.plan(1000, 10_000);
        assert_eq!(plan.rows_per_chunk, 10);
        assert_eq!(plan.rows_per_pass, 80);

        // rows with many bins still get one row per chunk
        let wide = config.plan(10, 100_000);
        assert_eq!(wide.rows_per_chunk, 1);
        assert_eq!(wide.rows_per_pass, 1);

        // the row cap applies to sparse rows
        let sparse = config.plan(1000, 1000);
        assert_eq!(sparse.rows_per_chunk, 50);
    }

    #[test]
    fn test_default_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.worker_count >= 1);
        assert!(config.validate().is_ok());
    }
}
