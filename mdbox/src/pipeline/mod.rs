//! Parallel population of a box tree from a table of spectra.
//!
//! Rows are cut into contiguous chunks and handed to a fixed pool of
//! scoped worker threads through a bounded channel, in ascending row order.
//! Each worker converts its samples into events, buffers them and flushes
//! the buffer into the tree under the shared side of a tree-wide
//! `RwLock`; inserts into different leaves proceed in parallel because each
//! leaf has its own lock. A pass ends when its chunks are drained and the
//! workers joined. Between passes the pipeline takes the exclusive side of
//! the lock to run the split pass the controller asks for.

pub mod pipeline_config;
pub mod pipeline_report;
pub mod progress;

pub use pipeline_config::{ChunkPlan, PipelineConfig};
pub use pipeline_report::{DropCounts, PopulationReport};
pub use progress::{CancellationToken, LogProgress, NoProgress, ProgressReporter};

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver};
use parking_lot::RwLock;

use crate::converter::{CoordinateConverter, RowContext};
use crate::errors::{BoxError, BoxResult};
use crate::event::{MdEvent, OriginId};
use crate::input::SpectrumSource;
use crate::tree::BoxTree;

/// A populated tree and the report of the run that filled it.
#[derive(Debug)]
pub struct Populated {
    pub tree: BoxTree,
    pub report: PopulationReport,
}

/// Converts a [`SpectrumSource`] into events and inserts them into a tree.
pub struct PopulationPipeline {
    config: PipelineConfig,
    cancellation: CancellationToken,
    progress: Box<dyn ProgressReporter>,
}

impl PopulationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        PopulationPipeline {
            config,
            cancellation: CancellationToken::new(),
            progress: Box::new(LogProgress),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_progress<P: ProgressReporter + 'static>(mut self, progress: P) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Populates `tree` from `source`.
    ///
    /// Dropped samples are counted in the report. When cancelled, the rows
    /// already dispatched are still inserted, the tree is restructured as
    /// usual and both the report and the tree are marked incomplete.
    ///
    /// # Errors
    ///
    /// Fails before inserting anything if the configuration is invalid, the
    /// table is empty or inconsistent, or the converter and the tree
    /// disagree on the number of dimensions. The tree is dropped then.
    pub fn run(
        &self,
        tree: BoxTree,
        source: &dyn SpectrumSource,
        converter: &dyn CoordinateConverter,
    ) -> BoxResult<Populated> {
        self.config.validate()?;
        source.validate()?;
        if converter.ndim() != tree.ndim() {
            return Err(BoxError::DimensionMismatch {
                expected: tree.ndim(),
                actual: converter.ndim(),
            });
        }

        let rows_total = source.row_count();
        let plan = self.config.plan(rows_total, source.sample_count());
        log::info!(
            "Populating {}-dimensional tree from {} rows with {} workers ({} rows per chunk, {} rows per pass)",
            tree.ndim(),
            rows_total,
            self.config.worker_count,
            plan.rows_per_chunk,
            plan.rows_per_pass
        );

        let tree = RwLock::new(tree);
        let processed = AtomicUsize::new(0);
        let shared = Shared {
            tree: &tree,
            source,
            converter,
            progress: self.progress.as_ref(),
            processed: &processed,
            rows_total,
            buffer_capacity: self.config.buffer_capacity,
            progress_interval: self.config.progress_interval_rows,
        };

        let mut report = PopulationReport {
            rows_total,
            ..PopulationReport::default()
        };
        let mut added_since_check = 0;
        let mut next_row = 0;

        while next_row < rows_total && !self.cancellation.is_cancelled() {
            let end = (next_row + plan.rows_per_pass).min(rows_total);
            let pass = self.run_pass(&shared, next_row..end, plan.rows_per_chunk);
            next_row = pass.dispatched_end;
            report.samples_added += pass.tally.added;
            report.dropped += pass.tally.dropped;
            added_since_check += pass.tally.added;

            let mut tree = tree.write();
            if tree
                .controller()
                .should_split(tree.event_count(), added_since_check, tree.len())
            {
                let split = tree.split_if_needed();
                report.split_passes += 1;
                added_since_check = 0;
                log::info!(
                    "Split pass {}: {} boxes split, tree has {} boxes and {} events",
                    report.split_passes,
                    split,
                    tree.len(),
                    tree.event_count()
                );
            }
        }

        report.complete = next_row == rows_total;
        report.rows_processed = processed.load(Ordering::Relaxed);

        let mut tree = tree.into_inner();
        loop {
            let split = tree.split_if_needed();
            if split == 0 {
                break;
            }
            report.split_passes += 1;
            log::info!(
                "Split pass {}: {} boxes split, tree has {} boxes",
                report.split_passes,
                split,
                tree.len()
            );
        }
        tree.refresh_cache();
        tree.set_complete(report.complete);

        if report.complete {
            log::info!(
                "Population finished: {} samples added, dropped {}",
                report.samples_added,
                report.dropped
            );
        } else {
            log::warn!(
                "Population cancelled after {}/{} rows: {} samples added, dropped {}",
                report.rows_processed,
                rows_total,
                report.samples_added,
                report.dropped
            );
        }

        Ok(Populated { tree, report })
    }

    /// Dispatches `rows` in chunks to freshly scoped workers and joins them.
    fn run_pass(&self, shared: &Shared<'_>, rows: Range<usize>, rows_per_chunk: usize) -> PassOutcome {
        let workers = self.config.worker_count;
        let (sender, receiver) = bounded::<Range<usize>>(workers);
        let mut dispatched_end = rows.start;

        let tallies: Vec<WorkerTally> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let receiver = receiver.clone();
                    s.spawn(move || shared.work(receiver))
                })
                .collect();
            drop(receiver);

            let mut start = rows.start;
            while start < rows.end {
                if self.cancellation.is_cancelled() {
                    log::info!("Cancellation requested, stopping dispatch at row {}", start);
                    break;
                }
                let end = (start + rows_per_chunk).min(rows.end);
                if sender.send(start..end).is_err() {
                    break;
                }
                start = end;
            }
            dispatched_end = start;
            drop(sender);

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut tally = WorkerTally::default();
        for t in tallies {
            tally.added += t.added;
            tally.dropped += t.dropped;
        }
        PassOutcome {
            dispatched_end,
            tally,
        }
    }
}

/// Populates `tree` with the default pipeline configuration.
pub fn populate(
    tree: BoxTree,
    source: &dyn SpectrumSource,
    converter: &dyn CoordinateConverter,
) -> BoxResult<Populated> {
    PopulationPipeline::new(PipelineConfig::default()).run(tree, source, converter)
}

#[derive(Debug, Default)]
struct WorkerTally {
    added: u64,
    dropped: DropCounts,
}

struct PassOutcome {
    dispatched_end: usize,
    tally: WorkerTally,
}

/// State every worker of a run reads.
struct Shared<'a> {
    tree: &'a RwLock<BoxTree>,
    source: &'a dyn SpectrumSource,
    converter: &'a dyn CoordinateConverter,
    progress: &'a dyn ProgressReporter,
    processed: &'a AtomicUsize,
    rows_total: usize,
    buffer_capacity: usize,
    progress_interval: usize,
}

impl Shared<'_> {
    fn work(&self, chunks: Receiver<Range<usize>>) -> WorkerTally {
        let mut tally = WorkerTally::default();
        let mut buffer = Vec::with_capacity(self.buffer_capacity);
        let mut coordinate = vec![0.0; self.converter.ndim()];

        for rows in chunks.iter() {
            let count = rows.len();
            for row in rows {
                self.convert_row(row, &mut coordinate, &mut buffer, &mut tally);
            }
            self.record_progress(count);
        }
        self.flush(&mut buffer, &mut tally);
        tally
    }

    fn convert_row(
        &self,
        row: usize,
        coordinate: &mut [f64],
        buffer: &mut Vec<MdEvent>,
        tally: &mut WorkerTally,
    ) {
        let bins = self.source.bin_count(row);
        let detector = match self.source.usable_detector(row) {
            Some(detector) => detector,
            None => {
                tally.dropped.invalid_row += bins as u64;
                log::trace!("Skipping row {}: no usable detector", row);
                return;
            }
        };
        let origin_id = match OriginId::try_from(row) {
            Ok(id) => id,
            Err(_) => {
                tally.dropped.invalid_row += bins as u64;
                log::trace!("Skipping row {}: index exceeds the origin id range", row);
                return;
            }
        };
        let context = RowContext { row, detector };
        let y = self.source.y(row);
        let e = self.source.e(row);

        for bin in 0..bins {
            let signal = y[bin];
            if !signal.is_finite() {
                tally.dropped.nan_signal += 1;
                log::trace!("Dropping row {} bin {}: signal {}", row, bin, signal);
                continue;
            }
            let value = self.source.bin_value(row, bin);
            if !self.converter.convert(&context, value, coordinate) {
                tally.dropped.out_of_range += 1;
                log::trace!("Dropping row {} bin {}: {} out of range", row, bin, value);
                continue;
            }
            buffer.push(MdEvent::new(coordinate, signal, e[bin] * e[bin], origin_id));
            if buffer.len() >= self.buffer_capacity {
                self.flush(buffer, tally);
            }
        }
    }

    fn flush(&self, buffer: &mut Vec<MdEvent>, tally: &mut WorkerTally) {
        if buffer.is_empty() {
            return;
        }
        let tree = self.tree.read();
        for event in buffer.drain(..) {
            match tree.insert(event) {
                Ok(()) => tally.added += 1,
                Err(err) => {
                    tally.dropped.rejected_by_tree += 1;
                    log::trace!("Dropping sample: {}", err);
                }
            }
        }
    }

    fn record_progress(&self, rows: usize) {
        let before = self.processed.fetch_add(rows, Ordering::Relaxed);
        let after = before + rows;
        if before / self.progress_interval != after / self.progress_interval
            || after == self.rows_total
        {
            self.progress.report(after, self.rows_total);
        }
    }
}
