//! # mdbox - adaptive multidimensional event boxes
//!
//! This crate accumulates large numbers of N-dimensional events (a
//! coordinate plus signal and squared error) into an adaptively refined box
//! tree, fills that tree in parallel from tabular spectra, and persists it
//! as flat arrays in a self-describing container file.
//!
//! ## Features
//!
//! - **Adaptive splitting**: leaves over the split threshold become internal
//!   boxes with an even partition of their extents
//! - **Arena layout**: boxes live in one vector, children in contiguous id
//!   ranges, so the in-memory layout matches the persisted one
//! - **Parallel population**: worker threads flush buffered events into
//!   per-leaf locks; restructuring runs in an exclusive phase between passes
//! - **Cancellation and progress**: cooperative cancellation at chunk
//!   granularity, progress reported per row interval
//! - **Persistence**: flat arrays plus event records, reloaded in memory or
//!   leaf by leaf on demand, with structural validation on load
//!
//! ## Quick Start
//!
//! ```rust
//! use mdbox::{
//!     BoxControllerConfig, BoxTree, DetectorInfo, Extents, IdentityConverter, NoProgress,
//!     PipelineConfig, PopulationPipeline, Spectrum, Workspace2D,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = BoxTree::new(
//!     BoxControllerConfig::new(1).with_split_threshold(2),
//!     Extents::new([(0.0, 10.0)])?,
//! )?;
//!
//! let mut table = Workspace2D::new();
//! table.push(
//!     Spectrum::new(vec![0.0, 1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0], vec![1.0, 1.0, 1.0])
//!         .with_detector(DetectorInfo::new(1, [0.0; 3])),
//! );
//!
//! let populated = PopulationPipeline::new(PipelineConfig::for_workers(2, 1024))
//!     .with_progress(NoProgress)
//!     .run(tree, &table, &IdentityConverter::unbounded())?;
//!
//! assert_eq!(populated.report.samples_added, 3);
//! assert_eq!(populated.tree.signal(), 6.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! ```rust,no_run
//! use mdbox::{load, save, BoxControllerConfig, BoxTree, ContainerFile, Extents, LoadMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tree = BoxTree::new(BoxControllerConfig::new(2), Extents::new([(0.0, 1.0), (0.0, 1.0)])?)?;
//! tree.insert_point(&[0.25, 0.75], 1.0, 1.0, 0)?;
//!
//! let mut file = ContainerFile::create("tree.mdbox")?;
//! save(&mut tree, &mut file, "box_structure")?;
//! let loaded = load(&file, "box_structure", LoadMode::InMemory)?;
//! assert_eq!(loaded.event_count(), 1);
//! # Ok(())
//! # }
//! ```

pub mod box_controller;
pub mod container;
pub mod converter;
pub mod errors;
pub mod event;
pub mod extents;
pub mod flat;
pub mod input;
pub mod md_box;
pub mod persistence;
pub mod pipeline;
pub mod tree;

// Tree types
pub use box_controller::{BoxController, BoxControllerConfig, BoxId};
pub use event::{MdEvent, OriginId};
pub use extents::{Coordinate, DimExtent, Extents};
pub use md_box::{BoxKind, BoxType, EventRange, MdBox};
pub use tree::{BoxTree, ContainmentViolation, EventSource, TreeStats};

// Errors
pub use errors::{BoxError, BoxResult};

// Flat codec and persistence
pub use container::{ContainerFile, DataContainer};
pub use flat::{flatten, flatten_events, unflatten, EventRows, FlatBoxStructure};
pub use persistence::{load, load_file, save, save_file, ContainerEventSource, LoadMode, DEFAULT_GROUP};

// Population
pub use converter::{CoordinateConverter, FnConverter, IdentityConverter, RowContext};
pub use input::{DetectorId, DetectorInfo, Spectrum, SpectrumSource, Workspace2D};
pub use pipeline::{
    populate, CancellationToken, DropCounts, LogProgress, NoProgress, PipelineConfig, Populated,
    PopulationPipeline, PopulationReport, ProgressReporter,
};
