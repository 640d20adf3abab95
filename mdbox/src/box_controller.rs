//! Split policy and box id allocation for a box tree.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{BoxError, BoxResult};

/// Dense identifier of a box; also its index in the tree arena
pub type BoxId = usize;

/// Default number of events a leaf may hold before it is split
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1000;

/// Default maximum tree depth
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Default split factor along every dimension
pub const DEFAULT_SPLIT_INTO: usize = 2;

/// Minimum number of newly added events that forces a split check
pub const DEFAULT_SPLIT_CHECK_FLOOR: u64 = 10_000_000;

/// Fraction of the events already in the tree that forces a split check
pub const DEFAULT_SPLIT_CHECK_FRACTION: f64 = 1.0 / 16.0;

/// Split policy of a tree, fixed once the tree holds data.
///
/// Serialized as JSON into the persisted box structure so a loaded tree
/// keeps splitting the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxControllerConfig {
    /// Number of dimensions of the event space
    pub ndim: usize,
    /// Number of children along each dimension when a leaf splits
    pub split_into: Vec<usize>,
    /// Maximum event count of a leaf before it splits
    pub split_threshold: usize,
    /// Boxes at this depth never split
    pub max_depth: usize,
    /// Lower bound on newly added events that forces a split pass
    pub split_check_floor: u64,
    /// Fraction of existing events that forces a split pass
    pub split_check_fraction: f64,
}

impl BoxControllerConfig {
    /// Creates a configuration with the default policy for `ndim` dimensions.
    pub fn new(ndim: usize) -> Self {
        BoxControllerConfig {
            ndim,
            split_into: vec![DEFAULT_SPLIT_INTO; ndim],
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            split_check_floor: DEFAULT_SPLIT_CHECK_FLOOR,
            split_check_fraction: DEFAULT_SPLIT_CHECK_FRACTION,
        }
    }

    /// Uses the same split factor along every dimension.
    pub fn with_split_into(mut self, factor: usize) -> Self {
        self.split_into = vec![factor; self.ndim];
        self
    }

    /// Uses one split factor per dimension.
    pub fn with_split_into_per_dim(mut self, factors: Vec<usize>) -> Self {
        self.split_into = factors;
        self
    }

    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_split_check_floor(mut self, floor: u64) -> Self {
        self.split_check_floor = floor;
        self
    }

    pub fn with_split_check_fraction(mut self, fraction: f64) -> Self {
        self.split_check_fraction = fraction;
        self
    }

    /// Number of children created by one split.
    pub fn children_per_split(&self) -> usize {
        self.split_into.iter().product()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::InvalidConfiguration`] when a value is out of range.
    pub fn validate(&self) -> BoxResult<()> {
        if self.ndim == 0 {
            return Err(BoxError::InvalidConfiguration(
                "number of dimensions must be at least 1".into(),
            ));
        }
        if self.split_into.len() != self.ndim {
            return Err(BoxError::InvalidConfiguration(format!(
                "split factors given for {} dimensions, expected {}",
                self.split_into.len(),
                self.ndim
            )));
        }
        if let Some(d) = self.split_into.iter().position(|&f| f < 2) {
            return Err(BoxError::InvalidConfiguration(format!(
                "split factor of dimension {} must be at least 2",
                d
            )));
        }
        if self.split_threshold == 0 {
            return Err(BoxError::InvalidConfiguration(
                "split threshold must be positive".into(),
            ));
        }
        if !(self.split_check_fraction > 0.0 && self.split_check_fraction.is_finite()) {
            return Err(BoxError::InvalidConfiguration(
                "split check fraction must be a positive number".into(),
            ));
        }
        Ok(())
    }

    /// Textual description stored alongside the box structure.
    pub fn to_description(&self) -> BoxResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a description written by [`Self::to_description`].
    pub fn from_description(description: &str) -> BoxResult<Self> {
        let config: BoxControllerConfig = serde_json::from_str(description)?;
        config.validate()?;
        Ok(config)
    }
}

/// Owns the split policy of a tree and hands out box ids.
///
/// Ids are dense and monotonically increasing, so they double as indices
/// into the tree arena. Allocation happens only inside the exclusive
/// restructuring phase of the tree; everything else is read-only.
#[derive(Debug)]
pub struct BoxController {
    config: BoxControllerConfig,
    next_id: BoxId,
    boxes_per_depth: Vec<u64>,
    /// Set once events reach the tree; configuration is frozen afterwards
    has_data: AtomicBool,
}

impl BoxController {
    /// Creates a controller after validating the configuration.
    pub fn new(config: BoxControllerConfig) -> BoxResult<Self> {
        config.validate()?;
        let depth_slots = config.max_depth + 1;
        Ok(BoxController {
            config,
            next_id: 0,
            boxes_per_depth: vec![0; depth_slots],
            has_data: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BoxControllerConfig {
        &self.config
    }

    pub fn ndim(&self) -> usize {
        self.config.ndim
    }

    pub fn split_into(&self) -> &[usize] {
        &self.config.split_into
    }

    pub fn split_threshold(&self) -> usize {
        self.config.split_threshold
    }

    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    pub fn children_per_split(&self) -> usize {
        self.config.children_per_split()
    }

    /// Returns a fresh id for a box created at `depth` and counts it.
    pub fn allocate_id(&mut self, depth: usize) -> BoxId {
        let id = self.next_id;
        self.next_id += 1;
        if depth >= self.boxes_per_depth.len() {
            self.boxes_per_depth.resize(depth + 1, 0);
        }
        self.boxes_per_depth[depth] += 1;
        id
    }

    /// Total number of boxes allocated so far.
    pub fn box_count(&self) -> usize {
        self.next_id
    }

    /// Number of boxes at each depth, root first.
    pub fn boxes_per_depth(&self) -> &[u64] {
        &self.boxes_per_depth
    }

    /// Theoretical maximum number of boxes at `depth` if every box above it
    /// split. Saturates at `u64::MAX`.
    pub fn max_boxes_at_depth(&self, depth: usize) -> u64 {
        let per_split = self.children_per_split() as u64;
        u32::try_from(depth)
            .ok()
            .and_then(|d| per_split.checked_pow(d))
            .unwrap_or(u64::MAX)
    }

    /// Decides whether enough events arrived to warrant a split pass.
    ///
    /// A pass is due once the events added since the last pass exceed a
    /// fraction of the events already stored (but never fewer than the
    /// configured floor), or once the average number of new events per
    /// existing box exceeds the split threshold.
    pub fn should_split(&self, total_events: u64, events_added: u64, box_count: usize) -> bool {
        if box_count == 0 {
            return false;
        }
        let fraction = (total_events as f64 * self.config.split_check_fraction) as u64;
        let comparison_point = fraction.max(self.config.split_check_floor);
        if events_added > comparison_point {
            return true;
        }
        events_added / box_count as u64 > self.config.split_threshold as u64
    }

    /// Whether a leaf holding `event_count` events at `depth` splits in the
    /// next pass. Leaves at the maximum depth grow without bound.
    pub fn will_split(&self, event_count: usize, depth: usize) -> bool {
        event_count > self.config.split_threshold && depth < self.config.max_depth
    }

    pub fn set_split_threshold(&mut self, threshold: usize) -> BoxResult<()> {
        self.update(|config| config.split_threshold = threshold)
    }

    pub fn set_max_depth(&mut self, max_depth: usize) -> BoxResult<()> {
        self.update(|config| config.max_depth = max_depth)
    }

    pub fn set_split_into(&mut self, factor: usize) -> BoxResult<()> {
        self.update(|config| config.split_into = vec![factor; config.ndim])
    }

    fn update<F>(&mut self, change: F) -> BoxResult<()>
    where
        F: FnOnce(&mut BoxControllerConfig),
    {
        if self.has_data() || self.next_id > 1 {
            return Err(BoxError::ConfigurationLocked);
        }
        let mut config = self.config.clone();
        change(&mut config);
        config.validate()?;
        self.boxes_per_depth.resize(config.max_depth + 1, 0);
        self.config = config;
        Ok(())
    }

    /// Freezes the configuration. Called by the tree on first insertion.
    pub(crate) fn mark_has_data(&self) {
        self.has_data.store(true, Ordering::Relaxed);
    }

    pub fn has_data(&self) -> bool {
        self.has_data.load(Ordering::Relaxed)
    }
}
