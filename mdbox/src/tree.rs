//! Box tree arena: insertion, split pass, cache refresh and iteration.
//!
//! Boxes live in a `Vec` indexed by [`BoxId`]. Children of a box are
//! allocated together when it splits, so every internal box refers to its
//! children through a contiguous `first..=last` id range and every child id
//! is larger than its parent's. Iterating in id order therefore visits a
//! parent before its children, which is the order the flat codec relies on.
//!
//! Insertion takes `&self` and only locks the target leaf. Splitting and
//! cache refresh take `&mut self`; callers sharing a tree between workers
//! wrap it in a `RwLock` and take the write side for those passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::box_controller::{BoxController, BoxControllerConfig, BoxId};
use crate::errors::{BoxError, BoxResult};
use crate::event::{MdEvent, OriginId};
use crate::extents::Extents;
use crate::md_box::{BoxKind, EventRange, LeafBox, MdBox};

/// Relative tolerance used when comparing child volumes with their parent
const VOLUME_TOLERANCE: f64 = 1e-9;

/// Reads event records that belong to file-backed leaves.
pub trait EventSource {
    /// Reads `range.count` events starting at record `range.offset`.
    fn read_events(&self, range: EventRange) -> BoxResult<Vec<MdEvent>>;
}

/// Summary of a tree's shape and contents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStats {
    pub box_count: usize,
    pub leaf_count: usize,
    pub internal_count: usize,
    pub max_depth_reached: usize,
    pub event_count: u64,
    pub signal: f64,
    pub error_squared: f64,
}

/// A broken containment or partition rule found by
/// [`BoxTree::check_containment`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainmentViolation {
    pub box_id: BoxId,
    pub message: String,
}

/// Adaptive N-dimensional box tree.
#[derive(Debug)]
pub struct BoxTree {
    controller: BoxController,
    boxes: Vec<MdBox>,
    event_count: AtomicU64,
    complete: AtomicBool,
}

impl BoxTree {
    /// Creates a tree holding a single empty root leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the extents do not
    /// have `config.ndim` dimensions.
    pub fn new(config: BoxControllerConfig, extents: Extents) -> BoxResult<Self> {
        let mut controller = BoxController::new(config)?;
        if extents.ndim() != controller.ndim() {
            return Err(BoxError::DimensionMismatch {
                expected: controller.ndim(),
                actual: extents.ndim(),
            });
        }
        let root_id = controller.allocate_id(0);
        let root = MdBox::new_leaf(root_id, 0, None, extents);
        Ok(BoxTree {
            controller,
            boxes: vec![root],
            event_count: AtomicU64::new(0),
            complete: AtomicBool::new(true),
        })
    }

    /// Assembles a tree from boxes rebuilt by the flat codec. The boxes must
    /// already be in id order and registered with the controller.
    pub(crate) fn from_parts(controller: BoxController, boxes: Vec<MdBox>) -> Self {
        let event_count: u64 = boxes.iter().map(MdBox::leaf_event_count).sum();
        if event_count > 0 {
            controller.mark_has_data();
        }
        BoxTree {
            controller,
            boxes,
            event_count: AtomicU64::new(event_count),
            complete: AtomicBool::new(true),
        }
    }

    pub fn controller(&self) -> &BoxController {
        &self.controller
    }

    /// Mutable controller access, for configuration changes before data
    /// arrives.
    pub fn controller_mut(&mut self) -> &mut BoxController {
        &mut self.controller
    }

    pub fn ndim(&self) -> usize {
        self.controller.ndim()
    }

    pub fn root(&self) -> &MdBox {
        &self.boxes[0]
    }

    pub fn extents(&self) -> &Extents {
        self.root().extents()
    }

    pub fn get(&self, id: BoxId) -> Option<&MdBox> {
        self.boxes.get(id)
    }

    /// Number of boxes in the tree.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    /// Total number of events held by the leaves.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// False when population stopped early, e.g. after cancellation.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Relaxed)
    }

    pub(crate) fn set_complete(&self, complete: bool) {
        self.complete.store(complete, Ordering::Relaxed);
    }

    /// Cached root signal; current after the last [`Self::refresh_cache`].
    pub fn signal(&self) -> f64 {
        self.root().signal()
    }

    /// Cached root squared error; current after the last
    /// [`Self::refresh_cache`].
    pub fn error_squared(&self) -> f64 {
        self.root().error_squared()
    }

    /// Id of the leaf that receives `coordinate`, or `None` when the
    /// coordinate lies outside the tree.
    pub fn leaf_for(&self, coordinate: &[f64]) -> Option<BoxId> {
        if coordinate.len() != self.ndim() || !self.extents().contains_point(coordinate) {
            return None;
        }
        Some(self.descend(coordinate))
    }

    fn descend(&self, coordinate: &[f64]) -> BoxId {
        let split_into = self.controller.split_into();
        let mut id = 0;
        loop {
            let current = &self.boxes[id];
            match current.kind {
                BoxKind::Leaf(_) => return id,
                BoxKind::Internal { first_child, .. } => {
                    id = first_child + current.extents.child_index(coordinate, split_into);
                }
            }
        }
    }

    /// Adds one event to the leaf containing its coordinate.
    ///
    /// Never splits; call [`Self::split_if_needed`] afterwards. Safe to call
    /// from many threads at once: only the target leaf is locked.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::DimensionMismatch`] for a coordinate of the wrong
    /// length and [`BoxError::OutOfBounds`] for one outside the root extents.
    pub fn insert(&self, event: MdEvent) -> BoxResult<()> {
        if event.ndim() != self.ndim() {
            return Err(BoxError::DimensionMismatch {
                expected: self.ndim(),
                actual: event.ndim(),
            });
        }
        if !self.extents().contains_point(&event.coordinate) {
            return Err(BoxError::OutOfBounds {
                coordinate: event.coordinate.to_vec(),
            });
        }

        let id = self.descend(&event.coordinate);
        if let BoxKind::Leaf(leaf) = &self.boxes[id].kind {
            leaf.lock().push(event);
        }
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.controller.mark_has_data();
        Ok(())
    }

    /// Convenience wrapper over [`Self::insert`].
    pub fn insert_point(
        &self,
        coordinate: &[f64],
        signal: f64,
        error_squared: f64,
        origin_id: OriginId,
    ) -> BoxResult<()> {
        self.insert(MdEvent::new(coordinate, signal, error_squared, origin_id))
    }

    /// Splits every leaf whose event count exceeds the split threshold and
    /// whose depth is below the maximum depth.
    ///
    /// Only leaves that exist when the pass starts are considered; children
    /// created by this pass wait for the next one. Leaves whose events are
    /// still on disk are skipped. Returns the number of leaves split.
    pub fn split_if_needed(&mut self) -> usize {
        let existing = self.boxes.len();
        let mut split = 0;

        for id in 0..existing {
            let depth = self.boxes[id].depth;
            let controller = &self.controller;
            let candidate = match &mut self.boxes[id].kind {
                BoxKind::Leaf(leaf) => {
                    let contents = leaf.contents_mut();
                    let due = controller.will_split(contents.event_count() as usize, depth);
                    if due && !contents.is_resident() {
                        log::debug!("Skipping split of box {}: events not loaded", id);
                        false
                    } else {
                        due
                    }
                }
                BoxKind::Internal { .. } => false,
            };
            if candidate {
                self.split_box(id);
                split += 1;
            }
        }

        if split > 0 {
            log::debug!("Split {} boxes, tree now has {} boxes", split, self.boxes.len());
        }
        split
    }

    /// Turns leaf `id` into an internal box with a fresh set of child leaves
    /// and moves its events into them.
    fn split_box(&mut self, id: BoxId) {
        let depth = self.boxes[id].depth;
        let parent_extents = self.boxes[id].extents.clone();
        let split_into = self.controller.split_into().to_vec();
        let n_children = self.controller.children_per_split();

        let events = match self.boxes[id].as_leaf_mut() {
            Some(leaf) => std::mem::take(&mut leaf.contents_mut().events),
            None => return,
        };

        let first_child = self.boxes.len();
        for index in 0..n_children {
            let child_id = self.controller.allocate_id(depth + 1);
            debug_assert_eq!(child_id, self.boxes.len());
            let extents = parent_extents.child(index, &split_into);
            self.boxes
                .push(MdBox::new_leaf(child_id, depth + 1, Some(id), extents));
        }
        let last_child = self.boxes.len() - 1;

        for event in events {
            let child = first_child + parent_extents.child_index(&event.coordinate, &split_into);
            if let Some(leaf) = self.boxes[child].as_leaf_mut() {
                leaf.contents_mut().push(event);
            }
        }

        self.boxes[id].kind = BoxKind::Internal {
            first_child,
            last_child,
        };
    }

    /// Recomputes the cached signal and squared error of every box, leaves
    /// from their events and internal boxes from their children.
    pub fn refresh_cache(&mut self) {
        for id in (0..self.boxes.len()).rev() {
            let (signal, error_squared) = match self.boxes[id].children() {
                Some(range) => self.boxes[range]
                    .iter()
                    .fold((0.0, 0.0), |(s, e), child| {
                        (s + child.signal, e + child.error_squared)
                    }),
                None => match self.boxes[id].as_leaf_mut() {
                    Some(leaf) => {
                        let contents = leaf.contents_mut();
                        (contents.signal, contents.error_squared)
                    }
                    None => (0.0, 0.0),
                },
            };
            let current = &mut self.boxes[id];
            current.signal = signal;
            current.error_squared = error_squared;
        }
    }

    /// Iterates all boxes in id order (parents before children).
    pub fn iter(&self) -> std::slice::Iter<'_, MdBox> {
        self.boxes.iter()
    }

    /// Iterates all boxes depth-first, children in id order.
    pub fn iter_depth_first(&self) -> DepthFirstIter<'_> {
        DepthFirstIter {
            tree: self,
            stack: vec![0],
        }
    }

    /// Iterates the leaves in id order.
    pub fn leaves(&self) -> impl Iterator<Item = &MdBox> + '_ {
        self.boxes.iter().filter(|b| b.is_leaf())
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            box_count: self.boxes.len(),
            event_count: self.event_count(),
            signal: self.signal(),
            error_squared: self.error_squared(),
            ..TreeStats::default()
        };
        for b in &self.boxes {
            if b.is_leaf() {
                stats.leaf_count += 1;
            } else {
                stats.internal_count += 1;
            }
            stats.max_depth_reached = stats.max_depth_reached.max(b.depth);
        }
        stats
    }

    /// Copies the in-memory events of leaf `id`.
    pub fn leaf_events(&self, id: BoxId) -> Option<Vec<MdEvent>> {
        self.boxes.get(id)?.as_leaf().map(LeafBox::events)
    }

    /// Reads the on-disk events of leaf `id` into memory. Returns the number
    /// of events loaded; zero if the leaf was already resident.
    pub fn load_leaf_events(&mut self, id: BoxId, source: &dyn EventSource) -> BoxResult<usize> {
        let leaf = match self.boxes.get_mut(id).and_then(MdBox::as_leaf_mut) {
            Some(leaf) => leaf,
            None => return Ok(0),
        };
        let contents = leaf.contents_mut();
        let range = match contents.on_disk {
            Some(range) => range,
            None => return Ok(0),
        };
        let mut loaded = source.read_events(range)?;
        let count = loaded.len();
        // in-memory additions made after load stay behind the stored ones
        loaded.append(&mut contents.events);
        contents.events = loaded;
        contents.on_disk = None;
        contents.recompute_totals();
        Ok(count)
    }

    /// Loads every file-backed leaf. Returns the number of events read.
    pub fn load_all_events(&mut self, source: &dyn EventSource) -> BoxResult<usize> {
        let mut total = 0;
        for id in 0..self.boxes.len() {
            total += self.load_leaf_events(id, source)?;
        }
        Ok(total)
    }

    /// Checks that every child lies inside its parent, that siblings do not
    /// overlap and that they fill the parent's volume.
    pub fn check_containment(&self) -> Vec<ContainmentViolation> {
        let mut violations = Vec::new();
        for parent in &self.boxes {
            let range = match parent.children() {
                Some(range) => range,
                None => continue,
            };
            let mut volume = 0.0;
            for child_id in range.clone() {
                let child = &self.boxes[child_id];
                volume += child.extents.volume();
                if !parent.extents.contains(&child.extents) {
                    violations.push(ContainmentViolation {
                        box_id: child_id,
                        message: format!(
                            "{} is not inside parent {} {}",
                            child.extents, parent.id, parent.extents
                        ),
                    });
                }
                if child.depth != parent.depth + 1 {
                    violations.push(ContainmentViolation {
                        box_id: child_id,
                        message: format!(
                            "depth {} under parent depth {}",
                            child.depth, parent.depth
                        ),
                    });
                }
                for sibling_id in (child_id + 1)..=*range.end() {
                    if child.extents.overlaps(&self.boxes[sibling_id].extents) {
                        violations.push(ContainmentViolation {
                            box_id: child_id,
                            message: format!("overlaps sibling {}", sibling_id),
                        });
                    }
                }
            }
            let expected = parent.extents.volume();
            if (volume - expected).abs() > VOLUME_TOLERANCE * expected.abs().max(1.0) {
                violations.push(ContainmentViolation {
                    box_id: parent.id,
                    message: format!(
                        "children cover volume {} of parent volume {}",
                        volume, expected
                    ),
                });
            }
        }
        violations
    }

    pub(crate) fn boxes(&self) -> &[MdBox] {
        &self.boxes
    }
}

/// Depth-first iterator over a tree's boxes.
#[derive(Debug)]
pub struct DepthFirstIter<'a> {
    tree: &'a BoxTree,
    stack: Vec<BoxId>,
}

impl<'a> Iterator for DepthFirstIter<'a> {
    type Item = &'a MdBox;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let current = &self.tree.boxes[id];
        if let Some(children) = current.children() {
            self.stack.extend(children.rev());
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scenario_tree() -> BoxTree {
        BoxTree::new(
            BoxControllerConfig::new(2)
                .with_split_threshold(4)
                .with_split_into(2)
                .with_max_depth(5),
            Extents::new([(-10.0, 10.0), (-10.0, 10.0)]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_tree_has_single_leaf_root() {
        let tree = scenario_tree();
        assert_eq!(tree.len(), 1);
        assert!(tree.root().is_leaf());
        assert_eq!(tree.root().depth(), 0);
        assert_eq!(tree.controller().box_count(), 1);
        assert!(tree.is_empty());
        assert!(tree.is_complete());
    }

    #[test]
    fn test_new_tree_rejects_dimension_mismatch() {
        let result = BoxTree::new(
            BoxControllerConfig::new(3),
            Extents::new([(0.0, 1.0), (0.0, 1.0)]).unwrap(),
        );
        assert!(matches!(
            result,
            Err(BoxError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_insert_rejects_out_of_bounds_and_wrong_dims() {
        let tree = scenario_tree();
        assert!(matches!(
            tree.insert_point(&[11.0, 0.0], 1.0, 1.0, 0),
            Err(BoxError::OutOfBounds { .. })
        ));
        assert!(matches!(
            tree.insert_point(&[0.0], 1.0, 1.0, 0),
            Err(BoxError::DimensionMismatch { .. })
        ));
        assert_eq!(tree.event_count(), 0);
    }

    #[test]
    fn test_insert_never_splits() {
        let tree = scenario_tree();
        for i in 0..50 {
            tree.insert_point(&[i as f64 / 10.0, 0.0], 1.0, 1.0, 0).unwrap();
        }
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.event_count(), 50);
    }

    #[test]
    fn test_scenario_single_split_into_lower_left_child() {
        let mut tree = scenario_tree();
        let points = [
            [-9.0, -9.0],
            [-1.0, -1.0],
            [-5.0, -2.5],
            [0.0, 0.0],
            [-10.0, -10.0],
        ];
        for (i, p) in points.iter().enumerate() {
            tree.insert_point(p, 1.0, 1.0, i as u32).unwrap();
        }

        assert_eq!(tree.split_if_needed(), 1);
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.root().children(), Some(1..=4));

        let lower_left = tree.get(1).unwrap();
        assert_eq!(lower_left.leaf_event_count(), 5);
        assert_eq!(
            lower_left.extents(),
            &Extents::new([(-10.0, 0.0), (-10.0, 0.0)]).unwrap()
        );
        for id in 2..=4 {
            assert_eq!(tree.get(id).unwrap().leaf_event_count(), 0);
        }
        assert!(tree.check_containment().is_empty());
    }

    #[test]
    fn test_threshold_boundary() {
        let mut tree = scenario_tree();
        for _ in 0..4 {
            tree.insert_point(&[1.0, 1.0], 1.0, 1.0, 0).unwrap();
        }
        assert_eq!(tree.split_if_needed(), 0);
        assert_eq!(tree.len(), 1);

        tree.insert_point(&[1.0, 1.0], 1.0, 1.0, 0).unwrap();
        assert_eq!(tree.split_if_needed(), 1);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_max_depth_boundary() {
        let mut tree = BoxTree::new(
            BoxControllerConfig::new(2)
                .with_split_threshold(1)
                .with_max_depth(2),
            Extents::new([(0.0, 1.0), (0.0, 1.0)]).unwrap(),
        )
        .unwrap();
        for _ in 0..1000 {
            tree.insert_point(&[0.1, 0.1], 1.0, 1.0, 0).unwrap();
        }
        while tree.split_if_needed() > 0 {}

        let stats = tree.stats();
        assert_eq!(stats.max_depth_reached, 2);
        assert_eq!(stats.box_count, 9);
        let deep_leaf = tree.leaf_for(&[0.1, 0.1]).unwrap();
        assert_eq!(tree.get(deep_leaf).unwrap().depth(), 2);
        assert_eq!(tree.get(deep_leaf).unwrap().leaf_event_count(), 1000);
        assert_eq!(tree.split_if_needed(), 0);
    }

    #[test]
    fn test_refresh_cache_conserves_signal() {
        let mut tree = scenario_tree();
        let mut expected = 0.0;
        for i in 0..200 {
            let x = (i % 20) as f64 - 9.5;
            let y = (i / 20) as f64 * 2.0 - 9.5;
            let signal = 0.5 + i as f64;
            expected += signal;
            tree.insert_point(&[x, y], signal, signal * 2.0, i).unwrap();
            if i % 25 == 0 {
                tree.split_if_needed();
            }
        }
        tree.split_if_needed();
        tree.refresh_cache();

        let leaf_sum: f64 = tree.leaves().map(MdBox::signal).sum();
        assert!((leaf_sum - expected).abs() < 1e-9);
        assert!((tree.signal() - expected).abs() < 1e-9);
        assert!((tree.error_squared() - 2.0 * expected).abs() < 1e-9);
        for b in tree.iter().filter(|b| !b.is_leaf()) {
            let children: f64 = b
                .children()
                .unwrap()
                .map(|c| tree.get(c).unwrap().signal())
                .sum();
            assert!((children - b.signal()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_iteration_orders() {
        let mut tree = scenario_tree();
        for _ in 0..5 {
            tree.insert_point(&[-5.0, -5.0], 1.0, 1.0, 0).unwrap();
            tree.insert_point(&[5.0, 5.0], 1.0, 1.0, 0).unwrap();
        }
        tree.split_if_needed();
        tree.split_if_needed();

        let by_id: Vec<_> = tree.iter().map(MdBox::id).collect();
        assert_eq!(by_id, (0..tree.len()).collect::<Vec<_>>());

        let depth_first: Vec<_> = tree.iter_depth_first().map(MdBox::id).collect();
        assert_eq!(depth_first.len(), tree.len());
        assert_eq!(depth_first, vec![0, 1, 5, 6, 7, 8, 2, 3, 4, 9, 10, 11, 12]);

        // restartable
        let again: Vec<_> = tree.iter_depth_first().map(MdBox::id).collect();
        assert_eq!(again, depth_first);

        let mut seen = HashMap::new();
        for b in tree.iter() {
            if let Some(parent) = b.parent() {
                assert!(seen.contains_key(&parent));
            }
            seen.insert(b.id(), ());
        }
    }

    #[test]
    fn test_concurrent_inserts_into_shared_tree() {
        let tree = scenario_tree();
        std::thread::scope(|s| {
            for t in 0..4 {
                let tree = &tree;
                s.spawn(move || {
                    for i in 0..250 {
                        let x = -9.0 + (i % 18) as f64;
                        let y = -9.0 + t as f64 * 4.0;
                        tree.insert_point(&[x, y], 1.0, 1.0, t).unwrap();
                    }
                });
            }
        });
        assert_eq!(tree.event_count(), 1000);
        assert_eq!(tree.root().leaf_event_count(), 1000);
    }

    #[test]
    fn test_configuration_locked_once_tree_has_data() {
        let mut tree = scenario_tree();
        assert!(tree.controller_mut().set_split_threshold(8).is_ok());
        tree.insert_point(&[0.0, 0.0], 1.0, 1.0, 0).unwrap();
        assert!(matches!(
            tree.controller_mut().set_split_threshold(16),
            Err(BoxError::ConfigurationLocked)
        ));
    }

    struct VecSource(Vec<MdEvent>);

    impl EventSource for VecSource {
        fn read_events(&self, range: EventRange) -> BoxResult<Vec<MdEvent>> {
            Ok(self.0[range.offset as usize..range.end() as usize].to_vec())
        }
    }

    #[test]
    fn test_file_backed_leaf_load() {
        let mut tree = scenario_tree();
        let stored: Vec<_> = (0..6)
            .map(|i| MdEvent::new(&[-1.0, -1.0], 1.0, 1.0, i))
            .collect();
        if let Some(leaf) = tree.boxes[0].as_leaf_mut() {
            leaf.contents_mut().on_disk = Some(EventRange::new(0, 6));
            leaf.contents_mut().signal = 6.0;
        }
        // due to split but not resident
        assert_eq!(tree.split_if_needed(), 0);

        let loaded = tree.load_all_events(&VecSource(stored)).unwrap();
        assert_eq!(loaded, 6);
        assert_eq!(tree.leaf_events(0).unwrap().len(), 6);
        assert_eq!(tree.split_if_needed(), 1);
    }
}
