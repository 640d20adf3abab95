//! Flat parallel-array encoding of a box tree.
//!
//! One entry per box, in id order, so every parent precedes its children
//! and every child range is contiguous. Leaves are laid out in the event
//! record stream in the same order, each leaf's `box_event_index` being
//! `(offset, count)` with `offset` the running total of earlier leaves'
//! counts.

use crate::box_controller::{BoxController, BoxControllerConfig, BoxId};
use crate::errors::{BoxError, BoxResult};
use crate::event::MdEvent;
use crate::extents::Extents;
use crate::md_box::{BoxKind, BoxType, EventRange, LeafBox, LeafContents, MdBox};
use crate::tree::BoxTree;

pub const BOX_TYPE: &str = "box_type";
pub const DEPTH: &str = "depth";
pub const INVERSE_VOLUME: &str = "inverse_volume";
pub const EXTENTS: &str = "extents";
pub const BOX_CHILDREN: &str = "box_children";
pub const BOX_SIGNAL_ERRORSQUARED: &str = "box_signal_errorsquared";
pub const BOX_EVENT_INDEX: &str = "box_event_index";
pub const EVENT_DATA: &str = "event_data";

/// Parallel arrays describing every box of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatBoxStructure {
    pub controller: BoxControllerConfig,
    /// 0 = none, 1 = leaf, 2 = internal
    pub box_type: Vec<i64>,
    pub depth: Vec<i64>,
    pub inverse_volume: Vec<f64>,
    /// `2 * ndim` values per box: `min0, max0, min1, max1, ...`
    pub extents: Vec<f64>,
    /// First and last child id per box; `0, 0` for leaves
    pub box_children: Vec<i64>,
    /// Signal and squared error per box
    pub box_signal_errorsquared: Vec<f64>,
    /// Record offset and count per box; `0, 0` for internal boxes
    pub box_event_index: Vec<i64>,
}

impl FlatBoxStructure {
    pub fn ndim(&self) -> usize {
        self.controller.ndim
    }

    /// Number of boxes described.
    pub fn len(&self) -> usize {
        self.box_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.box_type.is_empty()
    }

    /// Total number of event records referenced by the leaves.
    pub fn total_events(&self) -> u64 {
        self.box_event_index
            .chunks_exact(2)
            .map(|pair| pair[1].max(0) as u64)
            .sum()
    }

    fn check_lengths(&self) -> BoxResult<()> {
        let n = self.len();
        if n == 0 {
            return Err(BoxError::structural(BOX_TYPE, 0, "no boxes"));
        }
        let ndim = self.ndim();
        let expected: [(&'static str, usize, usize); 6] = [
            (DEPTH, self.depth.len(), n),
            (INVERSE_VOLUME, self.inverse_volume.len(), n),
            (EXTENTS, self.extents.len(), 2 * ndim * n),
            (BOX_CHILDREN, self.box_children.len(), 2 * n),
            (BOX_SIGNAL_ERRORSQUARED, self.box_signal_errorsquared.len(), 2 * n),
            (BOX_EVENT_INDEX, self.box_event_index.len(), 2 * n),
        ];
        for (array, actual, wanted) in expected {
            if actual != wanted {
                return Err(BoxError::structural(
                    array,
                    actual.min(wanted),
                    format!("expected {} values, found {}", wanted, actual),
                ));
            }
        }
        Ok(())
    }
}

/// Where the event records of leaves come from when rebuilding a tree.
#[derive(Debug, Clone, Copy)]
pub enum EventRows<'a> {
    /// Flattened `event_data` rows, read into every leaf
    InMemory(&'a [f64]),
    /// Leaves keep only their `(offset, count)`; `records` is the number of
    /// rows in the backing dataset
    OnDisk { records: u64 },
}

impl EventRows<'_> {
    fn records(&self, ndim: usize) -> u64 {
        match self {
            EventRows::InMemory(rows) => (rows.len() / MdEvent::row_width(ndim)) as u64,
            EventRows::OnDisk { records } => *records,
        }
    }
}

/// Encodes `tree` into parallel arrays, one entry per box in id order.
///
/// Leaf offsets are assigned as the running total of the preceding leaves'
/// event counts, so the result depends only on the leaf order. Signal and
/// squared error are summed from the leaves, whether or not the tree's
/// cache is current.
pub fn flatten(tree: &BoxTree) -> FlatBoxStructure {
    let totals = subtree_totals(tree);
    let n = tree.len();
    let ndim = tree.ndim();
    let mut flat = FlatBoxStructure {
        controller: tree.controller().config().clone(),
        box_type: Vec::with_capacity(n),
        depth: Vec::with_capacity(n),
        inverse_volume: Vec::with_capacity(n),
        extents: Vec::with_capacity(2 * ndim * n),
        box_children: Vec::with_capacity(2 * n),
        box_signal_errorsquared: Vec::with_capacity(2 * n),
        box_event_index: Vec::with_capacity(2 * n),
    };

    let mut offset: u64 = 0;
    for b in tree.iter() {
        flat.box_type.push(b.box_type().code());
        flat.depth.push(b.depth() as i64);
        flat.inverse_volume.push(b.inverse_volume());
        b.extents().write_flat(&mut flat.extents);
        let (signal, error_squared) = totals[b.id()];
        flat.box_signal_errorsquared.push(signal);
        flat.box_signal_errorsquared.push(error_squared);

        match b.kind() {
            BoxKind::Leaf(leaf) => {
                let count = leaf.event_count();
                flat.box_children.extend_from_slice(&[0, 0]);
                flat.box_event_index
                    .extend_from_slice(&[offset as i64, count as i64]);
                offset += count;
            }
            BoxKind::Internal {
                first_child,
                last_child,
            } => {
                flat.box_children
                    .extend_from_slice(&[*first_child as i64, *last_child as i64]);
                flat.box_event_index.extend_from_slice(&[0, 0]);
            }
        }
    }
    flat
}

/// Signal and squared error of every box, leaves from their own running
/// totals and internal boxes from their children.
fn subtree_totals(tree: &BoxTree) -> Vec<(f64, f64)> {
    let mut totals = vec![(0.0, 0.0); tree.len()];
    for b in tree.iter().rev() {
        let total = match b.kind() {
            BoxKind::Leaf(leaf) => {
                let contents = leaf.lock();
                (contents.signal(), contents.error_squared())
            }
            BoxKind::Internal {
                first_child,
                last_child,
            } => totals[*first_child..=*last_child]
                .iter()
                .fold((0.0, 0.0), |(s, e), (cs, ce)| (s + cs, e + ce)),
        };
        totals[b.id()] = total;
    }
    totals
}

/// Encodes the events of every leaf as `event_data` rows, in the same leaf
/// order [`flatten`] uses for offsets.
///
/// # Errors
///
/// Returns [`BoxError::EventsNotLoaded`] if a leaf still has events on disk.
pub fn flatten_events(tree: &BoxTree) -> BoxResult<Vec<f64>> {
    let width = MdEvent::row_width(tree.ndim());
    let mut rows = Vec::with_capacity(tree.event_count() as usize * width);
    for b in tree.leaves() {
        if let Some(leaf) = b.as_leaf() {
            let contents = leaf.lock();
            if !contents.is_resident() {
                return Err(BoxError::EventsNotLoaded { box_id: b.id() });
            }
            for event in contents.events() {
                event.write_row(&mut rows);
            }
        }
    }
    Ok(rows)
}

/// Rebuilds a tree from its flat arrays, walking them exactly once.
///
/// # Errors
///
/// Returns a [`BoxError::Structural`] naming the offending array and index
/// when a box type is unknown, a child range or event range points outside
/// the arrays, a box is claimed by two parents or by none, or the arrays
/// have inconsistent lengths.
pub fn unflatten(flat: &FlatBoxStructure, events: EventRows<'_>) -> BoxResult<BoxTree> {
    flat.check_lengths()?;
    let mut controller = BoxController::new(flat.controller.clone())?;
    let n = flat.len();
    let ndim = flat.ndim();
    let per_split = controller.children_per_split();
    let records = events.records(ndim);
    let width = MdEvent::row_width(ndim);

    let mut parents: Vec<Option<BoxId>> = vec![None; n];
    let mut boxes: Vec<MdBox> = Vec::with_capacity(n);

    for i in 0..n {
        let box_type = BoxType::from_code(flat.box_type[i]).ok_or_else(|| {
            BoxError::structural(
                BOX_TYPE,
                i,
                format!("unknown box type {}", flat.box_type[i]),
            )
        })?;

        let depth = usize::try_from(flat.depth[i])
            .map_err(|_| BoxError::structural(DEPTH, i, "negative depth"))?;
        let parent = parents[i];
        match parent {
            None if i != 0 => {
                return Err(BoxError::structural(BOX_CHILDREN, i, "box has no parent"));
            }
            None if depth != 0 => {
                return Err(BoxError::structural(DEPTH, i, "root depth must be 0"));
            }
            Some(p) if depth != boxes[p].depth + 1 => {
                return Err(BoxError::structural(
                    DEPTH,
                    i,
                    format!("depth {} under parent of depth {}", depth, boxes[p].depth),
                ));
            }
            _ => {}
        }

        let raw_extents = &flat.extents[2 * ndim * i..2 * ndim * (i + 1)];
        if raw_extents
            .chunks_exact(2)
            .any(|pair| !(pair[0].is_finite() && pair[1].is_finite() && pair[0] < pair[1]))
        {
            return Err(BoxError::structural(EXTENTS, i, "invalid extents"));
        }
        let extents = Extents::from_flat(raw_extents);
        if let Some(p) = parent {
            if !boxes[p].extents.contains(&extents) {
                return Err(BoxError::structural(
                    EXTENTS,
                    i,
                    format!("not contained in parent {}", p),
                ));
            }
        }

        let mut signal = flat.box_signal_errorsquared[2 * i];
        let mut error_squared = flat.box_signal_errorsquared[2 * i + 1];

        let kind = match box_type {
            BoxType::Internal => {
                let first = flat.box_children[2 * i];
                let last = flat.box_children[2 * i + 1];
                if first <= i as i64 || last < first || last >= n as i64 {
                    return Err(BoxError::structural(
                        BOX_CHILDREN,
                        i,
                        format!("child range {}..={} outside {}..{}", first, last, i + 1, n),
                    ));
                }
                let (first, last) = (first as usize, last as usize);
                if last - first + 1 != per_split {
                    return Err(BoxError::structural(
                        BOX_CHILDREN,
                        i,
                        format!("{} children, expected {}", last - first + 1, per_split),
                    ));
                }
                for child in first..=last {
                    if parents[child].is_some() {
                        return Err(BoxError::structural(
                            BOX_CHILDREN,
                            i,
                            format!("child {} already has a parent", child),
                        ));
                    }
                    parents[child] = Some(i);
                }
                BoxKind::Internal {
                    first_child: first,
                    last_child: last,
                }
            }
            BoxType::Leaf | BoxType::None => {
                let offset = flat.box_event_index[2 * i];
                let count = flat.box_event_index[2 * i + 1];
                if offset < 0 || count < 0 || (offset as u64).saturating_add(count as u64) > records
                {
                    return Err(BoxError::structural(
                        BOX_EVENT_INDEX,
                        i,
                        format!(
                            "event range ({}, {}) outside {} records",
                            offset, count, records
                        ),
                    ));
                }
                if box_type == BoxType::None && count != 0 {
                    return Err(BoxError::structural(
                        BOX_EVENT_INDEX,
                        i,
                        "box of type none holds events",
                    ));
                }
                let range = EventRange::new(offset as u64, count as u64);
                let contents = match events {
                    EventRows::InMemory(rows) => {
                        let slice =
                            &rows[range.offset as usize * width..range.end() as usize * width];
                        LeafContents::from_events(
                            slice.chunks_exact(width).map(MdEvent::from_row).collect(),
                        )
                    }
                    EventRows::OnDisk { .. } if range.count > 0 => {
                        LeafContents::on_disk(range, signal, error_squared)
                    }
                    EventRows::OnDisk { .. } => LeafContents::default(),
                };
                // loaded events are the source of truth for a leaf's totals
                signal = contents.signal();
                error_squared = contents.error_squared();
                BoxKind::Leaf(LeafBox::with_contents(contents))
            }
        };

        let id = controller.allocate_id(depth);
        debug_assert_eq!(id, i);
        boxes.push(MdBox {
            id,
            depth,
            parent,
            extents,
            inverse_volume: flat.inverse_volume[i],
            signal,
            error_squared,
            kind,
        });
    }

    Ok(BoxTree::from_parts(controller, boxes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn populated_tree() -> BoxTree {
        let mut tree = BoxTree::new(
            BoxControllerConfig::new(3)
                .with_split_threshold(8)
                .with_max_depth(4),
            Extents::new([(-5.0, 5.0), (0.0, 10.0), (-1.0, 1.0)]).unwrap(),
        )
        .unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for i in 0..500u32 {
            let p = [
                rng.gen_range(-5.0..5.0),
                rng.gen_range(0.0..10.0),
                rng.gen_range(-1.0..1.0),
            ];
            let signal = rng.gen_range(0.0..3.0);
            tree.insert_point(&p, signal, signal * 0.5, i % 7).unwrap();
            if i % 100 == 99 {
                tree.split_if_needed();
            }
        }
        tree.split_if_needed();
        tree.refresh_cache();
        tree
    }

    #[test]
    fn test_flatten_shapes_and_offsets() {
        let tree = populated_tree();
        let flat = flatten(&tree);
        assert_eq!(flat.len(), tree.len());
        assert_eq!(flat.extents.len(), 6 * tree.len());
        assert_eq!(flat.total_events(), 500);

        let mut running = 0;
        for (i, b) in tree.iter().enumerate() {
            if b.is_leaf() {
                assert_eq!(flat.box_type[i], 1);
                assert_eq!(flat.box_event_index[2 * i], running);
                running += flat.box_event_index[2 * i + 1];
                assert_eq!(&flat.box_children[2 * i..2 * i + 2], &[0, 0]);
            } else {
                assert_eq!(flat.box_type[i], 2);
                let range = b.children().unwrap();
                assert_eq!(flat.box_children[2 * i], *range.start() as i64);
                assert_eq!(flat.box_children[2 * i + 1], *range.end() as i64);
            }
        }
        assert_eq!(running, 500);
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let tree = populated_tree();
        assert_eq!(flatten(&tree), flatten(&tree));
    }

    #[test]
    fn test_unflatten_reproduces_tree() {
        let tree = populated_tree();
        let flat = flatten(&tree);
        let rows = flatten_events(&tree).unwrap();
        let rebuilt = unflatten(&flat, EventRows::InMemory(&rows)).unwrap();

        assert_eq!(rebuilt.len(), tree.len());
        assert_eq!(rebuilt.event_count(), tree.event_count());
        for (a, b) in tree.iter().zip(rebuilt.iter()) {
            assert_eq!(a.box_type(), b.box_type());
            assert_eq!(a.depth(), b.depth());
            assert_eq!(a.extents(), b.extents());
            assert_eq!(a.signal(), b.signal());
            assert_eq!(a.error_squared(), b.error_squared());
            assert_eq!(a.parent(), b.parent());
            if a.is_leaf() {
                assert_eq!(tree.leaf_events(a.id()), rebuilt.leaf_events(b.id()));
            }
        }
        assert_eq!(flatten(&rebuilt), flat);
        assert!(rebuilt.check_containment().is_empty());
    }

    #[test]
    fn test_unrefreshed_tree_round_trip_keeps_totals() {
        let mut tree = BoxTree::new(
            BoxControllerConfig::new(2).with_split_threshold(4),
            Extents::new([(0.0, 1.0), (0.0, 1.0)]).unwrap(),
        )
        .unwrap();
        for i in 0..10u32 {
            let v = (i as f64 + 0.5) / 10.0;
            tree.insert_point(&[v, v], 2.0, 0.5, i).unwrap();
        }
        tree.split_if_needed();

        let flat = flatten(&tree);
        assert_eq!(flat.box_signal_errorsquared[0], 20.0);
        assert_eq!(flat.box_signal_errorsquared[1], 5.0);

        let rows = flatten_events(&tree).unwrap();
        let mut rebuilt = unflatten(&flat, EventRows::InMemory(&rows)).unwrap();
        assert_eq!(rebuilt.signal(), 20.0);
        rebuilt.refresh_cache();
        assert_eq!(rebuilt.signal(), 20.0);
        assert_eq!(rebuilt.error_squared(), 5.0);
    }

    #[test]
    fn test_leaf_totals_follow_events_not_stored_cache() {
        let tree = populated_tree();
        let mut flat = flatten(&tree);
        let leaf = tree.leaves().find(|b| b.leaf_event_count() > 0).unwrap().id();
        flat.box_signal_errorsquared[2 * leaf] = -1.0;

        let rows = flatten_events(&tree).unwrap();
        let mut rebuilt = unflatten(&flat, EventRows::InMemory(&rows)).unwrap();
        assert_eq!(rebuilt.get(leaf).unwrap().signal(), tree.get(leaf).unwrap().signal());
        rebuilt.refresh_cache();
        assert_eq!(rebuilt.signal(), tree.signal());
    }

    #[test]
    fn test_unflatten_on_disk_keeps_ranges() {
        let tree = populated_tree();
        let flat = flatten(&tree);
        let rebuilt = unflatten(&flat, EventRows::OnDisk { records: 500 }).unwrap();
        assert_eq!(rebuilt.event_count(), 500);
        let leaf = rebuilt.leaves().find(|b| b.leaf_event_count() > 0).unwrap();
        let range = leaf.as_leaf().unwrap().on_disk().unwrap();
        assert_eq!(range.offset as i64, flat.box_event_index[2 * leaf.id()]);
        assert_eq!(flatten(&rebuilt), flat);
    }

    #[test]
    fn test_unknown_box_type_rejected() {
        let mut flat = flatten(&populated_tree());
        flat.box_type[3] = 7;
        let err = unflatten(&flat, EventRows::OnDisk { records: 500 }).unwrap_err();
        match err {
            BoxError::Structural { array, index, .. } => {
                assert_eq!(array, BOX_TYPE);
                assert_eq!(index, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_child_range_out_of_bounds_rejected() {
        let mut flat = flatten(&populated_tree());
        let n = flat.len() as i64;
        flat.box_children[1] = n + 3;
        let err = unflatten(&flat, EventRows::OnDisk { records: 500 }).unwrap_err();
        assert!(matches!(
            err,
            BoxError::Structural {
                array: BOX_CHILDREN,
                index: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_event_range_out_of_bounds_rejected() {
        let tree = populated_tree();
        let flat = flatten(&tree);
        let err = unflatten(&flat, EventRows::OnDisk { records: 499 }).unwrap_err();
        assert!(matches!(
            err,
            BoxError::Structural {
                array: BOX_EVENT_INDEX,
                ..
            }
        ));
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let mut flat = flatten(&populated_tree());
        flat.depth.pop();
        let err = unflatten(&flat, EventRows::OnDisk { records: 500 }).unwrap_err();
        assert!(matches!(err, BoxError::Structural { array: DEPTH, .. }));
    }

    #[test]
    fn test_none_box_restored_as_empty_leaf() {
        let tree = BoxTree::new(
            BoxControllerConfig::new(1),
            Extents::new([(0.0, 1.0)]).unwrap(),
        )
        .unwrap();
        let mut flat = flatten(&tree);
        flat.box_type[0] = 0;
        let rebuilt = unflatten(&flat, EventRows::InMemory(&[])).unwrap();
        assert!(rebuilt.root().is_leaf());
        assert_eq!(rebuilt.event_count(), 0);

        flat.box_event_index[1] = 1;
        let err = unflatten(&flat, EventRows::OnDisk { records: 1 }).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_shared_child_rejected() {
        let mut tree = BoxTree::new(
            BoxControllerConfig::new(1).with_split_threshold(1),
            Extents::new([(0.0, 4.0)]).unwrap(),
        )
        .unwrap();
        tree.insert_point(&[0.5], 1.0, 1.0, 0).unwrap();
        tree.insert_point(&[1.5], 1.0, 1.0, 0).unwrap();
        tree.insert_point(&[3.5], 1.0, 1.0, 0).unwrap();
        tree.insert_point(&[3.6], 1.0, 1.0, 0).unwrap();
        tree.split_if_needed();
        tree.split_if_needed();
        tree.refresh_cache();
        let mut flat = flatten(&tree);
        // box 2 ([2, 4]) split into 5..=6; point it at box 1's children instead
        assert_eq!(flat.box_type[2], 2);
        flat.box_children[4] = flat.box_children[2];
        flat.box_children[5] = flat.box_children[3];
        let err = unflatten(&flat, EventRows::OnDisk { records: 4 }).unwrap_err();
        assert!(err.is_structural());
    }
}
