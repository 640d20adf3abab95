//! Nodes of the box tree.
//!
//! A box is either a leaf that owns events or an internal box that owns a
//! contiguous range of child ids. Leaves guard their events with their own
//! lock so workers can flush into different leaves at the same time; the
//! tree-wide restructuring phase reaches the contents through `&mut`
//! without locking.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::box_controller::BoxId;
use crate::event::MdEvent;
use crate::extents::Extents;

/// Contiguous run of event records in a backing event dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventRange {
    /// Index of the first record
    pub offset: u64,
    /// Number of records
    pub count: u64,
}

impl EventRange {
    pub fn new(offset: u64, count: u64) -> Self {
        EventRange { offset, count }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.count
    }
}

/// Events and running totals of a leaf.
#[derive(Debug, Default)]
pub struct LeafContents {
    pub(crate) events: Vec<MdEvent>,
    pub(crate) signal: f64,
    pub(crate) error_squared: f64,
    /// Records still on disk, not yet loaded into `events`
    pub(crate) on_disk: Option<EventRange>,
}

impl LeafContents {
    /// Contents holding `events`, with totals summed from them.
    pub(crate) fn from_events(events: Vec<MdEvent>) -> Self {
        let mut contents = LeafContents {
            events,
            ..LeafContents::default()
        };
        contents.recompute_totals();
        contents
    }

    /// Contents whose events are still in the backing file. The stored
    /// totals stand in until the events are read.
    pub(crate) fn on_disk(range: EventRange, signal: f64, error_squared: f64) -> Self {
        LeafContents {
            events: Vec::new(),
            signal,
            error_squared,
            on_disk: Some(range),
        }
    }

    pub(crate) fn recompute_totals(&mut self) {
        let (signal, error_squared) = self
            .events
            .iter()
            .fold((0.0, 0.0), |(s, e), event| (s + event.signal, e + event.error_squared));
        self.signal = signal;
        self.error_squared = error_squared;
    }

    pub(crate) fn push(&mut self, event: MdEvent) {
        self.signal += event.signal;
        self.error_squared += event.error_squared;
        self.events.push(event);
    }

    pub fn event_count(&self) -> u64 {
        self.events.len() as u64 + self.on_disk.map_or(0, |r| r.count)
    }

    pub fn events(&self) -> &[MdEvent] {
        &self.events
    }

    pub fn is_resident(&self) -> bool {
        self.on_disk.is_none()
    }

    pub fn signal(&self) -> f64 {
        self.signal
    }

    pub fn error_squared(&self) -> f64 {
        self.error_squared
    }
}

/// Leaf-only state.
#[derive(Debug, Default)]
pub struct LeafBox {
    contents: Mutex<LeafContents>,
}

impl LeafBox {
    pub(crate) fn with_contents(contents: LeafContents) -> Self {
        LeafBox {
            contents: Mutex::new(contents),
        }
    }

    /// Locks the leaf for a concurrent flush.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, LeafContents> {
        self.contents.lock()
    }

    /// Exclusive access during restructuring; no locking needed.
    pub(crate) fn contents_mut(&mut self) -> &mut LeafContents {
        self.contents.get_mut()
    }

    pub fn event_count(&self) -> u64 {
        self.contents.lock().event_count()
    }

    pub fn is_resident(&self) -> bool {
        self.contents.lock().is_resident()
    }

    /// Copies the in-memory events of this leaf.
    pub fn events(&self) -> Vec<MdEvent> {
        self.contents.lock().events.clone()
    }

    /// Backing records not yet loaded, if any.
    pub fn on_disk(&self) -> Option<EventRange> {
        self.contents.lock().on_disk
    }
}

/// Leaf/internal discriminant as stored in the flat `box_type` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BoxType {
    None = 0,
    Leaf = 1,
    Internal = 2,
}

impl BoxType {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<BoxType> {
        match code {
            0 => Some(BoxType::None),
            1 => Some(BoxType::Leaf),
            2 => Some(BoxType::Internal),
            _ => None,
        }
    }
}

/// Per-kind state of a box
#[derive(Debug)]
pub enum BoxKind {
    /// Owns events directly
    Leaf(LeafBox),
    /// Owns the children `first_child..=last_child`
    Internal {
        first_child: BoxId,
        last_child: BoxId,
    },
}

/// One node of the box tree.
#[derive(Debug)]
pub struct MdBox {
    pub(crate) id: BoxId,
    pub(crate) depth: usize,
    pub(crate) parent: Option<BoxId>,
    pub(crate) extents: Extents,
    pub(crate) inverse_volume: f64,
    /// Cached totals, refreshed bottom-up by the tree
    pub(crate) signal: f64,
    pub(crate) error_squared: f64,
    pub(crate) kind: BoxKind,
}

impl MdBox {
    /// Creates an empty leaf.
    pub(crate) fn new_leaf(id: BoxId, depth: usize, parent: Option<BoxId>, extents: Extents) -> Self {
        MdBox {
            id,
            depth,
            parent,
            inverse_volume: extents.inverse_volume(),
            extents,
            signal: 0.0,
            error_squared: 0.0,
            kind: BoxKind::Leaf(LeafBox::default()),
        }
    }

    pub fn id(&self) -> BoxId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<BoxId> {
        self.parent
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub fn inverse_volume(&self) -> f64 {
        self.inverse_volume
    }

    /// Cached signal; current after the tree's last cache refresh.
    pub fn signal(&self) -> f64 {
        self.signal
    }

    /// Cached squared error; current after the tree's last cache refresh.
    pub fn error_squared(&self) -> f64 {
        self.error_squared
    }

    pub fn kind(&self) -> &BoxKind {
        &self.kind
    }

    pub fn box_type(&self) -> BoxType {
        match self.kind {
            BoxKind::Leaf(_) => BoxType::Leaf,
            BoxKind::Internal { .. } => BoxType::Internal,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, BoxKind::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&LeafBox> {
        match &self.kind {
            BoxKind::Leaf(leaf) => Some(leaf),
            BoxKind::Internal { .. } => None,
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> Option<&mut LeafBox> {
        match &mut self.kind {
            BoxKind::Leaf(leaf) => Some(leaf),
            BoxKind::Internal { .. } => None,
        }
    }

    /// Child id range of an internal box.
    pub fn children(&self) -> Option<RangeInclusive<BoxId>> {
        match self.kind {
            BoxKind::Leaf(_) => None,
            BoxKind::Internal {
                first_child,
                last_child,
            } => Some(first_child..=last_child),
        }
    }

    /// Number of events in this box if it is a leaf, zero otherwise.
    pub fn leaf_event_count(&self) -> u64 {
        self.as_leaf().map_or(0, LeafBox::event_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_leaf() -> MdBox {
        MdBox::new_leaf(0, 0, None, Extents::new([(0.0, 2.0), (0.0, 2.0)]).unwrap())
    }

    #[test]
    fn test_new_leaf() {
        let b = unit_leaf();
        assert!(b.is_leaf());
        assert_eq!(b.box_type(), BoxType::Leaf);
        assert_eq!(b.inverse_volume(), 0.25);
        assert!(b.children().is_none());
        assert_eq!(b.leaf_event_count(), 0);
    }

    #[test]
    fn test_leaf_accumulates_totals() {
        let b = unit_leaf();
        let leaf = b.as_leaf().unwrap();
        leaf.lock().push(MdEvent::new(&[0.5, 0.5], 2.0, 4.0, 0));
        leaf.lock().push(MdEvent::new(&[1.5, 0.5], 3.0, 9.0, 1));
        let contents = leaf.lock();
        assert_eq!(contents.event_count(), 2);
        assert_eq!(contents.signal(), 5.0);
        assert_eq!(contents.error_squared(), 13.0);
        assert!(contents.is_resident());
    }

    #[test]
    fn test_on_disk_events_count() {
        let contents = LeafContents {
            on_disk: Some(EventRange::new(10, 5)),
            ..LeafContents::default()
        };
        let leaf = LeafBox::with_contents(contents);
        assert_eq!(leaf.event_count(), 5);
        assert!(!leaf.is_resident());
        assert_eq!(leaf.on_disk().unwrap().end(), 15);
    }

    #[test]
    fn test_box_type_codes() {
        assert_eq!(BoxType::from_code(0), Some(BoxType::None));
        assert_eq!(BoxType::from_code(1), Some(BoxType::Leaf));
        assert_eq!(BoxType::from_code(2), Some(BoxType::Internal));
        assert_eq!(BoxType::from_code(3), None);
        assert_eq!(BoxType::Internal.code(), 2);
    }
}
