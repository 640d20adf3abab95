//! Saving and loading box trees through a [`DataContainer`].
//!
//! A tree is stored in one group holding the flat box arrays, the event
//! records in flattened leaf order, and two attributes: the controller
//! description and the dimensionality.

use std::path::Path;

use crate::box_controller::BoxControllerConfig;
use crate::container::{ContainerFile, DataContainer, DatasetValues, ValueType};
use crate::errors::{BoxError, BoxResult};
use crate::event::MdEvent;
use crate::flat::{
    flatten, flatten_events, unflatten, EventRows, FlatBoxStructure, BOX_CHILDREN,
    BOX_EVENT_INDEX, BOX_SIGNAL_ERRORSQUARED, BOX_TYPE, DEPTH, EVENT_DATA, EXTENTS,
    INVERSE_VOLUME,
};
use crate::md_box::EventRange;
use crate::tree::{BoxTree, EventSource};

/// Group used when the caller does not name one
pub const DEFAULT_GROUP: &str = "box_structure";

/// Attribute holding the JSON controller description
pub const CONTROLLER_ATTRIBUTE: &str = "box_controller";

/// Attribute holding the number of dimensions
pub const NDIM_ATTRIBUTE: &str = "ndim";

/// How leaf events are brought back when loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Read every leaf's events into memory
    #[default]
    InMemory,
    /// Keep only each leaf's `(offset, count)`; read events later with
    /// [`BoxTree::load_leaf_events`] and a [`ContainerEventSource`]
    FileBacked,
}

/// Writes `tree` into `group`, creating the datasets on first save and
/// updating them in place afterwards. Refreshes the cached totals first.
///
/// # Errors
///
/// Returns [`BoxError::EventsNotLoaded`] if some leaf of a file-backed tree
/// still has its events on disk, or any container error.
pub fn save(tree: &mut BoxTree, container: &mut dyn DataContainer, group: &str) -> BoxResult<()> {
    tree.refresh_cache();
    let events = flatten_events(tree)?;
    let flat = flatten(tree);
    let ndim = flat.ndim();

    container.create_group(group)?;
    container.write_dataset(group, BOX_TYPE, 1, DatasetValues::I64(flat.box_type))?;
    container.write_dataset(group, DEPTH, 1, DatasetValues::I64(flat.depth))?;
    container.write_dataset(
        group,
        INVERSE_VOLUME,
        1,
        DatasetValues::F64(flat.inverse_volume),
    )?;
    container.write_dataset(group, EXTENTS, 2 * ndim, DatasetValues::F64(flat.extents))?;
    container.write_dataset(group, BOX_CHILDREN, 2, DatasetValues::I64(flat.box_children))?;
    container.write_dataset(
        group,
        BOX_SIGNAL_ERRORSQUARED,
        2,
        DatasetValues::F64(flat.box_signal_errorsquared),
    )?;
    container.write_dataset(
        group,
        BOX_EVENT_INDEX,
        2,
        DatasetValues::I64(flat.box_event_index),
    )?;
    container.write_dataset(
        group,
        EVENT_DATA,
        MdEvent::row_width(ndim),
        DatasetValues::F64(events),
    )?;

    container.set_attribute(group, CONTROLLER_ATTRIBUTE, &flat.controller.to_description()?)?;
    container.set_attribute(group, NDIM_ATTRIBUTE, &ndim.to_string())?;
    container.flush()?;

    log::debug!(
        "Saved {} boxes and {} events to group '{}'",
        tree.len(),
        tree.event_count(),
        group
    );
    Ok(())
}

/// Rebuilds the tree stored in `group`.
///
/// # Errors
///
/// Returns a [`BoxError::Structural`] naming the array and index when the
/// stored arrays are inconsistent, or any container error.
pub fn load(container: &dyn DataContainer, group: &str, mode: LoadMode) -> BoxResult<BoxTree> {
    let result = read_tree(container, group, mode);
    if let Err(err) = &result {
        log::error!("Failed to load box structure from group '{}': {}", group, err);
    }
    result
}

/// Creates (or opens) the container file at `path` and saves `tree` into
/// `group`.
pub fn save_file(tree: &mut BoxTree, path: impl AsRef<Path>, group: &str) -> BoxResult<()> {
    let mut container = ContainerFile::open_or_create(path)?;
    save(tree, &mut container, group)
}

/// Opens the container file at `path` and loads every event of `group`.
pub fn load_file(path: impl AsRef<Path>, group: &str) -> BoxResult<BoxTree> {
    let container = ContainerFile::open(path)?;
    load(&container, group, LoadMode::InMemory)
}

fn read_tree(container: &dyn DataContainer, group: &str, mode: LoadMode) -> BoxResult<BoxTree> {
    let ndim: usize = container
        .attribute(group, NDIM_ATTRIBUTE)?
        .trim()
        .parse()
        .map_err(|_| BoxError::Container(format!("invalid '{}' attribute", NDIM_ATTRIBUTE)))?;
    let controller =
        BoxControllerConfig::from_description(container.attribute(group, CONTROLLER_ATTRIBUTE)?)?;
    if controller.ndim != ndim {
        return Err(BoxError::DimensionMismatch {
            expected: ndim,
            actual: controller.ndim,
        });
    }

    let flat = FlatBoxStructure {
        controller,
        box_type: read_i64(container, group, BOX_TYPE)?,
        depth: read_i64(container, group, DEPTH)?,
        inverse_volume: read_f64(container, group, INVERSE_VOLUME)?,
        extents: read_f64(container, group, EXTENTS)?,
        box_children: read_i64(container, group, BOX_CHILDREN)?,
        box_signal_errorsquared: read_f64(container, group, BOX_SIGNAL_ERRORSQUARED)?,
        box_event_index: read_i64(container, group, BOX_EVENT_INDEX)?,
    };

    let events = container.dataset(group, EVENT_DATA)?;
    if events.columns != MdEvent::row_width(ndim) {
        return Err(BoxError::structural(
            EVENT_DATA,
            0,
            format!(
                "{} columns, expected {}",
                events.columns,
                MdEvent::row_width(ndim)
            ),
        ));
    }

    if events.value_type != ValueType::F64 {
        return Err(BoxError::structural(EVENT_DATA, 0, "expected float values"));
    }
    let records = events.rows() as u64;

    let tree = match mode {
        LoadMode::InMemory => {
            let values = container.read_values(group, EVENT_DATA)?;
            let rows = values
                .as_f64()
                .ok_or_else(|| BoxError::structural(EVENT_DATA, 0, "expected float values"))?;
            unflatten(&flat, EventRows::InMemory(rows))?
        }
        LoadMode::FileBacked => unflatten(&flat, EventRows::OnDisk { records })?,
    };

    log::debug!(
        "Loaded {} boxes and {} events from group '{}'",
        tree.len(),
        tree.event_count(),
        group
    );
    Ok(tree)
}

fn read_i64(container: &dyn DataContainer, group: &str, name: &'static str) -> BoxResult<Vec<i64>> {
    match container.read_values(group, name)? {
        DatasetValues::I64(values) => Ok(values),
        DatasetValues::F64(_) => Err(BoxError::structural(name, 0, "expected integer values")),
    }
}

fn read_f64(container: &dyn DataContainer, group: &str, name: &'static str) -> BoxResult<Vec<f64>> {
    match container.read_values(group, name)? {
        DatasetValues::F64(values) => Ok(values),
        DatasetValues::I64(_) => Err(BoxError::structural(name, 0, "expected float values")),
    }
}

/// Reads the event records of file-backed leaves from the `event_data`
/// dataset of a group, one row range per leaf, straight from the container.
pub struct ContainerEventSource<'a> {
    container: &'a dyn DataContainer,
    group: String,
}

impl<'a> ContainerEventSource<'a> {
    pub fn new(container: &'a dyn DataContainer, group: &str) -> Self {
        ContainerEventSource {
            container,
            group: group.to_string(),
        }
    }
}

impl EventSource for ContainerEventSource<'_> {
    fn read_events(&self, range: EventRange) -> BoxResult<Vec<MdEvent>> {
        let columns = self.container.dataset(&self.group, EVENT_DATA)?.columns;
        let values = self.container.read_rows(
            &self.group,
            EVENT_DATA,
            range.offset as usize,
            range.count as usize,
        )?;
        let rows = values
            .as_f64()
            .ok_or_else(|| BoxError::structural(EVENT_DATA, 0, "expected float values"))?;
        Ok(rows
            .chunks_exact(columns)
            .map(MdEvent::from_row)
            .collect())
    }
}
