//! Self-describing group/dataset container used to persist box trees.
//!
//! The persistence layer only talks to [`DataContainer`], so any
//! hierarchical store with named groups, two-dimensional datasets and
//! string attributes can stand in for the bundled [`ContainerFile`].
//!
//! The catalog (groups, attributes and dataset shapes) is held in memory;
//! dataset values stay in the backing store and are read by row range.

pub mod container_constants;
pub mod container_file;
pub mod container_types;

pub use container_file::ContainerFile;
pub use container_types::{Dataset, DatasetValues, ValueType};

use crate::errors::BoxResult;

/// Narrow interface to a hierarchical data container.
pub trait DataContainer {
    fn has_group(&self, group: &str) -> bool;

    /// Creates the group if it does not exist yet.
    fn create_group(&mut self, group: &str) -> BoxResult<()>;

    fn has_dataset(&self, group: &str, name: &str) -> bool;

    /// Shape and location of a dataset, without its values.
    fn dataset(&self, group: &str, name: &str) -> BoxResult<&Dataset>;

    /// Writes a dataset of `columns` columns. A new dataset is created
    /// extendable; an existing one is updated in place and must keep its
    /// column count and value type.
    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        columns: usize,
        values: DatasetValues,
    ) -> BoxResult<()>;

    /// Reads `count` rows starting at row `start` from the backing store.
    fn read_rows(
        &self,
        group: &str,
        name: &str,
        start: usize,
        count: usize,
    ) -> BoxResult<DatasetValues>;

    /// Reads every row of a dataset.
    fn read_values(&self, group: &str, name: &str) -> BoxResult<DatasetValues> {
        let rows = self.dataset(group, name)?.rows();
        self.read_rows(group, name, 0, rows)
    }

    fn set_attribute(&mut self, group: &str, name: &str, value: &str) -> BoxResult<()>;

    fn attribute(&self, group: &str, name: &str) -> BoxResult<&str>;

    /// Persists pending changes.
    fn flush(&mut self) -> BoxResult<()>;
}
