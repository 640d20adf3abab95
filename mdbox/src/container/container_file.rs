//! File-backed container.
//!
//! The file starts with a fixed-size header block. Dataset values follow in
//! one region per dataset, stored as little-endian 8-byte words, and the
//! bincode-encoded catalog sits after the last region. Only the catalog is
//! read on open; rows are read with one seek and one read per request.
//! A dataset rewritten with no more rows than its region holds is
//! overwritten in place; a larger one moves to a fresh region with twice
//! the capacity.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::container_constants::HEADER_SIZE;
use super::container_types::{crc32, Catalog, Dataset, DatasetValues, FileHeader, Group};
use super::DataContainer;
use crate::errors::{BoxError, BoxResult};

/// A self-describing group/dataset container stored in a single file.
pub struct ContainerFile {
    file: Mutex<File>,
    path: PathBuf,
    catalog: Catalog,
    /// End of the catalog as last written; regions are never placed below it
    catalog_end: u64,
}

impl ContainerFile {
    /// Create a new, empty container file
    pub fn create(path: impl AsRef<Path>) -> BoxResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let mut container = Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            catalog: Catalog::default(),
            catalog_end: HEADER_SIZE as u64,
        };
        container.flush()?;
        Ok(container)
    }

    /// Open an existing container file
    pub fn open(path: impl AsRef<Path>) -> BoxResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let (catalog, catalog_end) = Self::read_catalog(&mut file)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            catalog,
            catalog_end,
        })
    }

    /// Open the file if it exists, otherwise create it
    pub fn open_or_create(path: impl AsRef<Path>) -> BoxResult<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Revision of the catalog as last flushed
    pub fn revision(&self) -> u64 {
        self.catalog.revision
    }

    fn read_catalog(file: &mut File) -> BoxResult<(Catalog, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut header_block = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_block)?;
        let (header, _): (FileHeader, usize) =
            bincode::serde::decode_from_slice(&header_block, bincode::config::legacy())?;
        header.validate()?;

        file.seek(SeekFrom::Start(header.catalog_offset))?;
        let mut bytes = vec![0u8; header.catalog_len as usize];
        file.read_exact(&mut bytes)?;
        let actual = crc32(&bytes);
        if actual != header.catalog_checksum {
            return Err(BoxError::Container(format!(
                "Catalog checksum mismatch - possible corruption (expected: {:x}, got: {:x})",
                header.catalog_checksum, actual
            )));
        }

        let (catalog, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
        Ok((catalog, header.catalog_offset + header.catalog_len))
    }

    /// Reads `len` bytes at `offset` (one seek + one read).
    fn read_region(&self, offset: u64, len: usize) -> BoxResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        if len == 0 {
            return Ok(buffer);
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_region(&self, offset: u64, bytes: &[u8]) -> BoxResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// First byte where a new region may start without touching the
    /// catalog currently on disk.
    fn next_free_offset(&self) -> u64 {
        self.catalog.data_end.max(self.catalog_end)
    }

    fn group(&self, group: &str) -> BoxResult<&Group> {
        self.catalog
            .groups
            .get(group)
            .ok_or_else(|| BoxError::GroupNotFound(group.to_string()))
    }

    fn group_mut(&mut self, group: &str) -> BoxResult<&mut Group> {
        self.catalog
            .groups
            .get_mut(group)
            .ok_or_else(|| BoxError::GroupNotFound(group.to_string()))
    }
}

impl DataContainer for ContainerFile {
    fn has_group(&self, group: &str) -> bool {
        self.catalog.groups.contains_key(group)
    }

    fn create_group(&mut self, group: &str) -> BoxResult<()> {
        self.catalog.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn has_dataset(&self, group: &str, name: &str) -> bool {
        self.catalog
            .groups
            .get(group)
            .is_some_and(|g| g.datasets.contains_key(name))
    }

    fn dataset(&self, group: &str, name: &str) -> BoxResult<&Dataset> {
        self.group(group)?
            .datasets
            .get(name)
            .ok_or_else(|| BoxError::DatasetNotFound {
                group: group.to_string(),
                dataset: name.to_string(),
            })
    }

    fn write_dataset(
        &mut self,
        group: &str,
        name: &str,
        columns: usize,
        values: DatasetValues,
    ) -> BoxResult<()> {
        if columns == 0 || values.len() % columns != 0 {
            return Err(BoxError::Container(format!(
                "dataset '{}' has {} values, not a multiple of {} columns",
                name,
                values.len(),
                columns
            )));
        }
        let revision = self.catalog.revision + 1;
        let rows = (values.len() / columns) as u64;
        let next_free = self.next_free_offset();
        let target = self.group_mut(group)?;

        let placed = match target.datasets.get_mut(name) {
            Some(existing) => {
                if existing.columns != columns || existing.value_type != values.value_type() {
                    return Err(BoxError::Container(format!(
                        "dataset '{}' is {} x {}, cannot overwrite with {} x {}",
                        name,
                        existing.value_type.name(),
                        existing.columns,
                        values.type_name(),
                        columns
                    )));
                }
                if !existing.extendable && rows != existing.row_count {
                    return Err(BoxError::Container(format!(
                        "dataset '{}' is not extendable",
                        name
                    )));
                }
                if rows > existing.capacity_rows {
                    log::debug!(
                        "Moving dataset '{}' from offset {} to {} ({} rows)",
                        name,
                        existing.offset,
                        next_free,
                        rows
                    );
                    existing.offset = next_free;
                    existing.capacity_rows = rows.max(existing.capacity_rows * 2);
                }
                existing.row_count = rows;
                existing.modified_revision = revision;
                existing.clone()
            }
            None => {
                let dataset = Dataset {
                    columns,
                    value_type: values.value_type(),
                    offset: next_free,
                    row_count: rows,
                    capacity_rows: rows,
                    extendable: true,
                    created_revision: revision,
                    modified_revision: revision,
                };
                target.datasets.insert(name.to_string(), dataset.clone());
                dataset
            }
        };

        self.catalog.data_end = self.catalog.data_end.max(placed.region_end());
        self.write_region(placed.offset, &values.to_le_bytes())
    }

    fn read_rows(
        &self,
        group: &str,
        name: &str,
        start: usize,
        count: usize,
    ) -> BoxResult<DatasetValues> {
        let dataset = self.dataset(group, name)?;
        let (offset, len) = dataset.row_span(start, count)?;
        let bytes = self.read_region(offset, len)?;
        Ok(DatasetValues::from_le_bytes(dataset.value_type, &bytes))
    }

    fn set_attribute(&mut self, group: &str, name: &str, value: &str) -> BoxResult<()> {
        self.group_mut(group)?
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn attribute(&self, group: &str, name: &str) -> BoxResult<&str> {
        self.group(group)?
            .attributes
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| BoxError::AttributeNotFound {
                group: group.to_string(),
                attribute: name.to_string(),
            })
    }

    fn flush(&mut self) -> BoxResult<()> {
        self.catalog.revision += 1;
        let bytes = bincode::serde::encode_to_vec(&self.catalog, bincode::config::legacy())?;
        let catalog_offset = self.catalog.data_end;

        let header = FileHeader {
            catalog_offset,
            catalog_len: bytes.len() as u64,
            catalog_checksum: crc32(&bytes),
            ..FileHeader::new()
        };
        let mut header_block =
            bincode::serde::encode_to_vec(&header, bincode::config::legacy())?;
        header_block.resize(HEADER_SIZE, 0);

        let catalog_end = catalog_offset + bytes.len() as u64;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(catalog_offset))?;
            file.write_all(&bytes)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header_block)?;
            file.set_len(catalog_end)?;
            file.sync_all()?;
        }
        self.catalog_end = catalog_end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_container_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbox");
        let container = ContainerFile::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(container.revision(), 1);

        let reopened = ContainerFile::open(&path).unwrap();
        assert_eq!(reopened.revision(), 1);
        assert!(!reopened.has_group("box_structure"));
    }

    #[test]
    fn test_dataset_write_read_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbox");
        {
            let mut container = ContainerFile::create(&path).unwrap();
            container.create_group("g").unwrap();
            container
                .write_dataset("g", "ints", 2, DatasetValues::I64(vec![1, 2, 3, 4]))
                .unwrap();
            container.set_attribute("g", "note", "hello").unwrap();
            container.flush().unwrap();
        }

        let container = ContainerFile::open(&path).unwrap();
        let ds = container.dataset("g", "ints").unwrap();
        assert_eq!(ds.rows(), 2);
        assert_eq!(
            container.read_values("g", "ints").unwrap().as_i64().unwrap(),
            &[1, 2, 3, 4]
        );
        assert_eq!(container.attribute("g", "note").unwrap(), "hello");
        assert_eq!(
            container.read_rows("g", "ints", 1, 1).unwrap(),
            DatasetValues::I64(vec![3, 4])
        );
    }

    #[test]
    fn test_dataset_updated_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbox");
        let mut container = ContainerFile::create(&path).unwrap();
        container.create_group("g").unwrap();
        container
            .write_dataset("g", "d", 1, DatasetValues::F64(vec![1.0]))
            .unwrap();
        container.flush().unwrap();
        let created = container.dataset("g", "d").unwrap().created_revision;

        container
            .write_dataset("g", "d", 1, DatasetValues::F64(vec![1.0, 2.0, 3.0]))
            .unwrap();
        container.flush().unwrap();

        let ds = container.dataset("g", "d").unwrap();
        assert_eq!(ds.rows(), 3);
        assert_eq!(ds.created_revision, created);
        assert!(ds.modified_revision > created);
    }

    #[test]
    fn test_rewrite_within_capacity_keeps_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbox");
        let mut container = ContainerFile::create(&path).unwrap();
        container.create_group("g").unwrap();
        container
            .write_dataset("g", "a", 2, DatasetValues::F64(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        container
            .write_dataset("g", "b", 1, DatasetValues::I64(vec![9, 9]))
            .unwrap();
        container.flush().unwrap();
        let offset = container.dataset("g", "a").unwrap().offset;

        container
            .write_dataset("g", "a", 2, DatasetValues::F64(vec![5.0, 6.0]))
            .unwrap();
        container.flush().unwrap();
        assert_eq!(container.dataset("g", "a").unwrap().offset, offset);

        // growing past the region moves the dataset and leaves its neighbour alone
        container
            .write_dataset("g", "a", 2, DatasetValues::F64(vec![0.5; 8]))
            .unwrap();
        container.flush().unwrap();
        let moved = container.dataset("g", "a").unwrap();
        assert_ne!(moved.offset, offset);
        assert_eq!(moved.capacity_rows, 4);
        drop(container);

        let reopened = ContainerFile::open(&path).unwrap();
        assert_eq!(
            reopened.read_values("g", "a").unwrap(),
            DatasetValues::F64(vec![0.5; 8])
        );
        assert_eq!(
            reopened.read_values("g", "b").unwrap(),
            DatasetValues::I64(vec![9, 9])
        );
    }

    #[test]
    fn test_rows_read_from_file_not_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mdbox");
        let mut container = ContainerFile::create(&path).unwrap();
        container.create_group("g").unwrap();
        container
            .write_dataset("g", "d", 2, DatasetValues::F64(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        container.flush().unwrap();
        let (offset, _) = container.dataset("g", "d").unwrap().row_span(1, 1).unwrap();

        {
            let mut other = OpenOptions::new().write(true).open(&path).unwrap();
            other.seek(SeekFrom::Start(offset)).unwrap();
            other.write_all(&42.0f64.to_le_bytes()).unwrap();
        }
        assert_eq!(
            container.read_rows("g", "d", 1, 1).unwrap(),
            DatasetValues::F64(vec![42.0, 4.0])
        );

        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(offset)
            .unwrap();
        assert!(matches!(
            container.read_rows("g", "d", 1, 1),
            Err(BoxError::Io(_))
        ));
        assert_eq!(
            container.read_rows("g", "d", 0, 0).unwrap(),
            DatasetValues::F64(vec![])
        );
    }

    #[test]
    fn test_dataset_shape_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let mut container = ContainerFile::create(dir.path().join("t.mdbox")).unwrap();
        container.create_group("g").unwrap();
        container
            .write_dataset("g", "d", 2, DatasetValues::F64(vec![1.0, 2.0]))
            .unwrap();
        assert!(container
            .write_dataset("g", "d", 3, DatasetValues::F64(vec![1.0, 2.0, 3.0]))
            .is_err());
        assert!(container
            .write_dataset("g", "d", 2, DatasetValues::I64(vec![1, 2]))
            .is_err());
        assert!(container
            .write_dataset("g", "e", 2, DatasetValues::F64(vec![1.0]))
            .is_err());
    }

    #[test]
    fn test_missing_group_dataset_attribute() {
        let dir = tempdir().unwrap();
        let mut container = ContainerFile::create(dir.path().join("t.mdbox")).unwrap();
        assert!(matches!(
            container.dataset("nope", "d"),
            Err(BoxError::GroupNotFound(_))
        ));
        container.create_group("g").unwrap();
        assert!(matches!(
            container.dataset("g", "d"),
            Err(BoxError::DatasetNotFound { .. })
        ));
        assert!(matches!(
            container.attribute("g", "a"),
            Err(BoxError::AttributeNotFound { .. })
        ));
        assert!(container
            .write_dataset("nope", "d", 1, DatasetValues::I64(vec![1]))
            .is_err());
    }

    #[test]
    fn test_corrupted_catalog_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mdbox");
        {
            let mut container = ContainerFile::create(&path).unwrap();
            container.create_group("g").unwrap();
            container.set_attribute("g", "a", "value").unwrap();
            container.flush().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let result = ContainerFile::open(&path);
        assert!(matches!(result, Err(BoxError::Container(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mdbox");
        std::fs::write(&path, vec![0u8; HEADER_SIZE + 16]).unwrap();
        assert!(ContainerFile::open(&path).is_err());
    }

    #[test]
    fn test_open_or_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.mdbox");
        let mut first = ContainerFile::open_or_create(&path).unwrap();
        first.create_group("g").unwrap();
        first.flush().unwrap();
        drop(first);
        let second = ContainerFile::open_or_create(&path).unwrap();
        assert!(second.has_group("g"));
        assert_eq!(second.path(), path.as_path());
    }
}
