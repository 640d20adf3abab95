//! Catalog, group and dataset types of the container file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::container_constants::{HEADER_SIZE, MAGIC, VALUE_SIZE, VERSION};
use crate::errors::{BoxError, BoxResult};

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    I64,
    F64,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::I64 => "i64",
            ValueType::F64 => "f64",
        }
    }
}

/// Values of a dataset, stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatasetValues {
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl DatasetValues {
    pub fn len(&self) -> usize {
        match self {
            DatasetValues::I64(v) => v.len(),
            DatasetValues::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            DatasetValues::I64(_) => ValueType::I64,
            DatasetValues::F64(_) => ValueType::F64,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            DatasetValues::I64(v) => Some(v),
            DatasetValues::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            DatasetValues::F64(v) => Some(v),
            DatasetValues::I64(_) => None,
        }
    }

    /// Little-endian payload as written to the file.
    pub(crate) fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() * VALUE_SIZE);
        match self {
            DatasetValues::I64(v) => {
                for x in v {
                    bytes.extend_from_slice(&x.to_le_bytes());
                }
            }
            DatasetValues::F64(v) => {
                for x in v {
                    bytes.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
        bytes
    }

    pub(crate) fn from_le_bytes(value_type: ValueType, bytes: &[u8]) -> DatasetValues {
        let words = bytes.chunks_exact(VALUE_SIZE).map(|chunk| {
            let mut raw = [0u8; VALUE_SIZE];
            raw.copy_from_slice(chunk);
            raw
        });
        match value_type {
            ValueType::I64 => DatasetValues::I64(words.map(i64::from_le_bytes).collect()),
            ValueType::F64 => DatasetValues::F64(words.map(f64::from_le_bytes).collect()),
        }
    }
}

/// Catalog entry of a two-dimensional dataset. The values themselves live
/// in the file at `offset`, in a region with room for `capacity_rows` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: usize,
    pub value_type: ValueType,
    /// Byte offset of the first row in the file
    pub offset: u64,
    pub row_count: u64,
    pub capacity_rows: u64,
    pub extendable: bool,
    /// Catalog revision at which the dataset was created
    pub created_revision: u64,
    /// Catalog revision of the last write
    pub modified_revision: u64,
}

impl Dataset {
    pub fn rows(&self) -> usize {
        self.row_count as usize
    }

    /// Size of one row in bytes
    pub fn row_bytes(&self) -> u64 {
        (self.columns * VALUE_SIZE) as u64
    }

    /// End of the region reserved for this dataset
    pub fn region_end(&self) -> u64 {
        self.offset + self.capacity_rows * self.row_bytes()
    }

    /// File position and length in bytes of `count` rows starting at
    /// `start`.
    pub fn row_span(&self, start: usize, count: usize) -> BoxResult<(u64, usize)> {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.rows())
            .ok_or_else(|| {
                BoxError::Container(format!(
                    "rows {}..{} out of range for dataset with {} rows",
                    start,
                    start.saturating_add(count),
                    self.rows()
                ))
            })?;
        let row_bytes = self.row_bytes();
        Ok((
            self.offset + start as u64 * row_bytes,
            (end - start) * row_bytes as usize,
        ))
    }
}

/// Named datasets plus string attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub datasets: BTreeMap<String, Dataset>,
    pub attributes: BTreeMap<String, String>,
}

/// Groups and dataset locations of a container file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub groups: BTreeMap<String, Group>,
    /// Incremented on every flush
    pub revision: u64,
    /// End of the last dataset region; the catalog is written here
    pub data_end: u64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            revision: 0,
            data_end: HEADER_SIZE as u64,
        }
    }
}

/// File header stored at the beginning of the container file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub catalog_offset: u64,
    pub catalog_len: u64,
    pub catalog_checksum: u32,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            catalog_offset: HEADER_SIZE as u64,
            catalog_len: 0,
            catalog_checksum: 0,
        }
    }

    pub fn validate(&self) -> BoxResult<()> {
        if self.magic != MAGIC {
            return Err(BoxError::Container(
                "Invalid file format (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(BoxError::Container(format!(
                "Unsupported file format version {}",
                self.version
            )));
        }
        Ok(())
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC32-MPEG2 checksum of the encoded catalog
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}
