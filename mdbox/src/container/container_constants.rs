//! Constants for the container file format.

/// Size of the header block at the start of the file
pub const HEADER_SIZE: usize = 4096;

/// Magic number for file format identification
pub const MAGIC: u32 = 0x4D44_4258; // "MDBX"

/// File format version
pub const VERSION: u32 = 1;

/// Size in bytes of one stored value; both value types are 8 bytes wide
pub const VALUE_SIZE: usize = 8;
