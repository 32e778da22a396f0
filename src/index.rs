//! Index entry codec
//!
//! The Index file is a dense sequence of entries, one per partition in
//! write order: the partition key, the partition's byte offset in the Data
//! file, and the promoted index, which this format version always leaves
//! empty.

use bytes::Bytes;

use crate::encoding::{read_string16, read_string32, read_u64, write_string16, write_u32, write_u64};
use crate::error::Result;
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// One entry of the Index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Partition key bytes
    pub key: Bytes,
    /// Byte offset of the partition in the Data file
    pub position: u64,
    /// Promoted index bytes; reserved, always empty in this version
    pub promoted_index: Bytes,
}

/// A run of parsed index entries.
pub type IndexList = Vec<IndexEntry>;

impl IndexEntry {
    /// Parse one entry.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let key = read_string16(src).await?;
        let position = read_u64(src).await?;
        let promoted_index = read_string32(src).await?;
        Ok(Self {
            key,
            position,
            promoted_index,
        })
    }

    /// Write one entry for the given key and Data offset.
    pub(crate) async fn write_parts(out: &mut FileWriter, key: &[u8], position: u64) -> Result<()> {
        write_string16(out, key).await?;
        write_u64(out, position).await?;
        // empty promoted index
        write_u32(out, 0).await
    }
}
