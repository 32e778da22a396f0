//! Partition data model and the mutation source
//!
//! The encoder consumes a lazy stream of partitions in sorted key order.
//! Cells are a tagged union over their liveness: live, expiring, or a
//! tombstone; collections carry their own tombstone plus element cells.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use crate::encoding::{read_i32, read_i64, write_i32, write_i64};
use crate::error::Result;
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// Flag byte written between a cell's name and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnMask {
    /// Live cell
    None = 0x00,
    /// Cell tombstone
    Deletion = 0x01,
    /// Expiring cell
    Expiration = 0x02,
    /// Counter cell (not produced by this writer)
    Counter = 0x04,
    /// Counter update (not produced by this writer)
    CounterUpdate = 0x08,
    /// Range tombstone marker
    RangeTombstone = 0x10,
}

/// A deletion marker: the write timestamp and the local wall-clock second
/// the deletion happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    /// Write timestamp of the deletion
    pub timestamp: i64,
    /// Local deletion time, seconds since the epoch
    pub deletion_time: i32,
}

/// On-disk partition deletion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionTime {
    /// Seconds since the epoch, or `i32::MAX` when live
    pub local_deletion_time: i32,
    /// Deletion timestamp, or `i64::MIN` when live
    pub marked_for_delete_at: i64,
}

impl DeletionTime {
    /// The record written for live, undeleted partitions.
    pub const LIVE: DeletionTime = DeletionTime {
        local_deletion_time: i32::MAX,
        marked_for_delete_at: i64::MIN,
    };

    /// Whether this record marks an actual deletion.
    pub fn is_live(&self) -> bool {
        *self == Self::LIVE
    }

    /// Parse a deletion record.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let local_deletion_time = read_i32(src).await?;
        let marked_for_delete_at = read_i64(src).await?;
        Ok(Self {
            local_deletion_time,
            marked_for_delete_at,
        })
    }

    /// Serialize a deletion record.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_i32(out, self.local_deletion_time).await?;
        write_i64(out, self.marked_for_delete_at).await
    }
}

impl From<Option<Tombstone>> for DeletionTime {
    fn from(tombstone: Option<Tombstone>) -> Self {
        match tombstone {
            Some(t) => DeletionTime {
                local_deletion_time: t.deletion_time,
                marked_for_delete_at: t.timestamp,
            },
            None => DeletionTime::LIVE,
        }
    }
}

/// An atomic cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// A live cell
    Live {
        /// Write timestamp
        timestamp: i64,
        /// Cell value
        value: Bytes,
    },
    /// A live cell with a time-to-live
    Expiring {
        /// Write timestamp
        timestamp: i64,
        /// TTL in seconds
        ttl: u32,
        /// Absolute expiry, seconds since the epoch
        expiry: u32,
        /// Cell value
        value: Bytes,
    },
    /// A deleted cell
    Tombstone {
        /// Write timestamp
        timestamp: i64,
        /// Local deletion time, seconds since the epoch
        deletion_time: u32,
    },
}

impl Cell {
    /// The cell's write timestamp.
    pub fn timestamp(&self) -> i64 {
        match self {
            Cell::Live { timestamp, .. }
            | Cell::Expiring { timestamp, .. }
            | Cell::Tombstone { timestamp, .. } => *timestamp,
        }
    }
}

/// A collection column value: the collection's own tombstone plus one cell
/// per element, keyed by the element's serialized key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCell {
    /// Tombstone covering the whole collection, if any
    pub tombstone: Option<Tombstone>,
    /// Element cells in element-key order
    pub cells: Vec<(Bytes, Cell)>,
}

/// The value stored under one column of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// A single atomic cell
    Atomic(Cell),
    /// A collection of element cells
    Collection(CollectionCell),
}

/// A tombstone covering a clustering range within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Clustering prefix of the range start
    pub start: Vec<Bytes>,
    /// Clustering prefix of the range end
    pub end: Vec<Bytes>,
    /// The deletion itself
    pub tombstone: Tombstone,
}

/// A row within a partition, addressed by its clustering key.
#[derive(Debug, Clone, Default)]
pub struct ClusteredRow {
    /// Clustering key component values
    pub clustering: Vec<Bytes>,
    /// Row creation timestamp; absent rows write no row marker
    pub created_at: Option<i64>,
    /// Cells by regular-column id
    pub cells: Vec<(u32, ColumnValue)>,
}

/// One partition of the mutation stream.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// Serialized partition key
    pub key: Bytes,
    /// Partition-level tombstone
    pub tombstone: Option<Tombstone>,
    /// Static-row cells by static-column id
    pub static_row: Vec<(u32, ColumnValue)>,
    /// Range tombstones in clustering order
    pub range_tombstones: Vec<RangeTombstone>,
    /// Clustered rows in clustering order
    pub rows: Vec<ClusteredRow>,
}

impl Partition {
    /// A partition with the given serialized key and nothing else.
    pub fn with_key(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            ..Default::default()
        }
    }
}

/// A lazy sequence of partitions in sorted key order.
///
/// Sorted order is a precondition of the encoder, assumed rather than
/// checked; violating it produces an sstable other readers cannot use.
#[async_trait]
pub trait PartitionSource: Send {
    /// The next partition, or `None` at the end of the stream.
    async fn next_partition(&mut self) -> Result<Option<Partition>>;
}

/// A mutation source over an in-memory, already-sorted partition list.
#[derive(Debug, Default)]
pub struct MemorySource {
    partitions: VecDeque<Partition>,
}

impl MemorySource {
    /// Wrap a sorted partition list.
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self {
            partitions: partitions.into(),
        }
    }

    /// Number of partitions remaining.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the source is exhausted.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[async_trait]
impl PartitionSource for MemorySource {
    async fn next_partition(&mut self) -> Result<Option<Partition>> {
        Ok(self.partitions.pop_front())
    }
}
