//! Statistics component: validation, compaction and stats metadata
//!
//! The file begins with a sized hash mapping each metadata type to the
//! byte offset of its record; the records follow in ascending offset
//! order. The three record shapes form a tagged union discriminated by
//! the same type id the on-disk hash carries.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::warn;

use crate::encoding::{
    narrow_u32, read_array32_u32, read_array32_u8, read_bool, read_bytes, read_f64, read_i32,
    read_i64, read_string16, read_u32, read_u64, write_array32_u32, write_array32_u8, write_bool,
    write_f64, write_i32, write_i64, write_string16, write_u32, write_u64,
};
use crate::error::{Error, Result};
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// Discriminator of the three metadata records, as serialized in the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetadataType {
    /// Partitioner identity and bloom filter chance
    Validation,
    /// Compaction ancestry and key cardinality
    Compaction,
    /// Timestamps, histograms and column-name bounds
    Stats,
}

impl MetadataType {
    fn as_u32(self) -> u32 {
        match self {
            MetadataType::Validation => 0,
            MetadataType::Compaction => 1,
            MetadataType::Stats => 2,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MetadataType::Validation),
            1 => Some(MetadataType::Compaction),
            2 => Some(MetadataType::Stats),
            _ => None,
        }
    }
}

/// Histogram over exponentially growing buckets.
///
/// In memory `bucket_offsets` is one shorter than `buckets`; the final
/// bucket counts overflow beyond the last offset. On disk the first offset
/// slot is duplicated for symmetry with the source format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatedHistogram {
    /// Upper bound of each bucket except the overflow bucket
    pub bucket_offsets: Vec<u64>,
    /// Observation counts, one per offset plus the overflow bucket
    pub buckets: Vec<u64>,
}

impl EstimatedHistogram {
    /// A histogram with `bucket_count` exponentially growing offsets.
    pub fn new(bucket_count: usize) -> Self {
        let mut offsets = Vec::with_capacity(bucket_count);
        let mut last = 1u64;
        offsets.push(last);
        for _ in 1..bucket_count {
            let next = ((last as f64) * 1.2).round() as u64;
            last = next.max(last + 1);
            offsets.push(last);
        }
        Self {
            buckets: vec![0; offsets.len() + 1],
            bucket_offsets: offsets,
        }
    }

    /// Count one observation.
    pub fn update(&mut self, value: u64) {
        let index = match self.bucket_offsets.binary_search(&value) {
            Ok(i) => i,
            Err(i) if i < self.bucket_offsets.len() => i,
            Err(_) => self.buckets.len() - 1,
        };
        self.buckets[index] += 1;
    }

    /// Fold another histogram of the same shape into this one.
    pub fn merge(&mut self, other: &EstimatedHistogram) {
        for (bucket, count) in self.buckets.iter_mut().zip(&other.buckets) {
            *bucket += count;
        }
    }

    /// Total observations.
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    fn serialized_size(&self) -> u64 {
        4 + self.buckets.len() as u64 * 16
    }

    /// Parse a histogram.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let length = read_u32(src).await? as usize;
        if length == 0 {
            return Err(Error::malformed("Empty estimated histogram"));
        }
        let buf = read_bytes(src, length * 16).await?;

        let mut bucket_offsets = vec![0u64; length - 1];
        let mut buckets = vec![0u64; length];
        for i in 0..length {
            let offset = u64::from_be_bytes(
                buf[i * 16..i * 16 + 8]
                    .try_into()
                    .map_err(|_| Error::malformed("Histogram slice of unexpected size"))?,
            );
            let count = u64::from_be_bytes(
                buf[i * 16 + 8..i * 16 + 16]
                    .try_into()
                    .map_err(|_| Error::malformed("Histogram slice of unexpected size"))?,
            );
            if length > 1 {
                bucket_offsets[if i == 0 { 0 } else { i - 1 }] = offset;
            }
            buckets[i] = count;
        }
        Ok(Self {
            bucket_offsets,
            buckets,
        })
    }

    /// Serialize a histogram, duplicating the first offset slot.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_u32(out, narrow_u32(self.buckets.len())?).await?;
        let mut buf = Vec::with_capacity(self.buckets.len() * 16);
        for (i, bucket) in self.buckets.iter().enumerate() {
            let offset_index = if i == 0 { 0 } else { i - 1 };
            let offset = self.bucket_offsets.get(offset_index).copied().unwrap_or(0);
            buf.extend_from_slice(&offset.to_be_bytes());
            buf.extend_from_slice(&bucket.to_be_bytes());
        }
        out.write_all(&buf).await
    }
}

/// Commit-log position the sstable's data was flushed up to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayPosition {
    /// Commit-log segment id
    pub segment_id: u64,
    /// Byte position within the segment
    pub position: u32,
}

impl ReplayPosition {
    async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let segment_id = read_u64(src).await?;
        let position = read_u32(src).await?;
        Ok(Self {
            segment_id,
            position,
        })
    }

    async fn write(self, out: &mut FileWriter) -> Result<()> {
        write_u64(out, self.segment_id).await?;
        write_u32(out, self.position).await
    }
}

/// Validation metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationMetadata {
    /// Partitioner class name
    pub partitioner: Bytes,
    /// Configured bloom filter false-positive chance
    pub filter_chance: f64,
}

impl ValidationMetadata {
    pub(crate) fn serialized_size(&self) -> u64 {
        2 + self.partitioner.len() as u64 + 8
    }

    async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let partitioner = read_string16(src).await?;
        let filter_chance = read_f64(src).await?;
        Ok(Self {
            partitioner,
            filter_chance,
        })
    }

    async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_string16(out, &self.partitioner).await?;
        write_f64(out, self.filter_chance).await
    }
}

/// Compaction metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionMetadata {
    /// Generations of the sstables this one was compacted from
    pub ancestors: Vec<u32>,
    /// Serialized key-cardinality sketch
    pub cardinality: Vec<u8>,
}

impl CompactionMetadata {
    pub(crate) fn serialized_size(&self) -> u64 {
        4 + self.ancestors.len() as u64 * 4 + 4 + self.cardinality.len() as u64
    }

    async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let ancestors = read_array32_u32(src).await?;
        let cardinality = read_array32_u8(src).await?;
        Ok(Self {
            ancestors,
            cardinality,
        })
    }

    async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_array32_u32(out, &self.ancestors).await?;
        write_array32_u8(out, &self.cardinality).await
    }
}

/// Stats metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsMetadata {
    /// Row size histogram
    pub estimated_row_size: EstimatedHistogram,
    /// Column count histogram
    pub estimated_column_count: EstimatedHistogram,
    /// Commit-log replay position
    pub position: ReplayPosition,
    /// Least write timestamp in the sstable
    pub min_timestamp: i64,
    /// Greatest write timestamp in the sstable
    pub max_timestamp: i64,
    /// Greatest local deletion time in the sstable
    pub max_local_deletion_time: i32,
    /// Compressed/uncompressed ratio, or -1.0 when uncompressed
    pub compression_ratio: f64,
    /// Histogram of tombstone drop times
    pub estimated_tombstone_drop_time: EstimatedHistogram,
    /// Compaction level
    pub sstable_level: u32,
    /// Time of the repair session that produced this sstable, or 0
    pub repaired_at: u64,
    /// Least column name seen, component-wise
    pub min_column_names: Vec<Bytes>,
    /// Greatest column name seen, component-wise
    pub max_column_names: Vec<Bytes>,
    /// Whether any counter cell predates the current shard layout
    pub has_legacy_counter_shards: bool,
}

async fn read_column_names(src: &mut RandomAccessReader) -> Result<Vec<Bytes>> {
    let count = read_u32(src).await? as usize;
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(read_string16(src).await?);
    }
    Ok(names)
}

async fn write_column_names(out: &mut FileWriter, names: &[Bytes]) -> Result<()> {
    write_u32(out, narrow_u32(names.len())?).await?;
    for name in names {
        write_string16(out, name).await?;
    }
    Ok(())
}

fn column_names_size(names: &[Bytes]) -> u64 {
    4 + names.iter().map(|n| 2 + n.len() as u64).sum::<u64>()
}

impl StatsMetadata {
    pub(crate) fn serialized_size(&self) -> u64 {
        self.estimated_row_size.serialized_size()
            + self.estimated_column_count.serialized_size()
            + 12 // replay position
            + 8 + 8 // min/max timestamp
            + 4 // max local deletion time
            + 8 // compression ratio
            + self.estimated_tombstone_drop_time.serialized_size()
            + 4 // sstable level
            + 8 // repaired at
            + column_names_size(&self.min_column_names)
            + column_names_size(&self.max_column_names)
            + 1 // legacy counter shards flag
    }

    async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let estimated_row_size = EstimatedHistogram::read(src).await?;
        let estimated_column_count = EstimatedHistogram::read(src).await?;
        let position = ReplayPosition::read(src).await?;
        let min_timestamp = read_i64(src).await?;
        let max_timestamp = read_i64(src).await?;
        let max_local_deletion_time = read_i32(src).await?;
        let compression_ratio = read_f64(src).await?;
        let estimated_tombstone_drop_time = EstimatedHistogram::read(src).await?;
        let sstable_level = read_u32(src).await?;
        let repaired_at = read_u64(src).await?;
        let min_column_names = read_column_names(src).await?;
        let max_column_names = read_column_names(src).await?;
        let has_legacy_counter_shards = read_bool(src).await?;
        Ok(Self {
            estimated_row_size,
            estimated_column_count,
            position,
            min_timestamp,
            max_timestamp,
            max_local_deletion_time,
            compression_ratio,
            estimated_tombstone_drop_time,
            sstable_level,
            repaired_at,
            min_column_names,
            max_column_names,
            has_legacy_counter_shards,
        })
    }

    async fn write(&self, out: &mut FileWriter) -> Result<()> {
        self.estimated_row_size.write(out).await?;
        self.estimated_column_count.write(out).await?;
        self.position.write(out).await?;
        write_i64(out, self.min_timestamp).await?;
        write_i64(out, self.max_timestamp).await?;
        write_i32(out, self.max_local_deletion_time).await?;
        write_f64(out, self.compression_ratio).await?;
        self.estimated_tombstone_drop_time.write(out).await?;
        write_u32(out, self.sstable_level).await?;
        write_u64(out, self.repaired_at).await?;
        write_column_names(out, &self.min_column_names).await?;
        write_column_names(out, &self.max_column_names).await?;
        write_bool(out, self.has_legacy_counter_shards).await
    }
}

/// One metadata record, discriminated by [`MetadataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    /// Validation record
    Validation(ValidationMetadata),
    /// Compaction record
    Compaction(CompactionMetadata),
    /// Stats record
    Stats(StatsMetadata),
}

impl Metadata {
    /// This record's discriminator.
    pub fn metadata_type(&self) -> MetadataType {
        match self {
            Metadata::Validation(_) => MetadataType::Validation,
            Metadata::Compaction(_) => MetadataType::Compaction,
            Metadata::Stats(_) => MetadataType::Stats,
        }
    }

    pub(crate) fn serialized_size(&self) -> u64 {
        match self {
            Metadata::Validation(v) => v.serialized_size(),
            Metadata::Compaction(c) => c.serialized_size(),
            Metadata::Stats(s) => s.serialized_size(),
        }
    }

    async fn write(&self, out: &mut FileWriter) -> Result<()> {
        match self {
            Metadata::Validation(v) => v.write(out).await,
            Metadata::Compaction(c) => c.write(out).await,
            Metadata::Stats(s) => s.write(out).await,
        }
    }
}

/// In-memory mirror of the Statistics component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    /// Offset of each record from the start of the file
    pub hash: BTreeMap<MetadataType, u32>,
    /// The records themselves
    pub contents: BTreeMap<MetadataType, Metadata>,
}

impl Statistics {
    /// Parse a Statistics component: the hash first, then each record at
    /// its declared offset. Unknown types are logged and skipped.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let count = read_u32(src).await? as usize;
        let mut raw_hash = Vec::with_capacity(count);
        for _ in 0..count {
            let key = read_u32(src).await?;
            let offset = read_u32(src).await?;
            raw_hash.push((key, offset));
        }

        let mut statistics = Statistics::default();
        for (key, offset) in raw_hash {
            let Some(metadata_type) = MetadataType::from_u32(key) else {
                warn!(metadata_type = key, "Invalid metadata type in Statistics file");
                continue;
            };
            statistics.hash.insert(metadata_type, offset);
            src.seek(u64::from(offset)).await?;
            let metadata = match metadata_type {
                MetadataType::Validation => {
                    Metadata::Validation(ValidationMetadata::read(src).await?)
                }
                MetadataType::Compaction => {
                    Metadata::Compaction(CompactionMetadata::read(src).await?)
                }
                MetadataType::Stats => Metadata::Stats(StatsMetadata::read(src).await?),
            };
            statistics.contents.insert(metadata_type, metadata);
        }
        Ok(statistics)
    }

    /// Serialize a Statistics component. The hash goes first; records are
    /// sorted by their declared offsets because the output stream cannot
    /// seek backwards.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_u32(out, narrow_u32(self.hash.len())?).await?;
        for (metadata_type, offset) in &self.hash {
            write_u32(out, metadata_type.as_u32()).await?;
            write_u32(out, *offset).await?;
        }

        let mut ordered: Vec<(u32, MetadataType)> = self
            .hash
            .iter()
            .map(|(metadata_type, offset)| (*offset, *metadata_type))
            .collect();
        ordered.sort_by_key(|(offset, _)| *offset);

        for (_, metadata_type) in ordered {
            let metadata = self.contents.get(&metadata_type).ok_or_else(|| {
                Error::malformed(format!(
                    "Statistics hash names {metadata_type:?} but the record is missing"
                ))
            })?;
            metadata.write(out).await?;
        }
        Ok(())
    }
}
