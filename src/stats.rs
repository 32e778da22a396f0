//! Column statistics collected during a write
//!
//! The encoder folds per-partition [`ColumnStats`] into a
//! [`MetadataCollector`], which ultimately seals the Statistics component:
//! record offsets are computed before anything is written because the
//! output stream cannot seek.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use bytes::Bytes;

use crate::error::Result;
use crate::metadata::{
    CompactionMetadata, EstimatedHistogram, Metadata, MetadataType, ReplayPosition, Statistics,
    StatsMetadata, ValidationMetadata,
};

const ROW_SIZE_BUCKETS: usize = 150;
const COLUMN_COUNT_BUCKETS: usize = 114;
const TOMBSTONE_BUCKETS: usize = 90;

/// Ratio recorded when the sstable is not compressed.
pub const NO_COMPRESSION_RATIO: f64 = -1.0;

/// Per-partition accumulator, reset after each partition is folded into
/// the collector.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    /// Data offset where the current partition began
    pub start_offset: u64,
    /// Serialized size of the current partition
    pub row_size: u64,
    /// Cells written in the current partition
    pub column_count: u64,
    /// Least write timestamp seen
    pub min_timestamp: i64,
    /// Greatest write timestamp seen
    pub max_timestamp: i64,
    /// Greatest local deletion time seen
    pub max_local_deletion_time: i32,
    /// Tombstone drop times seen in this partition
    pub tombstone_histogram: EstimatedHistogram,
    /// Least column name seen, component-wise
    pub min_column_names: Vec<Bytes>,
    /// Greatest column name seen, component-wise
    pub max_column_names: Vec<Bytes>,
}

impl Default for ColumnStats {
    fn default() -> Self {
        Self {
            start_offset: 0,
            row_size: 0,
            column_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_local_deletion_time: i32::MIN,
            tombstone_histogram: EstimatedHistogram::new(TOMBSTONE_BUCKETS),
            min_column_names: Vec::new(),
            max_column_names: Vec::new(),
        }
    }
}

impl ColumnStats {
    /// Fold one cell timestamp.
    pub fn update_timestamp(&mut self, timestamp: i64) {
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }

    /// Fold one local deletion time.
    pub fn update_local_deletion_time(&mut self, deletion_time: i32) {
        self.max_local_deletion_time = self.max_local_deletion_time.max(deletion_time);
    }

    /// Fold one written column name, given as its component values with the
    /// clustering prefix merged in front.
    pub fn update_column_names(&mut self, components: &[Bytes]) {
        min_components(&mut self.min_column_names, components);
        max_components(&mut self.max_column_names, components);
    }
}

// Component-wise trackers: position i holds the extreme value observed at
// component index i, and the tracker grows to the longest observed
// composite.
fn min_components(current: &mut Vec<Bytes>, candidate: &[Bytes]) {
    for (i, component) in candidate.iter().enumerate() {
        match current.get_mut(i) {
            Some(existing) => {
                if component < existing {
                    *existing = component.clone();
                }
            }
            None => current.push(component.clone()),
        }
    }
}

fn max_components(current: &mut Vec<Bytes>, candidate: &[Bytes]) {
    for (i, component) in candidate.iter().enumerate() {
        match current.get_mut(i) {
            Some(existing) => {
                if component > existing {
                    *existing = component.clone();
                }
            }
            None => current.push(component.clone()),
        }
    }
}

// Fixed-register cardinality sketch fed by every partition key; only its
// serialized form matters to the codec, as the Compaction record's blob.
#[derive(Debug, Clone)]
struct CardinalitySketch {
    registers: Vec<u8>,
}

impl CardinalitySketch {
    const REGISTER_BITS: u32 = 10;

    fn new() -> Self {
        Self {
            registers: vec![0; 1 << Self::REGISTER_BITS],
        }
    }

    fn add(&mut self, key: &[u8]) {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        let hash = hasher.finish();

        let index = (hash >> (64 - Self::REGISTER_BITS)) as usize;
        let rank = ((hash << Self::REGISTER_BITS) | 1).leading_zeros() as u8 + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.registers.clone()
    }
}

/// Accumulates write-wide statistics and seals the Statistics component.
#[derive(Debug, Clone)]
pub struct MetadataCollector {
    estimated_row_size: EstimatedHistogram,
    estimated_column_count: EstimatedHistogram,
    tombstone_histogram: EstimatedHistogram,
    min_timestamp: i64,
    max_timestamp: i64,
    max_local_deletion_time: i32,
    min_column_names: Vec<Bytes>,
    max_column_names: Vec<Bytes>,
    ancestors: Vec<u32>,
    cardinality: CardinalitySketch,
    compression_ratio: f64,
    replay_position: ReplayPosition,
    sstable_level: u32,
    repaired_at: u64,
}

impl Default for MetadataCollector {
    fn default() -> Self {
        Self {
            estimated_row_size: EstimatedHistogram::new(ROW_SIZE_BUCKETS),
            estimated_column_count: EstimatedHistogram::new(COLUMN_COUNT_BUCKETS),
            tombstone_histogram: EstimatedHistogram::new(TOMBSTONE_BUCKETS),
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_local_deletion_time: i32::MIN,
            min_column_names: Vec::new(),
            max_column_names: Vec::new(),
            ancestors: Vec::new(),
            cardinality: CardinalitySketch::new(),
            compression_ratio: NO_COMPRESSION_RATIO,
            replay_position: ReplayPosition::default(),
            sstable_level: 0,
            repaired_at: 0,
        }
    }
}

impl MetadataCollector {
    /// Feed one partition key into the cardinality sketch.
    pub fn add_key(&mut self, key: &[u8]) {
        self.cardinality.add(key);
    }

    /// Record a compaction ancestor generation.
    pub fn add_ancestor(&mut self, generation: u32) {
        self.ancestors.push(generation);
    }

    /// Record the achieved compression ratio.
    pub fn add_compression_ratio(&mut self, compressed: u64, uncompressed: u64) {
        if uncompressed > 0 {
            self.compression_ratio = compressed as f64 / uncompressed as f64;
        }
    }

    /// Fold one partition's accumulated stats.
    pub fn update(&mut self, stats: ColumnStats) {
        self.estimated_row_size.update(stats.row_size);
        self.estimated_column_count.update(stats.column_count);
        self.tombstone_histogram.merge(&stats.tombstone_histogram);
        self.min_timestamp = self.min_timestamp.min(stats.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(stats.max_timestamp);
        self.max_local_deletion_time = self
            .max_local_deletion_time
            .max(stats.max_local_deletion_time);
        min_components(&mut self.min_column_names, &stats.min_column_names);
        max_components(&mut self.max_column_names, &stats.max_column_names);
    }

    fn construct_compaction(&self) -> CompactionMetadata {
        CompactionMetadata {
            ancestors: self.ancestors.clone(),
            cardinality: self.cardinality.to_bytes(),
        }
    }

    fn construct_stats(&self) -> StatsMetadata {
        StatsMetadata {
            estimated_row_size: self.estimated_row_size.clone(),
            estimated_column_count: self.estimated_column_count.clone(),
            position: self.replay_position,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            max_local_deletion_time: self.max_local_deletion_time,
            compression_ratio: self.compression_ratio,
            estimated_tombstone_drop_time: self.tombstone_histogram.clone(),
            sstable_level: self.sstable_level,
            repaired_at: self.repaired_at,
            min_column_names: self.min_column_names.clone(),
            max_column_names: self.max_column_names.clone(),
            has_legacy_counter_shards: false,
        }
    }

    /// Lay the three records out behind the hash and return the sealed
    /// Statistics mirror. Offsets account for the hash itself, so records
    /// land exactly where the hash claims.
    pub fn seal_statistics(&self, partitioner: &str, filter_chance: f64) -> Result<Statistics> {
        const METADATA_TYPE_COUNT: u32 = 3;

        let validation = ValidationMetadata {
            partitioner: Bytes::copy_from_slice(partitioner.as_bytes()),
            filter_chance,
        };
        let compaction = self.construct_compaction();
        let stats = self.construct_stats();

        let mut statistics = Statistics::default();
        let mut offset = 4 + METADATA_TYPE_COUNT * 8;

        statistics.hash.insert(MetadataType::Validation, offset);
        offset += validation.serialized_size() as u32;
        statistics
            .contents
            .insert(MetadataType::Validation, Metadata::Validation(validation));

        statistics.hash.insert(MetadataType::Compaction, offset);
        offset += compaction.serialized_size() as u32;
        statistics
            .contents
            .insert(MetadataType::Compaction, Metadata::Compaction(compaction));

        statistics.hash.insert(MetadataType::Stats, offset);
        statistics
            .contents
            .insert(MetadataType::Stats, Metadata::Stats(stats));
        Ok(statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_component_trackers() {
        let mut stats = ColumnStats::default();
        stats.update_column_names(&[b(b"b"), b(b"m")]);
        stats.update_column_names(&[b(b"a"), b(b"z"), b(b"x")]);

        assert_eq!(stats.min_column_names, vec![b(b"a"), b(b"m"), b(b"x")]);
        assert_eq!(stats.max_column_names, vec![b(b"b"), b(b"z"), b(b"x")]);
    }

    #[test]
    fn test_collector_folds_partitions() {
        let mut collector = MetadataCollector::default();

        let mut first = ColumnStats::default();
        first.row_size = 40;
        first.column_count = 1;
        first.update_timestamp(100);
        collector.update(first);

        let mut second = ColumnStats::default();
        second.row_size = 90;
        second.column_count = 3;
        second.update_timestamp(50);
        second.update_local_deletion_time(1_400_000_000);
        second.tombstone_histogram.update(1_400_000_000);
        collector.update(second);

        let stats = collector.construct_stats();
        assert_eq!(stats.min_timestamp, 50);
        assert_eq!(stats.max_timestamp, 100);
        assert_eq!(stats.max_local_deletion_time, 1_400_000_000);
        assert_eq!(stats.estimated_row_size.count(), 2);
        assert_eq!(stats.estimated_tombstone_drop_time.count(), 1);
    }

    #[test]
    fn test_seal_statistics_offsets_ascend() {
        let mut collector = MetadataCollector::default();
        collector.add_key(b"key");

        let statistics = collector.seal_statistics("TestPartitioner", 0.01).unwrap();
        assert_eq!(statistics.hash.len(), 3);
        assert_eq!(statistics.contents.len(), 3);
        assert_eq!(statistics.hash[&MetadataType::Validation], 28);

        assert!(
            statistics.hash[&MetadataType::Validation]
                < statistics.hash[&MetadataType::Compaction]
        );
        assert!(
            statistics.hash[&MetadataType::Compaction] < statistics.hash[&MetadataType::Stats]
        );

        // each record starts where the previous one ends
        let validation_size = statistics.contents[&MetadataType::Validation].serialized_size();
        assert_eq!(
            statistics.hash[&MetadataType::Compaction],
            28 + validation_size as u32
        );
    }

    #[test]
    fn test_cardinality_sketch_registers() {
        let mut sketch = CardinalitySketch::new();
        for i in 0..1000u32 {
            sketch.add(&i.to_be_bytes());
        }
        let bytes = sketch.to_bytes();
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().any(|register| *register > 0));
    }

    #[test]
    fn test_compression_ratio_default() {
        let collector = MetadataCollector::default();
        assert_eq!(
            collector.construct_stats().compression_ratio,
            NO_COMPRESSION_RATIO
        );

        let mut collector = MetadataCollector::default();
        collector.add_compression_ratio(50, 100);
        assert_eq!(collector.construct_stats().compression_ratio, 0.5);
    }
}
