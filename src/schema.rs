//! Schema collaborator
//!
//! The schema system is external to the codec; this is the narrow surface
//! the encoder consumes: compoundness, column definitions by id, the bloom
//! filter false-positive chance, compressor parameters and the partitioner
//! name recorded in Validation metadata.

use bytes::Bytes;

use crate::compress::{Compressor, DEFAULT_CHUNK_LENGTH};
use crate::error::{Error, Result};

const DEFAULT_PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";
const DEFAULT_BLOOM_FILTER_FP_CHANCE: f64 = 0.01;

/// A column known to the schema.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Serialized column name
    pub name: Bytes,
}

impl ColumnDefinition {
    /// Define a column by name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_ref()),
        }
    }
}

/// Compressor selection for the Data file.
#[derive(Debug, Clone, Copy)]
pub struct CompressionParams {
    /// Which registered compressor to use; `None` produces a CRC component
    /// instead of CompressionInfo
    pub compressor: Compressor,
    /// Uncompressed bytes per chunk
    pub chunk_length: u32,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            compressor: Compressor::None,
            chunk_length: DEFAULT_CHUNK_LENGTH,
        }
    }
}

/// The slice of the schema the codec needs.
#[derive(Debug, Clone)]
pub struct TableSchema {
    compound: bool,
    regular_columns: Vec<ColumnDefinition>,
    static_columns: Vec<ColumnDefinition>,
    bloom_filter_fp_chance: f64,
    compression: CompressionParams,
    partitioner: String,
}

impl TableSchema {
    /// A schema with the given compoundness and no columns.
    pub fn new(compound: bool) -> Self {
        Self {
            compound,
            regular_columns: Vec::new(),
            static_columns: Vec::new(),
            bloom_filter_fp_chance: DEFAULT_BLOOM_FILTER_FP_CHANCE,
            compression: CompressionParams::default(),
            partitioner: DEFAULT_PARTITIONER.to_string(),
        }
    }

    /// Append a regular column; its id is its position.
    pub fn with_regular_column(mut self, name: impl AsRef<[u8]>) -> Self {
        self.regular_columns.push(ColumnDefinition::new(name));
        self
    }

    /// Append a static column; its id is its position.
    pub fn with_static_column(mut self, name: impl AsRef<[u8]>) -> Self {
        self.static_columns.push(ColumnDefinition::new(name));
        self
    }

    /// Override the bloom filter false-positive chance. A value of 1.0
    /// disables the Filter component.
    pub fn with_bloom_filter_fp_chance(mut self, fp_chance: f64) -> Self {
        self.bloom_filter_fp_chance = fp_chance;
        self
    }

    /// Override the compressor parameters.
    pub fn with_compression(mut self, params: CompressionParams) -> Self {
        self.compression = params;
        self
    }

    /// Override the partitioner name.
    pub fn with_partitioner(mut self, partitioner: impl Into<String>) -> Self {
        self.partitioner = partitioner.into();
        self
    }

    /// Whether column names are composites over a clustering prefix.
    pub fn is_compound(&self) -> bool {
        self.compound
    }

    /// Look up a regular column by id.
    pub fn regular_column_at(&self, id: u32) -> Result<&ColumnDefinition> {
        self.regular_columns
            .get(id as usize)
            .ok_or_else(|| Error::malformed(format!("Unknown regular column id: {id}")))
    }

    /// Look up a static column by id.
    pub fn static_column_at(&self, id: u32) -> Result<&ColumnDefinition> {
        self.static_columns
            .get(id as usize)
            .ok_or_else(|| Error::malformed(format!("Unknown static column id: {id}")))
    }

    /// Configured false-positive probability for the bloom filter.
    pub fn bloom_filter_fp_chance(&self) -> f64 {
        self.bloom_filter_fp_chance
    }

    /// Compressor parameters for the Data file.
    pub fn compressor_params(&self) -> &CompressionParams {
        &self.compression
    }

    /// Partitioner name recorded in Validation metadata.
    pub fn partitioner(&self) -> &str {
        &self.partitioner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_lookup() {
        let schema = TableSchema::new(true)
            .with_regular_column("v")
            .with_static_column("s");

        assert_eq!(&schema.regular_column_at(0).unwrap().name[..], b"v");
        assert_eq!(&schema.static_column_at(0).unwrap().name[..], b"s");
        assert!(schema.regular_column_at(1).is_err());
    }

    #[test]
    fn test_defaults() {
        let schema = TableSchema::new(false);
        assert!(!schema.is_compound());
        assert_eq!(schema.bloom_filter_fp_chance(), 0.01);
        assert_eq!(schema.compressor_params().compressor, Compressor::None);
        assert!(schema.partitioner().contains("Murmur3"));
    }
}
