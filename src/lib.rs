//! Streaming codec for the la/big sstable on-disk format
//!
//! Reads and writes the immutable multi-file sstable sets of the "la"
//! layout in the "big" format, byte-compatible with the other deployed
//! implementations of that layout. The write path consumes an ordered
//! partition stream and produces Data, Index, Summary, Filter and
//! Statistics in one forward pass, committing the set by writing the TOC
//! last; the read path loads each component on demand through a seekable
//! reader.

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bloom;
pub mod component;
pub mod composite;
pub mod compress;
pub mod encoding;
pub mod error;
pub mod index;
pub mod metadata;
pub mod partition;
pub mod reader;
pub mod schema;
pub mod sstable;
pub mod stats;
pub mod summary;
pub mod writer;

// Re-export the main types for convenience
pub use crate::{
    bloom::BloomFilter,
    component::{ComponentType, Format, Version},
    compress::{Compression, Compressor},
    error::{Error, Result},
    index::{IndexEntry, IndexList},
    metadata::{Metadata, MetadataType, Statistics},
    partition::{
        Cell, ClusteredRow, CollectionCell, ColumnValue, MemorySource, Partition, PartitionSource,
        RangeTombstone, Tombstone,
    },
    schema::{ColumnDefinition, CompressionParams, TableSchema},
    sstable::Sstable,
    summary::Summary,
};
