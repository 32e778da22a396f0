//! Component, version and format identity for sstable sets
//!
//! An sstable set is identified by `(dir, version, generation, format)`;
//! those four values project onto the filename of every component file.
//! Name lookups in both directions go through constant tables.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// The physical files an sstable set may consist of.
///
/// The enum ordering is the order component names are listed in the TOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentType {
    /// Partition index: one entry per partition, in write order
    Index,
    /// Compression metadata; present iff the table is compressed
    CompressionInfo,
    /// Partition data
    Data,
    /// Table of contents; its presence is the durability commit marker
    Toc,
    /// Sampled index
    Summary,
    /// Full-file checksum of Data, in decimal ASCII
    Digest,
    /// Per-chunk checksums of Data; present iff the table is uncompressed
    Crc,
    /// Bloom filter over partition keys
    Filter,
    /// Validation, compaction and stats metadata
    Statistics,
}

const COMPONENT_NAMES: &[(ComponentType, &str)] = &[
    (ComponentType::Index, "Index.db"),
    (ComponentType::CompressionInfo, "CompressionInfo.db"),
    (ComponentType::Data, "Data.db"),
    (ComponentType::Toc, "TOC.txt"),
    (ComponentType::Summary, "Summary.db"),
    (ComponentType::Digest, "Digest.sha1"),
    (ComponentType::Crc, "CRC.db"),
    (ComponentType::Filter, "Filter.db"),
    (ComponentType::Statistics, "Statistics.db"),
];

impl ComponentType {
    /// The on-disk file name suffix of this component.
    pub fn file_name(self) -> &'static str {
        // The table is keyed by the enum itself, so the scan always hits.
        COMPONENT_NAMES
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, name)| *name)
            .unwrap_or("")
    }

    /// Reverse lookup used by the TOC reader.
    pub fn from_file_name(name: &str) -> Option<Self> {
        COMPONENT_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
    }
}

/// Supported sstable layout versions. A (version, format) pair is never
/// re-used for a different layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// The "la" layout
    La,
}

impl Version {
    /// The version tag as it appears in filenames.
    pub fn as_str(self) -> &'static str {
        match self {
            Version::La => "la",
        }
    }

    /// Parse a version tag from a filename fragment.
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "la" => Ok(Version::La),
            other => Err(Error::malformed(format!("Unknown sstable version: {other}"))),
        }
    }
}

/// Supported sstable formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// The "big" format
    Big,
}

impl Format {
    /// The format tag as it appears in filenames.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Big => "big",
        }
    }

    /// Parse a format tag from a filename fragment.
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "big" => Ok(Format::Big),
            other => Err(Error::malformed(format!("Unknown sstable format: {other}"))),
        }
    }
}

/// Build `<dir>/<version>-<generation>-<format>-<component>`.
pub fn component_filename(
    dir: &Path,
    version: Version,
    generation: u64,
    format: Format,
    component: ComponentType,
) -> PathBuf {
    dir.join(format!(
        "{}-{}-{}-{}",
        version.as_str(),
        generation,
        format.as_str(),
        component.file_name()
    ))
}
