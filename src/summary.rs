//! Summary component: a sparse sample of the Index
//!
//! The header is big-endian, but `positions` and each entry's `position`
//! are native-endian on disk. That is a known portability hazard of the
//! format, preserved here for compatibility: a Summary written on one
//! architecture is not readable on one of different endianness.
//!
//! `positions[i]` is the byte offset of `entries[i]` measured from the end
//! of the header. At seal time the vector carries one extra trailing
//! sentinel equal to `memory_size`; only the first `entries.len()`
//! positions are persisted, but the in-memory mirror keeps the sentinel so
//! entry bounds never need a conditional.

use byteorder::{ByteOrder, NativeEndian};
use bytes::Bytes;

use crate::encoding::{
    check_buf_size, narrow_u32, read_string32, read_u32, read_u64, write_string32, write_u32,
    write_u64,
};
use crate::error::{Error, Result};
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// Default sampling level: one summary entry per this many partitions.
pub const BASE_SAMPLING_LEVEL: u32 = 128;

const SUMMARY_HEADER_SIZE: u64 = 24;
const ENTRY_POSITION_SIZE: u64 = 8;

/// Fixed header of the Summary component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryHeader {
    /// Minimum number of index entries per summary entry
    pub min_index_interval: u32,
    /// Number of summary entries
    pub size: u32,
    /// Total bytes of the positions block plus the entries block
    pub memory_size: u64,
    /// Actual sampling level
    pub sampling_level: u32,
    /// Entry count the summary would have at full sampling
    pub size_at_full_sampling: u32,
}

/// One sampled index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    /// Partition key bytes
    pub key: Bytes,
    /// Byte offset of this partition's entry in the Index file
    pub position: u64,
}

/// In-memory mirror of the Summary component.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    /// Fixed header
    pub header: SummaryHeader,
    /// Entry offsets from the end of the header, plus the trailing sentinel
    pub positions: Vec<u32>,
    /// Sampled entries in partition-key order
    pub entries: Vec<SummaryEntry>,
    /// First partition key of the sstable
    pub first_key: Bytes,
    /// Last partition key of the sstable
    pub last_key: Bytes,
    keys_written: u64,
}

// keys_written is write-path bookkeeping, not part of the mirrored state.
impl PartialEq for Summary {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.positions == other.positions
            && self.entries == other.entries
            && self.first_key == other.first_key
            && self.last_key == other.last_key
    }
}

impl Summary {
    /// Size the summary for an expected partition count before a write.
    pub fn prepare(expected_partition_count: u64) -> Result<Self> {
        let expected = expected_partition_count.max(1);
        let max_expected_entries = expected.div_ceil(u64::from(BASE_SAMPLING_LEVEL));
        if max_expected_entries > u64::from(u32::MAX) {
            return Err(Error::malformed(format!(
                "Current sampling level ({BASE_SAMPLING_LEVEL}) not enough to generate summary"
            )));
        }

        let mut summary = Summary::default();
        summary.header.min_index_interval = BASE_SAMPLING_LEVEL;
        summary.header.sampling_level = BASE_SAMPLING_LEVEL;
        summary.positions.reserve(max_expected_entries as usize + 1);
        summary.entries.reserve(max_expected_entries as usize);
        Ok(summary)
    }

    /// Record a written key; every `min_index_interval`-th key becomes a
    /// summary entry pointing at the current Index offset.
    pub fn maybe_add_entry(&mut self, key: &[u8], index_offset: u64) {
        if self.keys_written % u64::from(self.header.min_index_interval) == 0 {
            self.entries.push(SummaryEntry {
                key: Bytes::copy_from_slice(key),
                position: index_offset,
            });
        }
        self.keys_written += 1;
    }

    /// Finish the summary once the partition stream ends: fix up the
    /// header, lay out `positions` cumulatively and record the boundary
    /// keys. A missing last key means the sstable holds one partition.
    pub fn seal(&mut self, first_key: Option<Bytes>, last_key: Option<Bytes>) -> Result<()> {
        self.header.size = narrow_u32(self.entries.len())?;
        self.header.size_at_full_sampling = self.header.size;

        let mut memory_size = u64::from(self.header.size) * 4;
        self.positions.clear();
        for entry in &self.entries {
            self.positions.push(
                u32::try_from(memory_size).map_err(|_| Error::Overflow("summary position"))?,
            );
            memory_size += entry.key.len() as u64 + ENTRY_POSITION_SIZE;
        }
        self.positions
            .push(u32::try_from(memory_size).map_err(|_| Error::Overflow("summary position"))?);
        self.header.memory_size = memory_size;

        self.first_key = first_key
            .ok_or_else(|| Error::malformed("Cannot seal summary of an empty sstable"))?;
        self.last_key = last_key.unwrap_or_else(|| self.first_key.clone());
        Ok(())
    }

    /// Bounds-checked access to a sampled entry.
    pub fn entry(&self, i: usize) -> Result<&SummaryEntry> {
        self.entries
            .get(i)
            .ok_or_else(|| Error::malformed(format!("Invalid summary index: {i}")))
    }

    /// Parse a Summary component.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let mut summary = Summary::default();
        summary.header.min_index_interval = read_u32(src).await?;
        summary.header.size = read_u32(src).await?;
        summary.header.memory_size = read_u64(src).await?;
        summary.header.sampling_level = read_u32(src).await?;
        summary.header.size_at_full_sampling = read_u32(src).await?;

        let size = summary.header.size as usize;
        let buf = src.read_exactly(size * 4).await?;
        check_buf_size(&buf, size * 4)?;
        summary.positions = buf.chunks_exact(4).map(NativeEndian::read_u32).collect();
        // The sentinel lets entry i's length be positions[i+1] - positions[i]
        // without a conditional for the final entry.
        summary.positions.push(
            u32::try_from(summary.header.memory_size)
                .map_err(|_| Error::malformed("Summary memory size exceeds 32 bits"))?,
        );

        src.seek(SUMMARY_HEADER_SIZE + summary.header.memory_size).await?;
        summary.first_key = read_string32(src).await?;
        summary.last_key = read_string32(src).await?;

        if size > 0 {
            src.seek(u64::from(summary.positions[0]) + SUMMARY_HEADER_SIZE).await?;
        }
        summary.entries.reserve(size);
        for i in 0..size {
            let pos = summary.positions[i];
            let next = summary.positions[i + 1];
            if next < pos + ENTRY_POSITION_SIZE as u32 {
                return Err(Error::malformed(format!(
                    "Summary entry {i} spans {pos}..{next}"
                )));
            }
            let entry_size = (next - pos) as usize;
            let buf = src.read_exactly(entry_size).await?;
            check_buf_size(&buf, entry_size)?;

            let key_size = entry_size - ENTRY_POSITION_SIZE as usize;
            let position = NativeEndian::read_u64(&buf[key_size..]);
            summary.entries.push(SummaryEntry {
                key: buf.slice(..key_size),
                position,
            });
        }

        if summary.positions.len() != summary.entries.len() + 1 {
            return Err(Error::malformed(
                "Summary positions do not cover its entries",
            ));
        }
        Ok(summary)
    }

    /// Serialize a Summary component. Only the first `entries.len()`
    /// positions are persisted; the sentinel is an in-memory convenience.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_u32(out, self.header.min_index_interval).await?;
        write_u32(out, self.header.size).await?;
        write_u64(out, self.header.memory_size).await?;
        write_u32(out, self.header.sampling_level).await?;
        write_u32(out, self.header.size_at_full_sampling).await?;

        let persisted = self.entries.len().min(self.positions.len());
        let mut buf = vec![0u8; persisted * 4];
        for (i, pos) in self.positions[..persisted].iter().enumerate() {
            NativeEndian::write_u32(&mut buf[i * 4..], *pos);
        }
        out.write_all(&buf).await?;

        let mut position_buf = [0u8; 8];
        for entry in &self.entries {
            out.write_all(&entry.key).await?;
            NativeEndian::write_u64(&mut position_buf, entry.position);
            out.write_all(&position_buf).await?;
        }

        write_string32(out, &self.first_key).await?;
        write_string32(out, &self.last_key).await
    }
}
