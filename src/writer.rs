//! Forward-only buffered writing with rolling checksums
//!
//! Component files are produced by a forward-only writer over a file. The
//! Data file additionally accumulates either a per-chunk CRC plus a
//! full-file checksum (uncompressed tables, backing the CRC and Digest
//! components) or compression metadata (compressed tables). Closing is
//! mandatory before a component is considered sealed; the writer is not
//! reusable, so `close` consumes it and syncs the underlying file.

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::compress::{CompressedSink, Compression};
use crate::encoding::{read_array32_u32, read_u32, write_array32_u32, write_u32};
use crate::error::Result;
use crate::reader::RandomAccessReader;

pub(crate) const SSTABLE_BUFFER_SIZE: usize = 64 * 1024;

/// Chunk size for the rolling CRC of uncompressed Data files.
pub const DEFAULT_CRC_CHUNK_SIZE: u32 = 32 * 1024;

/// In-memory mirror of the CRC component: the checksum chunk size and one
/// CRC-32 per chunk of the Data file (the final chunk may be short).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksum {
    /// Size in bytes of the chunks the Data file was checksummed over
    pub chunk_size: u32,
    /// CRC-32 of each chunk, in file order
    pub checksums: Vec<u32>,
}

impl Checksum {
    /// Parse a CRC component.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let chunk_size = read_u32(src).await?;
        let checksums = read_array32_u32(src).await?;
        Ok(Self {
            chunk_size,
            checksums,
        })
    }

    /// Serialize a CRC component.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_u32(out, self.chunk_size).await?;
        write_array32_u32(out, &self.checksums).await
    }
}

/// Everything a sealed writer hands back to its sstable.
#[derive(Debug)]
pub struct Sealed {
    /// CRC-32 over every byte physically written (the Digest value)
    pub full_checksum: u32,
    /// Per-chunk CRCs, present for checksummed writers
    pub checksum: Option<Checksum>,
    /// Compression metadata, present for compressed writers
    pub compression: Option<Compression>,
}

struct ChecksummedSink {
    out: BufWriter<File>,
    chunk_size: u32,
    in_chunk: u32,
    chunk_crc: crc32fast::Hasher,
    full_crc: crc32fast::Hasher,
    checksums: Vec<u32>,
}

impl ChecksummedSink {
    async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let room = (self.chunk_size - self.in_chunk) as usize;
            let take = room.min(buf.len());
            let (part, rest) = buf.split_at(take);
            self.chunk_crc.update(part);
            self.full_crc.update(part);
            self.out.write_all(part).await?;
            self.in_chunk += take as u32;
            if self.in_chunk == self.chunk_size {
                self.roll_chunk();
            }
            buf = rest;
        }
        Ok(())
    }

    fn roll_chunk(&mut self) {
        let crc = std::mem::replace(&mut self.chunk_crc, crc32fast::Hasher::new());
        self.checksums.push(crc.finalize());
        self.in_chunk = 0;
    }

    async fn close(mut self) -> Result<Sealed> {
        if self.in_chunk > 0 {
            self.roll_chunk();
        }
        self.out.flush().await?;
        self.out.into_inner().sync_all().await?;
        Ok(Sealed {
            full_checksum: self.full_crc.finalize(),
            checksum: Some(Checksum {
                chunk_size: self.chunk_size,
                checksums: self.checksums,
            }),
            compression: None,
        })
    }
}

enum Sink {
    Buffered(BufWriter<File>),
    Checksummed(ChecksummedSink),
    Compressed(CompressedSink),
}

/// Forward-only writer over a component file.
///
/// Tracks the logical byte offset: for compressed sinks this is the
/// position in the uncompressed stream, not in the physical file.
pub struct FileWriter {
    sink: Sink,
    offset: u64,
}

impl FileWriter {
    /// Plain buffered writer, used for every component except Data.
    pub fn buffered(file: File) -> Self {
        Self {
            sink: Sink::Buffered(BufWriter::with_capacity(SSTABLE_BUFFER_SIZE, file)),
            offset: 0,
        }
    }

    /// Writer accumulating per-chunk CRCs and a full-file checksum, used
    /// for the Data file of uncompressed tables.
    pub fn checksummed(file: File, chunk_size: u32) -> Self {
        Self {
            sink: Sink::Checksummed(ChecksummedSink {
                out: BufWriter::with_capacity(SSTABLE_BUFFER_SIZE, file),
                chunk_size,
                in_chunk: 0,
                chunk_crc: crc32fast::Hasher::new(),
                full_crc: crc32fast::Hasher::new(),
                checksums: Vec::new(),
            }),
            offset: 0,
        }
    }

    /// Writer dividing the logical stream into compressed chunks, used for
    /// the Data file of compressed tables. `compression` carries the
    /// compressor name and chunk length and accumulates chunk offsets; it
    /// is handed back, sealed, by [`FileWriter::close`].
    pub fn compressed(file: File, compression: Compression) -> Result<Self> {
        Ok(Self {
            sink: Sink::Compressed(CompressedSink::new(file, compression)?),
            offset: 0,
        })
    }

    /// Append bytes to the logical stream.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::Buffered(out) => out.write_all(buf).await?,
            Sink::Checksummed(sink) => sink.write_all(buf).await?,
            Sink::Compressed(sink) => sink.write_all(buf).await?,
        }
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Current logical byte position.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Flush buffered bytes to the file. For compressed sinks only whole
    /// chunks already emitted are flushed; the partial trailing chunk is
    /// written at close.
    pub async fn flush(&mut self) -> Result<()> {
        match &mut self.sink {
            Sink::Buffered(out) => out.flush().await?,
            Sink::Checksummed(sink) => sink.out.flush().await?,
            Sink::Compressed(sink) => sink.flush().await?,
        }
        Ok(())
    }

    /// Flush, sync the underlying file and seal the writer.
    pub async fn close(self) -> Result<Sealed> {
        match self.sink {
            Sink::Buffered(mut out) => {
                out.flush().await?;
                out.into_inner().sync_all().await?;
                Ok(Sealed {
                    full_checksum: 0,
                    checksum: None,
                    compression: None,
                })
            }
            Sink::Checksummed(sink) => sink.close().await,
            Sink::Compressed(sink) => sink.close().await,
        }
    }
}
