//! Block compression for the Data file
//!
//! A compressed Data file is a sequence of chunks: each chunk holds
//! `chunk_len` bytes of the logical stream (less for the final chunk),
//! compressed and followed by a 32-bit CRC of the compressed bytes. The
//! CompressionInfo component records where each chunk starts so readers can
//! seek by logical offset. Compressors themselves are opaque to the codec;
//! the registry maps the names carried in the metadata to block
//! compress/decompress pairs.

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::encoding::{
    check_buf_size, narrow_u32, read_array32_u64, read_string16, read_u32, read_u64,
    write_array32_u64, write_string16, write_u32, write_u64,
};
use crate::error::{Error, Result};
use crate::reader::RandomAccessReader;
use crate::writer::{FileWriter, Sealed, SSTABLE_BUFFER_SIZE};

/// Default uncompressed chunk length when the schema does not override it.
pub const DEFAULT_CHUNK_LENGTH: u32 = 65536;

const CHUNK_CRC_SIZE: u64 = 4;

/// Block compressors understood by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    /// No compression; the table carries a CRC component instead
    None,
    /// LZ4 block compression
    Lz4,
    /// Snappy block compression
    Snappy,
    /// Deflate block compression
    Deflate,
}

const COMPRESSOR_NAMES: &[(Compressor, &str)] = &[
    (Compressor::None, "none"),
    (Compressor::Lz4, "lz4"),
    (Compressor::Snappy, "snappy"),
    (Compressor::Deflate, "deflate"),
];

impl Compressor {
    /// The registry name recorded in CompressionInfo.
    pub fn name(self) -> &'static str {
        COMPRESSOR_NAMES
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, name)| *name)
            .unwrap_or("none")
    }

    /// Resolve a registry name.
    pub fn from_name(name: &str) -> Result<Self> {
        COMPRESSOR_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(c, _)| *c)
            .ok_or_else(|| Error::malformed(format!("Unknown compressor: {name}")))
    }

    /// Compress one block.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::None => Ok(data.to_vec()),
            Compressor::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compressor::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder
                    .compress_vec(data)
                    .map_err(|e| Error::malformed(format!("snappy compression failed: {e}")))
            }
            Compressor::Deflate => {
                use flate2::write::DeflateEncoder;
                use std::io::Write;

                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decompress one block, checking the result against the length the
    /// compression metadata promises.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compressor::None => data.to_vec(),
            Compressor::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::malformed(format!("lz4 decompression failed: {e}")))?,
            Compressor::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                decoder
                    .decompress_vec(data)
                    .map_err(|e| Error::malformed(format!("snappy decompression failed: {e}")))?
            }
            Compressor::Deflate => {
                use flate2::read::DeflateDecoder;
                use std::io::Read;

                let mut decoder = DeflateDecoder::new(data);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                out
            }
        };
        if out.len() != expected_len {
            return Err(Error::malformed(format!(
                "Decompressed chunk is {} bytes, expected {}",
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}

/// In-memory mirror of the CompressionInfo component.
#[derive(Debug, Clone, PartialEq)]
pub struct Compression {
    /// Registry name of the compressor
    pub name: String,
    /// Compressor options as key/value string records
    pub options: Vec<(String, String)>,
    /// Uncompressed bytes per chunk
    pub chunk_len: u32,
    /// Total uncompressed length of the Data file
    pub data_len: u64,
    /// Physical offset in the Data file where each chunk starts
    pub offsets: Vec<u64>,
    /// Physical length of the compressed Data file; not serialized, set
    /// from the file size after load or seal
    compressed_file_length: u64,
}

impl Compression {
    /// Fresh metadata for a write, seeded with the default chunk-CRC read
    /// probability the way every writer in this family does.
    pub fn for_write(compressor: Compressor, chunk_len: u32) -> Self {
        Self {
            name: compressor.name().to_string(),
            options: vec![("crc_check_chance".to_string(), "1.0".to_string())],
            chunk_len,
            data_len: 0,
            offsets: Vec::new(),
            compressed_file_length: 0,
        }
    }

    /// Parse a CompressionInfo component.
    pub async fn read(src: &mut RandomAccessReader) -> Result<Self> {
        let name = read_string16(src).await?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|e| Error::malformed(format!("Invalid compressor name encoding: {e}")))?;

        let option_count = read_u32(src).await? as usize;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            let key = read_string16(src).await?;
            let value = read_string16(src).await?;
            options.push((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }

        let chunk_len = read_u32(src).await?;
        let data_len = read_u64(src).await?;
        let offsets = read_array32_u64(src).await?;

        Ok(Self {
            name,
            options,
            chunk_len,
            data_len,
            offsets,
            compressed_file_length: 0,
        })
    }

    /// Serialize a CompressionInfo component.
    pub async fn write(&self, out: &mut FileWriter) -> Result<()> {
        write_string16(out, self.name.as_bytes()).await?;
        write_u32(out, narrow_u32(self.options.len())?).await?;
        for (key, value) in &self.options {
            write_string16(out, key.as_bytes()).await?;
            write_string16(out, value.as_bytes()).await?;
        }
        write_u32(out, self.chunk_len).await?;
        write_u64(out, self.data_len).await?;
        write_array32_u64(out, &self.offsets).await
    }

    /// Record the physical Data file size, needed to bound the final chunk.
    pub fn update(&mut self, compressed_file_length: u64) {
        self.compressed_file_length = compressed_file_length;
    }

    /// Physical length of the compressed Data file.
    pub fn compressed_file_length(&self) -> u64 {
        self.compressed_file_length
    }

    /// The registry compressor for this metadata.
    pub fn compressor(&self) -> Result<Compressor> {
        Compressor::from_name(&self.name)
    }

    /// Probability that a chunk's trailing CRC is verified on read.
    pub fn crc_check_chance(&self) -> f64 {
        self.options
            .iter()
            .find(|(key, _)| key == "crc_check_chance")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(1.0)
    }

    /// Index of the chunk containing the given logical offset.
    pub fn chunk_for_offset(&self, offset: u64) -> usize {
        (offset / u64::from(self.chunk_len)) as usize
    }

    fn chunk_uncompressed_len(&self, index: usize) -> usize {
        let start = index as u64 * u64::from(self.chunk_len);
        u64::from(self.chunk_len).min(self.data_len - start) as usize
    }

    /// Physical `(start, length)` of a chunk, including its trailing CRC.
    fn chunk_span(&self, index: usize) -> Result<(u64, u64)> {
        let start = *self
            .offsets
            .get(index)
            .ok_or_else(|| Error::malformed(format!("Chunk {index} out of range")))?;
        let end = match self.offsets.get(index + 1) {
            Some(next) => *next,
            None if self.compressed_file_length > start => self.compressed_file_length,
            None => {
                return Err(Error::malformed(
                    "Compression metadata lacks the Data file length",
                ))
            }
        };
        if end <= start + CHUNK_CRC_SIZE {
            return Err(Error::malformed(format!(
                "Chunk {index} spans {start}..{end}, too small for its checksum"
            )));
        }
        Ok((start, end - start))
    }
}

/// Sink half of the compressed stream adapter: divides the logical byte
/// stream into `chunk_len`-sized chunks, appending each compressed chunk
/// and its CRC to the physical file while recording its starting offset.
pub(crate) struct CompressedSink {
    out: BufWriter<File>,
    compressor: Compressor,
    compression: Compression,
    pending: Vec<u8>,
    physical_offset: u64,
    full_crc: crc32fast::Hasher,
}

impl CompressedSink {
    pub(crate) fn new(file: File, compression: Compression) -> Result<Self> {
        let compressor = compression.compressor()?;
        Ok(Self {
            out: BufWriter::with_capacity(SSTABLE_BUFFER_SIZE, file),
            compressor,
            compression,
            pending: Vec::new(),
            physical_offset: 0,
            full_crc: crc32fast::Hasher::new(),
        })
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(buf);
        let chunk_len = self.compression.chunk_len as usize;
        while self.pending.len() >= chunk_len {
            let chunk: Vec<u8> = self.pending.drain(..chunk_len).collect();
            self.emit_chunk(&chunk).await?;
        }
        Ok(())
    }

    async fn emit_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let compressed = self.compressor.compress(chunk)?;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&compressed);
        let crc = crc.finalize().to_be_bytes();

        self.compression.offsets.push(self.physical_offset);
        self.out.write_all(&compressed).await?;
        self.out.write_all(&crc).await?;
        self.full_crc.update(&compressed);
        self.full_crc.update(&crc);
        self.physical_offset += compressed.len() as u64 + CHUNK_CRC_SIZE;
        self.compression.data_len += chunk.len() as u64;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }

    pub(crate) async fn close(mut self) -> Result<Sealed> {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.emit_chunk(&chunk).await?;
        }
        self.out.flush().await?;
        self.out.into_inner().sync_all().await?;
        self.compression.update(self.physical_offset);
        Ok(Sealed {
            full_checksum: self.full_crc.finalize(),
            checksum: None,
            compression: Some(self.compression),
        })
    }
}

/// Reading half of the compressed stream adapter: locates the chunk
/// containing a logical position, decompresses it, and exposes the tail of
/// the logical stream from that position on.
pub struct CompressedReader<'a> {
    reader: RandomAccessReader,
    compression: &'a Compression,
    compressor: Compressor,
    pos: u64,
    chunk: Option<DecodedChunk>,
}

struct DecodedChunk {
    index: usize,
    data: Vec<u8>,
}

impl<'a> CompressedReader<'a> {
    /// Open a compressed view over the Data file starting at logical `pos`.
    pub async fn new(file: &File, compression: &'a Compression, pos: u64) -> Result<Self> {
        let compressor = compression.compressor()?;
        Ok(Self {
            reader: RandomAccessReader::shared(file).await?,
            compression,
            compressor,
            pos,
            chunk: None,
        })
    }

    /// Read exactly `n` logical bytes, or fewer at the end of the stream.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Bytes> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n && self.pos < self.compression.data_len {
            let index = self.compression.chunk_for_offset(self.pos);
            if self.chunk.as_ref().map(|c| c.index) != Some(index) {
                self.load_chunk(index).await?;
            }
            let taken = match &self.chunk {
                Some(chunk) => {
                    let skip =
                        (self.pos - index as u64 * u64::from(self.compression.chunk_len)) as usize;
                    let available = &chunk.data[skip..];
                    let take = available.len().min(n - out.len());
                    out.extend_from_slice(&available[..take]);
                    take
                }
                None => 0,
            };
            if taken == 0 {
                break;
            }
            self.pos += taken as u64;
        }
        Ok(Bytes::from(out))
    }

    async fn load_chunk(&mut self, index: usize) -> Result<()> {
        let (start, len) = self.compression.chunk_span(index)?;
        self.reader.seek(start).await?;
        let buf = self.reader.read_exactly(len as usize).await?;
        check_buf_size(&buf, len as usize)
            .map_err(|_| Error::malformed(format!("Data file truncated inside chunk {index}")))?;

        let (compressed, crc_bytes) = buf.split_at(buf.len() - CHUNK_CRC_SIZE as usize);
        let chance = self.compression.crc_check_chance();
        if chance > 0.0 && (chance >= 1.0 || rand::random::<f64>() < chance) {
            let mut crc = crc32fast::Hasher::new();
            crc.update(compressed);
            let expected = u32::from_be_bytes([
                crc_bytes[0],
                crc_bytes[1],
                crc_bytes[2],
                crc_bytes[3],
            ]);
            if crc.finalize() != expected {
                return Err(Error::malformed(format!(
                    "Chunk {index} failed checksum verification"
                )));
            }
        }

        let expected_len = self.compression.chunk_uncompressed_len(index);
        let data = self.compressor.decompress(compressed, expected_len)?;
        self.chunk = Some(DecodedChunk { index, data });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_compressed(
        path: &std::path::Path,
        compressor: Compressor,
        chunk_len: u32,
        payload: &[u8],
    ) -> Compression {
        let file = tokio::fs::File::create(path).await.unwrap();
        let mut out = FileWriter::compressed(file, Compression::for_write(compressor, chunk_len))
            .unwrap();
        out.write_all(payload).await.unwrap();
        let sealed = out.close().await.unwrap();
        sealed.compression.unwrap()
    }

    fn sample_payload(len: usize) -> Vec<u8> {
        // Compressible but not constant
        (0..len).map(|i| (i / 64) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_across_chunks() {
        for compressor in [Compressor::Lz4, Compressor::Snappy, Compressor::Deflate] {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("data");
            let payload = sample_payload(10_000);
            let compression = write_compressed(&path, compressor, 4096, &payload).await;

            assert_eq!(compression.data_len, payload.len() as u64);
            assert_eq!(compression.offsets.len(), 3);
            assert!(compression.offsets.windows(2).all(|w| w[0] < w[1]));

            let file = tokio::fs::File::open(&path).await.unwrap();
            let mut reader = CompressedReader::new(&file, &compression, 0).await.unwrap();
            let read = reader.read_exactly(payload.len()).await.unwrap();
            assert_eq!(&read[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_positioned_read_inside_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        let payload = sample_payload(9000);
        let compression = write_compressed(&path, Compressor::Lz4, 4096, &payload).await;

        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut reader = CompressedReader::new(&file, &compression, 4100).await.unwrap();
        let read = reader.read_exactly(200).await.unwrap();
        assert_eq!(&read[..], &payload[4100..4300]);
    }

    #[tokio::test]
    async fn test_read_past_end_is_short() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        let payload = sample_payload(1000);
        let compression = write_compressed(&path, Compressor::Lz4, 4096, &payload).await;

        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut reader = CompressedReader::new(&file, &compression, 900).await.unwrap();
        let read = reader.read_exactly(500).await.unwrap();
        assert_eq!(read.len(), 100);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_checksum() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        let payload = sample_payload(1000);
        let compression = write_compressed(&path, Compressor::Lz4, 4096, &payload).await;

        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut reader = CompressedReader::new(&file, &compression, 0).await.unwrap();
        match reader.read_exactly(100).await {
            Err(Error::MalformedSstable(msg)) => assert!(msg.contains("checksum")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compression_info_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("info");

        let info = Compression {
            name: "lz4".to_string(),
            options: vec![("crc_check_chance".to_string(), "0.5".to_string())],
            chunk_len: 4096,
            data_len: 123_456,
            offsets: vec![0, 1000, 2100, 3300],
            compressed_file_length: 0,
        };

        let file = tokio::fs::File::create(&path).await.unwrap();
        let mut out = FileWriter::buffered(file);
        info.write(&mut out).await.unwrap();
        out.close().await.unwrap();

        let mut src = RandomAccessReader::open(&path).await.unwrap();
        let read = Compression::read(&mut src).await.unwrap();
        assert_eq!(read, info);
        assert_eq!(read.crc_check_chance(), 0.5);
    }

    #[test]
    fn test_compressor_registry_round_trip() {
        for (compressor, name) in COMPRESSOR_NAMES {
            assert_eq!(Compressor::from_name(name).unwrap(), *compressor);
        }
        assert!(Compressor::from_name("zstd").is_err());
    }
}
