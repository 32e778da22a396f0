//! Random-access reading over component files
//!
//! Parsing is driven by a seekable byte source that returns exact-sized
//! buffers. A short buffer is not an error at this layer; callers that
//! require the full size go through `check_buf_size` and get a
//! `BufferSizeMismatch` they can rewrite or inspect.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

use crate::error::Result;

const READ_BUFFER_SIZE: usize = 8192;

/// A seekable byte source over a file.
///
/// Owns the file; dropping the reader closes it. `seek` discards the current
/// buffered stream and reopens it at the given absolute offset.
#[derive(Debug)]
pub struct RandomAccessReader {
    stream: BufReader<File>,
    position: u64,
    eof: bool,
}

impl RandomAccessReader {
    /// Open a file for random-access reads.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(file))
    }

    /// Wrap an already-open file, positioned at offset 0.
    pub fn new(file: File) -> Self {
        Self {
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, file),
            position: 0,
            eof: false,
        }
    }

    /// A reader over the same underlying file handle, for callers that keep
    /// the handle open for the sstable's lifetime. Handles cloned this way
    /// share a kernel file cursor, so per §5 concurrent operations on one
    /// sstable are undefined; each operation seeks before reading.
    pub async fn shared(file: &File) -> Result<Self> {
        let clone = file.try_clone().await?;
        Ok(Self::new(clone))
    }

    /// Read exactly `n` bytes, or fewer at end of file.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.stream.read(&mut buf[filled..]).await?;
            if read == 0 {
                self.eof = true;
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        self.position += filled as u64;
        Ok(Bytes::from(buf))
    }

    /// Reopen the stream at the given absolute offset.
    pub async fn seek(&mut self, pos: u64) -> Result<()> {
        self.stream.seek(SeekFrom::Start(pos)).await?;
        self.position = pos;
        self.eof = false;
        Ok(())
    }

    /// The logical offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the current stream has been exhausted.
    pub fn eof(&self) -> bool {
        self.eof
    }
}
