//! Scalar and sized-container codec
//!
//! Every integer in the format is big-endian; reads and writes go through
//! explicit `from_be_bytes`/`to_be_bytes` conversions per width. Sized
//! containers carry a leading length prefix (`u16`/`u32`) followed by their
//! payload. Writes that narrow a size to its on-disk width verify the
//! narrowing preserves the value.
//!
//! The two deliberate deviations from big-endian — Summary positions and
//! the Digest file — are handled by their component codecs, not here.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::reader::RandomAccessReader;
use crate::writer::FileWriter;

/// Verify a buffer delivered by `read_exactly` holds the expected size.
pub(crate) fn check_buf_size(buf: &Bytes, expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::BufferSizeMismatch {
            got: buf.len(),
            expected,
        });
    }
    Ok(())
}

pub(crate) fn narrow_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Overflow("length to u16"))
}

pub(crate) fn narrow_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Overflow("length to u32"))
}

fn to_array<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    arr
}

macro_rules! scalar_codec {
    ($read:ident, $write:ident, $ty:ty) => {
        #[doc = concat!("Read a big-endian `", stringify!($ty), "`.")]
        pub async fn $read(src: &mut RandomAccessReader) -> Result<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let buf = src.read_exactly(N).await?;
            check_buf_size(&buf, N)?;
            Ok(<$ty>::from_be_bytes(to_array::<N>(&buf)))
        }

        #[doc = concat!("Write a big-endian `", stringify!($ty), "`.")]
        pub async fn $write(out: &mut FileWriter, value: $ty) -> Result<()> {
            out.write_all(&value.to_be_bytes()).await
        }
    };
}

scalar_codec!(read_u8, write_u8, u8);
scalar_codec!(read_u16, write_u16, u16);
scalar_codec!(read_u32, write_u32, u32);
scalar_codec!(read_u64, write_u64, u64);
scalar_codec!(read_i16, write_i16, i16);
scalar_codec!(read_i32, write_i32, i32);
scalar_codec!(read_i64, write_i64, i64);

/// Read a boolean serialized as a single byte.
pub async fn read_bool(src: &mut RandomAccessReader) -> Result<bool> {
    Ok(read_u8(src).await? != 0)
}

/// Write a boolean as a single byte (0/1).
pub async fn write_bool(out: &mut FileWriter, value: bool) -> Result<()> {
    write_u8(out, u8::from(value)).await
}

/// Read a double serialized as a big-endian 64-bit pattern.
pub async fn read_f64(src: &mut RandomAccessReader) -> Result<f64> {
    Ok(f64::from_bits(read_u64(src).await?))
}

/// Write a double as a big-endian 64-bit pattern.
pub async fn write_f64(out: &mut FileWriter, value: f64) -> Result<()> {
    write_u64(out, value.to_bits()).await
}

/// Read exactly `len` raw bytes, failing on a short read.
pub async fn read_bytes(src: &mut RandomAccessReader, len: usize) -> Result<Bytes> {
    let buf = src.read_exactly(len).await?;
    check_buf_size(&buf, len)?;
    Ok(buf)
}

/// Read a `disk_string<u16>`: 16-bit length prefix followed by bytes.
pub async fn read_string16(src: &mut RandomAccessReader) -> Result<Bytes> {
    let len = read_u16(src).await? as usize;
    read_bytes(src, len).await
}

/// Write a `disk_string<u16>`.
pub async fn write_string16(out: &mut FileWriter, value: &[u8]) -> Result<()> {
    write_u16(out, narrow_u16(value.len())?).await?;
    out.write_all(value).await
}

/// Read a `disk_string<u32>`.
pub async fn read_string32(src: &mut RandomAccessReader) -> Result<Bytes> {
    let len = read_u32(src).await? as usize;
    read_bytes(src, len).await
}

/// Write a `disk_string<u32>`.
pub async fn write_string32(out: &mut FileWriter, value: &[u8]) -> Result<()> {
    write_u32(out, narrow_u32(value.len())?).await?;
    out.write_all(value).await
}

/// Read a `disk_array<u32, u8>` as one contiguous buffer.
pub async fn read_array32_u8(src: &mut RandomAccessReader) -> Result<Vec<u8>> {
    let len = read_u32(src).await? as usize;
    Ok(read_bytes(src, len).await?.to_vec())
}

/// Write a `disk_array<u32, u8>`.
pub async fn write_array32_u8(out: &mut FileWriter, values: &[u8]) -> Result<()> {
    write_u32(out, narrow_u32(values.len())?).await?;
    out.write_all(values).await
}

// Integer arrays are read and written through one contiguous buffer with a
// per-element byte swap; non-integer element types serialize one by one at
// their component codecs.
macro_rules! int_array_codec {
    ($read:ident, $write:ident, $ty:ty) => {
        #[doc = concat!("Read a `disk_array<u32, ", stringify!($ty), ">`.")]
        pub async fn $read(src: &mut RandomAccessReader) -> Result<Vec<$ty>> {
            const N: usize = std::mem::size_of::<$ty>();
            let len = read_u32(src).await? as usize;
            let buf = read_bytes(src, len * N).await?;
            Ok(buf
                .chunks_exact(N)
                .map(|chunk| <$ty>::from_be_bytes(to_array::<N>(chunk)))
                .collect())
        }

        #[doc = concat!("Write a `disk_array<u32, ", stringify!($ty), ">`.")]
        pub async fn $write(out: &mut FileWriter, values: &[$ty]) -> Result<()> {
            const N: usize = std::mem::size_of::<$ty>();
            write_u32(out, narrow_u32(values.len())?).await?;
            let mut buf = Vec::with_capacity(values.len() * N);
            for value in values {
                buf.extend_from_slice(&value.to_be_bytes());
            }
            out.write_all(&buf).await
        }
    };
}

int_array_codec!(read_array32_u32, write_array32_u32, u32);
int_array_codec!(read_array32_u64, write_array32_u64, u64);
