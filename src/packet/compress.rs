//! zlib payload compression.
//!
//! A compressed packet payload is `[original length: u32][zlib stream]`.

use super::{PacketReader, MAX_PAYLOAD_LEN};
use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress `input` at the fast level.
pub fn compress(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len() / 2 + 16), Compression::fast());
    encoder
        .write_all(input)
        .and_then(|_| encoder.finish())
        .map_err(|err| Error::protocol(format!("compression failed: {err}")))
}

/// Inflate `input`, which must expand to exactly `expected_len` bytes.
///
/// `expected_len` above `MAX_PAYLOAD_LEN` is rejected before anything is
/// allocated.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    if expected_len > MAX_PAYLOAD_LEN {
        return Err(Error::protocol(format!(
            "decompressed length {expected_len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }
    if input.is_empty() && expected_len == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    out.try_reserve_exact(expected_len)
        .map_err(|_| Error::AllocationFailure { size: expected_len })?;

    // One byte past the expected length is enough to detect a longer stream
    let limit = expected_len as u64 + 1;
    ZlibDecoder::new(input)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|err| Error::protocol(format!("decompression failed: {err}")))?;

    if out.len() != expected_len {
        return Err(Error::protocol(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

/// Decode a payload framed by [`pack_compressed`](super::pack_compressed).
pub fn unpack_compressed(reader: &mut PacketReader<'_>) -> Result<Vec<u8>> {
    let expected = reader.checked_read_u32()? as usize;
    let body = reader.as_slice();
    reader.skip(body.len());
    decompress(body, expected)
}
