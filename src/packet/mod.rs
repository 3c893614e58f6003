//! Length-prefixed packet framing.
//!
//! Every packet on the wire is `[code: u8][length: varlen][payload]`.
//!
//! The length is little-endian base-128: each byte carries seven bits of the
//! value, least significant group first, and the high bit marks that another
//! byte follows. At most four bytes are used, which caps payloads at
//! `MAX_PAYLOAD_LEN`. Lengths below 0x80 take a single byte.
//!
//! Decoding is streaming: a header or payload that has not fully arrived
//! yields "no packet yet" and leaves the bytes in place for the next read.

pub mod compress;
pub mod reader;
pub mod writer;

pub use compress::{compress, decompress};
pub use reader::PacketReader;
pub use writer::{pack_compressed, pack_packet, pack_raw, CString, LenStr, Pack, ShortStr};

use crate::error::{Error, Result};

/// Maximum number of bytes in an encoded length.
pub const MAX_VARLEN_BYTES: usize = 4;

/// Largest payload the length encoding can express.
pub const MAX_PAYLOAD_LEN: usize = (1 << (7 * MAX_VARLEN_BYTES)) - 1;

/// Largest possible packet header.
pub const MAX_HEADER_LEN: usize = 1 + MAX_VARLEN_BYTES;

/// One decoded packet, borrowing its payload from the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub code: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// A reader positioned at the start of the payload.
    pub fn reader(&self) -> PacketReader<'a> {
        PacketReader::new(self.payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Number of bytes `value` takes as a varlen.
///
/// # Panics
/// Panics if `value` exceeds `MAX_PAYLOAD_LEN`.
pub fn varlen_size(value: usize) -> usize {
    assert!(value <= MAX_PAYLOAD_LEN, "packet length {value} out of range");
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

/// Encode `value` into the front of `out`, returning the bytes written.
///
/// # Panics
/// Panics if `value` exceeds `MAX_PAYLOAD_LEN` or `out` is too short.
pub fn encode_varlen(value: usize, out: &mut [u8]) -> usize {
    let size = varlen_size(value);
    let mut rest = value;
    for byte in out.iter_mut().take(size - 1) {
        *byte = (rest & 0x7F) as u8 | 0x80;
        rest >>= 7;
    }
    out[size - 1] = rest as u8;
    size
}

/// Decode a varlen from the front of `input`.
///
/// Returns `(value, bytes_used)`, or `None` when the encoding is cut short.
/// A fourth byte that still has its continuation bit set is malformed.
pub fn decode_varlen(input: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (i, &byte) in input.iter().take(MAX_VARLEN_BYTES).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        if i + 1 == MAX_VARLEN_BYTES {
            return Err(Error::protocol("packet length exceeds 4 bytes"));
        }
    }
    Ok(None)
}

/// Decode every whole packet in `buffer[..*filled]`, handing each to `f`.
///
/// Unconsumed trailing bytes are moved to the front of `buffer` and
/// `*filled` is updated to their length. Returns the packets delivered.
pub fn process_packets<F>(buffer: &mut [u8], filled: &mut usize, mut f: F) -> Result<usize>
where
    F: FnMut(Packet<'_>) -> Result<()>,
{
    let mut delivered = 0;
    let consumed = {
        let mut reader = PacketReader::new(&buffer[..*filled]);
        while let Some(packet) = reader.next_packet()? {
            f(packet)?;
            delivered += 1;
        }
        reader.position()
    };
    *filled = compact(buffer, consumed, *filled);
    Ok(delivered)
}

/// Move `buffer[consumed..filled]` to the front, returning its length.
pub fn compact(buffer: &mut [u8], consumed: usize, filled: usize) -> usize {
    if consumed > 0 && consumed < filled {
        buffer.copy_within(consumed..filled, 0);
    }
    filled - consumed
}
