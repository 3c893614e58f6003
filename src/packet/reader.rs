//! Cursor over a packet payload.
//!
//! Fixed-width values are little-endian. `read_*` assumes the caller knows
//! the data is there and panics on a short buffer; `checked_read_*` returns
//! [`Error::Underflow`] instead and leaves the cursor unchanged.

use super::{decode_varlen, Packet};
use crate::error::{Error, Result};
use bytes::{Buf, TryGetError};

fn underflow(err: TryGetError) -> Error {
    Error::Underflow {
        needed: err.requested,
        available: err.available,
    }
}

macro_rules! typed_reads {
    ($($ty:ty => $read:ident, $checked:ident, $get:ident, $try_get:ident;)*) => {
        $(
            #[inline]
            pub fn $read(&mut self) -> $ty {
                let mut rest = self.as_slice();
                let value = rest.$get();
                self.pos += std::mem::size_of::<$ty>();
                value
            }

            #[inline]
            pub fn $checked(&mut self) -> Result<$ty> {
                let mut rest = self.as_slice();
                let value = rest.$try_get().map_err(underflow)?;
                self.pos += std::mem::size_of::<$ty>();
                Ok(value)
            }
        )*
    };
}

#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
    marked: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            marked: 0,
        }
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread tail.
    pub fn as_slice(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn skip(&mut self, count: usize) {
        assert!(count <= self.remaining(), "skip past end of packet");
        self.pos += count;
    }

    /// Step back `count` bytes.
    pub fn revert(&mut self, count: usize) {
        assert!(count <= self.pos, "revert before start of packet");
        self.pos -= count;
    }

    pub fn mark(&mut self) {
        self.marked = self.pos;
    }

    pub fn reset_to_mark(&mut self) {
        self.pos = self.marked;
    }

    /// A reader over `len` bytes starting `offset` bytes past the cursor.
    pub fn subreader(&self, offset: usize, len: usize) -> PacketReader<'a> {
        let start = self.pos + offset;
        PacketReader::new(&self.data[start..start + len])
    }

    /// Like [`subreader`](Self::subreader), but `Underflow` when the range
    /// runs past the end.
    pub fn checked_subreader(&self, offset: usize, len: usize) -> Result<PacketReader<'a>> {
        let available = self.remaining();
        match offset.checked_add(len) {
            Some(end) if end <= available => Ok(self.subreader(offset, len)),
            _ => Err(Error::Underflow {
                needed: offset.saturating_add(len),
                available,
            }),
        }
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    typed_reads! {
        u8 => read_u8, checked_read_u8, get_u8, try_get_u8;
        i8 => read_i8, checked_read_i8, get_i8, try_get_i8;
        u16 => read_u16, checked_read_u16, get_u16_le, try_get_u16_le;
        i16 => read_i16, checked_read_i16, get_i16_le, try_get_i16_le;
        u32 => read_u32, checked_read_u32, get_u32_le, try_get_u32_le;
        i32 => read_i32, checked_read_i32, get_i32_le, try_get_i32_le;
        u64 => read_u64, checked_read_u64, get_u64_le, try_get_u64_le;
        i64 => read_i64, checked_read_i64, get_i64_le, try_get_i64_le;
        f32 => read_f32, checked_read_f32, get_f32_le, try_get_f32_le;
        f64 => read_f64, checked_read_f64, get_f64_le, try_get_f64_le;
    }

    pub fn read_bytes(&mut self, len: usize) -> &'a [u8] {
        assert!(len <= self.remaining(), "read past end of packet");
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    pub fn checked_read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Underflow {
                needed: len,
                available: self.remaining(),
            });
        }
        Ok(self.read_bytes(len))
    }

    pub fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N));
        out
    }

    pub fn checked_read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.checked_read_bytes(N)?);
        Ok(out)
    }

    /// String with a u16 length prefix.
    pub fn read_string(&mut self) -> &'a [u8] {
        let len = self.read_u16() as usize;
        self.read_bytes(len)
    }

    pub fn checked_read_string(&mut self) -> Result<&'a [u8]> {
        self.checked_prefixed(2, |reader| reader.checked_read_u16().map(usize::from))
    }

    /// String with a u8 length prefix.
    pub fn read_short_string(&mut self) -> &'a [u8] {
        let len = self.read_u8() as usize;
        self.read_bytes(len)
    }

    pub fn checked_read_short_string(&mut self) -> Result<&'a [u8]> {
        self.checked_prefixed(1, |reader| reader.checked_read_u8().map(usize::from))
    }

    /// NUL-terminated string of at most `max` bytes before the terminator.
    ///
    /// Running out of data is `Underflow`; `max` bytes without a terminator
    /// is a protocol error.
    pub fn read_cstring(&mut self, max: usize) -> Result<&'a [u8]> {
        let rest = self.as_slice();
        let window = &rest[..rest.len().min(max.saturating_add(1))];
        match window.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(&rest[..end])
            }
            None if window.len() == rest.len() => Err(Error::Underflow {
                needed: rest.len() + 1,
                available: rest.len(),
            }),
            None => Err(Error::protocol("unterminated string")),
        }
    }

    /// A u16 count followed by that many items.
    pub fn read_vec<T, F>(&mut self, mut item: F) -> Vec<T>
    where
        F: FnMut(&mut Self) -> T,
    {
        let len = self.read_u16() as usize;
        (0..len).map(|_| item(self)).collect()
    }

    pub fn checked_read_vec<T, F>(&mut self, mut item: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let start = self.pos;
        let result = self
            .checked_read_u16()
            .and_then(|len| (0..len).map(|_| item(self)).collect());
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    /// Decode the next whole packet.
    ///
    /// Returns `Ok(None)` when the header or payload is still incomplete; the
    /// cursor then stays in front of the partial packet.
    pub fn next_packet(&mut self) -> Result<Option<Packet<'a>>> {
        let rest = self.as_slice();
        let Some((&code, after_code)) = rest.split_first() else {
            return Ok(None);
        };
        let Some((len, used)) = decode_varlen(after_code)? else {
            return Ok(None);
        };
        let header = 1 + used;
        if rest.len() - header < len {
            return Ok(None);
        }
        self.pos += header + len;
        Ok(Some(Packet {
            code,
            payload: &rest[header..header + len],
        }))
    }

    fn checked_prefixed<F>(&mut self, prefix: usize, read_len: F) -> Result<&'a [u8]>
    where
        F: FnOnce(&mut Self) -> Result<usize>,
    {
        let len = read_len(self)?;
        match self.checked_read_bytes(len) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                self.revert(prefix);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::writer::{pack_packet, CString, LenStr, ShortStr};

    fn sample() -> Vec<u8> {
        let mut out = Vec::new();
        out.push(0xFE);
        out.extend_from_slice(&(-2i16).to_le_bytes());
        out.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        out.extend_from_slice(&(-7i64).to_le_bytes());
        out.extend_from_slice(&1.5f64.to_le_bytes());
        out
    }

    #[test]
    fn test_typed_reads() {
        let data = sample();
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_u8(), 0xFE);
        assert_eq!(reader.read_i16(), -2);
        assert_eq!(reader.read_u32(), 0xDEAD_BEEF);
        assert_eq!(reader.read_i64(), -7);
        assert_eq!(reader.read_f64(), 1.5);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_checked_reads_underflow_on_every_truncation() {
        let data = sample();
        for cut in 0..data.len() {
            let mut reader = PacketReader::new(&data[..cut]);
            let result = (|| -> Result<()> {
                reader.checked_read_u8()?;
                reader.checked_read_i16()?;
                reader.checked_read_u32()?;
                reader.checked_read_i64()?;
                reader.checked_read_f64()?;
                Ok(())
            })();
            assert!(matches!(result, Err(Error::Underflow { .. })), "cut {cut}");
            assert!(reader.position() <= cut);
        }
    }

    #[test]
    fn test_checked_read_leaves_cursor() {
        let mut reader = PacketReader::new(&[1, 2, 3]);
        let err = reader.checked_read_u32().unwrap_err();
        assert!(matches!(
            err,
            Error::Underflow {
                needed: 4,
                available: 3
            }
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_strings() {
        let packet = pack_packet(
            9,
            &(
                LenStr(b"hello"),
                ShortStr(b"hi"),
                CString(b"name"),
                7u16,
            ),
        );
        let mut outer = PacketReader::new(&packet);
        let packet = outer.next_packet().unwrap().unwrap();
        assert_eq!(packet.code, 9);

        let mut reader = packet.reader();
        assert_eq!(reader.read_string(), b"hello");
        assert_eq!(reader.read_short_string(), b"hi");
        assert_eq!(reader.read_cstring(16).unwrap(), b"name");
        assert_eq!(reader.read_u16(), 7);
    }

    #[test]
    fn test_checked_string_truncated() {
        let mut data = Vec::new();
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(b"short");
        let mut reader = PacketReader::new(&data);
        assert!(matches!(
            reader.checked_read_string(),
            Err(Error::Underflow {
                needed: 10,
                available: 5
            })
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_cstring_limits() {
        let mut reader = PacketReader::new(b"abc");
        assert!(matches!(
            reader.read_cstring(8),
            Err(Error::Underflow { .. })
        ));

        let mut reader = PacketReader::new(b"abcdef\0");
        assert!(matches!(reader.read_cstring(3), Err(Error::Protocol(_))));
        assert_eq!(reader.read_cstring(6).unwrap(), b"abcdef");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_vec_and_arrays() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u16.to_le_bytes());
        for v in [10u32, 20, 30] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        data.extend_from_slice(&[1, 2, 3, 4]);

        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_vec(|r| r.read_u32()), vec![10, 20, 30]);
        assert_eq!(reader.read_array::<4>(), [1, 2, 3, 4]);

        let mut short = PacketReader::new(&data[..9]);
        assert!(short.checked_read_vec(|r| r.checked_read_u32()).is_err());
        assert_eq!(short.position(), 0);
    }

    #[test]
    fn test_mark_and_subreader() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let mut reader = PacketReader::new(&data);
        reader.skip(1);
        reader.mark();
        assert_eq!(reader.read_u8(), 2);
        reader.reset_to_mark();
        assert_eq!(reader.peek_u8(), Some(2));

        let mut sub = reader.subreader(1, 3);
        assert_eq!(sub.read_bytes(3), &[3, 4, 5]);
        assert_eq!(sub.remaining(), 0);

        reader.skip(2);
        reader.revert(1);
        assert_eq!(reader.read_u8(), 3);
    }

    #[test]
    fn test_checked_subreader_bounds() {
        let data = [1u8, 2, 3, 4];
        let mut reader = PacketReader::new(&data);
        reader.skip(1);

        let mut sub = reader.checked_subreader(1, 2).unwrap();
        assert_eq!(sub.read_bytes(2), &[3, 4]);
        assert_eq!(reader.checked_subreader(3, 0).unwrap().remaining(), 0);

        assert!(matches!(
            reader.checked_subreader(2, 2),
            Err(Error::Underflow {
                needed: 4,
                available: 3
            })
        ));
        assert!(matches!(
            reader.checked_subreader(usize::MAX, 1),
            Err(Error::Underflow { .. })
        ));
    }

    #[test]
    fn test_next_packet_incomplete_keeps_cursor() {
        let data = [5u8, 0, 7, 3, b'a'];
        let mut reader = PacketReader::new(&data);
        let first = reader.next_packet().unwrap().unwrap();
        assert_eq!(first.code, 5);
        assert!(first.is_empty());
        assert_eq!(reader.next_packet().unwrap(), None);
        assert_eq!(reader.position(), 2);
    }
}
