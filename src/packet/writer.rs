//! Packet encoding.
//!
//! Packing is two-pass: the fields report their encoded size, a single
//! pooled buffer of exactly that size is taken, then the header and fields
//! are written into it.

use super::{compress, encode_varlen, varlen_size, MAX_PAYLOAD_LEN};
use crate::error::{Error, Result};
use crate::runtime::buffer::PooledBuffer;
use bytes::BufMut;

/// A value with a fixed wire encoding.
pub trait Pack {
    fn packed_size(&self) -> usize;

    /// Write the value. `out` has at least `packed_size()` bytes left.
    fn pack(&self, out: &mut &mut [u8]);
}

macro_rules! pack_numbers {
    ($($ty:ty => $put:ident;)*) => {
        $(
            impl Pack for $ty {
                #[inline]
                fn packed_size(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                #[inline]
                fn pack(&self, out: &mut &mut [u8]) {
                    out.$put(*self);
                }
            }
        )*
    };
}

pack_numbers! {
    u8 => put_u8;
    i8 => put_i8;
    u16 => put_u16_le;
    i16 => put_i16_le;
    u32 => put_u32_le;
    i32 => put_i32_le;
    u64 => put_u64_le;
    i64 => put_i64_le;
    f32 => put_f32_le;
    f64 => put_f64_le;
}

impl Pack for bool {
    fn packed_size(&self) -> usize {
        1
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_u8(u8::from(*self));
    }
}

/// Raw bytes, no prefix.
impl Pack for [u8] {
    fn packed_size(&self) -> usize {
        self.len()
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_slice(self);
    }
}

impl<const N: usize> Pack for [u8; N] {
    fn packed_size(&self) -> usize {
        N
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_slice(self);
    }
}

impl<T: Pack + ?Sized> Pack for &T {
    fn packed_size(&self) -> usize {
        (**self).packed_size()
    }

    fn pack(&self, out: &mut &mut [u8]) {
        (**self).pack(out)
    }
}

/// Bytes with a u16 length prefix.
#[derive(Debug, Clone, Copy)]
pub struct LenStr<'a>(pub &'a [u8]);

impl Pack for LenStr<'_> {
    fn packed_size(&self) -> usize {
        assert!(self.0.len() <= u16::MAX as usize, "string too long");
        2 + self.0.len()
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_u16_le(self.0.len() as u16);
        out.put_slice(self.0);
    }
}

/// Bytes with a u8 length prefix.
#[derive(Debug, Clone, Copy)]
pub struct ShortStr<'a>(pub &'a [u8]);

impl Pack for ShortStr<'_> {
    fn packed_size(&self) -> usize {
        assert!(self.0.len() <= u8::MAX as usize, "short string too long");
        1 + self.0.len()
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_u8(self.0.len() as u8);
        out.put_slice(self.0);
    }
}

/// NUL-terminated bytes.
#[derive(Debug, Clone, Copy)]
pub struct CString<'a>(pub &'a [u8]);

impl Pack for CString<'_> {
    fn packed_size(&self) -> usize {
        self.0.len() + 1
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_slice(self.0);
        out.put_u8(0);
    }
}

/// A u16 count followed by the items.
impl<T: Pack> Pack for Vec<T> {
    fn packed_size(&self) -> usize {
        assert!(self.len() <= u16::MAX as usize, "too many items");
        2 + self.iter().map(Pack::packed_size).sum::<usize>()
    }

    fn pack(&self, out: &mut &mut [u8]) {
        out.put_u16_le(self.len() as u16);
        for item in self {
            item.pack(out);
        }
    }
}

macro_rules! pack_tuple {
    ($($name:ident)+) => {
        #[allow(non_snake_case)]
        impl<$($name: Pack),+> Pack for ($($name,)+) {
            fn packed_size(&self) -> usize {
                let ($($name,)+) = self;
                0 $(+ $name.packed_size())+
            }

            fn pack(&self, out: &mut &mut [u8]) {
                let ($($name,)+) = self;
                $($name.pack(out);)+
            }
        }
    };
}

pack_tuple!(A);
pack_tuple!(A B);
pack_tuple!(A B C);
pack_tuple!(A B C D);
pack_tuple!(A B C D E);
pack_tuple!(A B C D E F);
pack_tuple!(A B C D E F G);
pack_tuple!(A B C D E F G H);

impl Pack for () {
    fn packed_size(&self) -> usize {
        0
    }

    fn pack(&self, _out: &mut &mut [u8]) {}
}

/// Frame `fields` as one packet with `code`.
///
/// # Panics
/// Panics if the payload exceeds `MAX_PAYLOAD_LEN` or a field writes a
/// different number of bytes than it reported.
pub fn pack_packet<P: Pack + ?Sized>(code: u8, fields: &P) -> PooledBuffer {
    let len = fields.packed_size();
    let header = 1 + varlen_size(len);
    let mut buffer = PooledBuffer::take(header + len);
    if let Some(data) = buffer.data_mut() {
        data[0] = code;
        encode_varlen(len, &mut data[1..]);
        let mut out = &mut data[header..];
        fields.pack(&mut out);
        assert!(out.is_empty(), "packed size mismatch for code {code}");
    }
    buffer
}

/// Frame an opaque payload.
pub fn pack_raw(code: u8, payload: &[u8]) -> PooledBuffer {
    pack_packet(code, payload)
}

/// Frame `payload` compressed, preceded by its original length.
pub fn pack_compressed(code: u8, payload: &[u8]) -> Result<PooledBuffer> {
    let original = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_PAYLOAD_LEN)
        .ok_or_else(|| Error::protocol("payload too large to compress"))?;
    let packed = compress(payload)?;
    if 4 + packed.len() > MAX_PAYLOAD_LEN {
        return Err(Error::protocol("compressed payload too large"));
    }
    Ok(pack_packet(code, &(original, packed.as_slice())))
}
