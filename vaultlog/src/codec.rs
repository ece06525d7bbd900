//! The binary record format.
//!
//! Unsigned integers are written as LEB128 varints, byte strings and `str`s as a
//! varint length followed by the raw bytes, and levels as their primitive byte.
//! Derived structs write their fields in declaration order, without tags.

use std::{any::type_name, slice, str};

use thiserror::Error;

use crate::Level;

/// Errors that can be occurred by encoding a record.
#[non_exhaustive]
#[derive(Error, Clone, Debug)]
pub enum EncodingError {
    /// A byte string is longer than an item can frame.
    #[error("a field of {len} bytes exceeds the encodable length")]
    FieldTooLong { len: usize },
}

/// Represents a target for encoded data.
pub(crate) trait Sink: crate::Sink<EncodingError> {}

impl<T> Sink for T where T: crate::Sink<EncodingError> {}

/// A type with a binary representation, see the [module docs](self).
///
/// Implemented for structs by `#[derive(Encode)]`.
pub(crate) trait Encode {
    fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink;
}

/// Errors that can be occurred by decoding a record.
#[derive(Error, Clone, Debug)]
#[non_exhaustive]
pub enum DecodingError {
    /// The source ended `extra_len` bytes too early.
    #[error("the source ended, {extra_len} more bytes were expected")]
    UnexpectedEnd { extra_len: usize },
    /// A byte that maps to no variant of the enum `type_name`.
    #[error("unknown variant {found_byte} of `{type_name}`")]
    UnexpectedVariant { type_name: &'static str, found_byte: u8 },
    #[error(transparent)]
    Str(#[from] str::Utf8Error),
    /// The varint does not fit the integer type it is decoded into, e.g. a `usize`
    /// written on a 64-bit target and read on a 32-bit one.
    #[error("the varint overflows its integer type")]
    IntegerOverflow,
}

/// Represents a provider of encoded bytes.
pub(crate) trait Source<'de> {
    type Error: From<DecodingError>;

    /// Takes exactly `len` bytes off the front.
    fn read_bytes(&mut self, len: usize) -> Result<&'de [u8], Self::Error>;
}

/// The inverse of [`Encode`].
///
/// The `'de` lifetime ties borrowed fields (`&str`, `&[u8]`) to the source buffer,
/// so decoding a record never copies its strings. Implemented for structs by
/// `#[derive(Decode)]`.
pub(crate) trait Decode<'de>: Sized {
    fn decode<S>(source: &mut S) -> Result<Self, S::Error>
    where
        S: Source<'de>;
}

/// Longest byte string a record field may carry: anything longer could never be
/// framed by the 32-bit item length.
const MAX_FIELD_LEN: usize = u32::MAX as usize;

#[inline]
fn check_field_len(len: usize) -> Result<(), EncodingError> {
    if len > MAX_FIELD_LEN {
        return Err(EncodingError::FieldTooLong { len });
    }
    Ok(())
}

/// A `u64` takes at most 10 varint bytes.
const MAX_VARINT_LEN: usize = 10;

fn write_varint<S>(mut value: u64, sink: &mut S) -> Result<(), S::Error>
where
    S: Sink,
{
    let mut bytes = [0; MAX_VARINT_LEN];
    let mut len = 0;
    loop {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            bytes[len] = low;
            len += 1;
            break;
        }
        bytes[len] = low | 0x80;
        len += 1;
    }
    sink.sink(&bytes[..len])
}

fn read_varint<'de, S>(source: &mut S) -> Result<u64, S::Error>
where
    S: Source<'de>,
{
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = u8::decode(source)?;
        let bits = u64::from(byte & 0x7F);
        // Bits shifted out of the `u64`.
        if bits.leading_zeros() < shift {
            break;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodingError::IntegerOverflow.into())
}

impl Encode for u8 {
    #[inline]
    fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        sink.sink(slice::from_ref(self))
    }
}

impl<'de> Decode<'de> for u8 {
    #[inline]
    fn decode<S>(source: &mut S) -> Result<Self, S::Error>
    where
        S: Source<'de>,
    {
        let bytes = source.read_bytes(1)?;
        bytes.first().copied().ok_or_else(|| DecodingError::UnexpectedEnd { extra_len: 1 }.into())
    }
}

macro_rules! varint_codec {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[inline]
            fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
            where
                S: Sink,
            {
                write_varint(*self as u64, sink)
            }
        }

        impl<'de> Decode<'de> for $ty {
            #[inline]
            fn decode<S>(source: &mut S) -> Result<Self, S::Error>
            where
                S: Source<'de>,
            {
                let value = read_varint(source)?;
                <$ty>::try_from(value).map_err(|_| DecodingError::IntegerOverflow.into())
            }
        }
    )*};
}

varint_codec!(u32, u64, usize);

impl Encode for &[u8] {
    fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        check_field_len(self.len())?;
        self.len().encode(sink)?;
        sink.sink(self)
    }
}

impl<'de: 'a, 'a> Decode<'de> for &'a [u8] {
    #[inline]
    fn decode<S>(source: &mut S) -> Result<Self, S::Error>
    where
        S: Source<'de>,
    {
        let len = usize::decode(source)?;
        source.read_bytes(len)
    }
}

/// Decoding straight out of a byte slice, advancing it.
impl<'a> Source<'a> for &'a [u8] {
    type Error = DecodingError;

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Self::Error> {
        let remaining: &'a [u8] = *self;
        if remaining.len() < len {
            return Err(DecodingError::UnexpectedEnd { extra_len: len - remaining.len() });
        }
        let (bytes, rest) = remaining.split_at(len);
        *self = rest;
        Ok(bytes)
    }
}

impl Encode for &str {
    #[inline]
    fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        self.as_bytes().encode(sink)
    }
}

impl<'de: 'a, 'a> Decode<'de> for &'a str {
    #[inline]
    fn decode<S>(source: &mut S) -> Result<Self, S::Error>
    where
        S: Source<'de>,
    {
        let bytes = <&[u8]>::decode(source)?;
        str::from_utf8(bytes).map_err(|err| DecodingError::Str(err).into())
    }
}

impl Encode for Level {
    #[inline]
    fn encode<S>(&self, sink: &mut S) -> Result<(), S::Error>
    where
        S: Sink,
    {
        self.primitive().encode(sink)
    }
}

impl<'de> Decode<'de> for Level {
    fn decode<S>(source: &mut S) -> Result<Self, S::Error>
    where
        S: Source<'de>,
    {
        let found_byte = u8::decode(source)?;
        Level::from_primitive(found_byte).ok_or_else(|| {
            DecodingError::UnexpectedVariant { type_name: type_name::<Self>(), found_byte }.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        codec::{check_field_len, Decode, DecodingError, Encode, EncodingError},
        Level,
    };

    /// Codec testing helper.
    ///
    /// It takes two arguments (type, value) and returns the encoded bytes.
    macro_rules! test_coding {
        ($ty:ty, $val:expr) => {{
            let mut sink = Vec::new();

            let val: $ty = $val;
            val.encode(&mut sink).unwrap();

            let mut source = sink.as_slice();
            assert_eq!(<$ty>::decode(&mut source).unwrap(), $val);
            assert!(source.is_empty());

            sink
        }};
    }

    #[test]
    fn test_integer() {
        assert_eq!(test_coding!(u32, 0x7F), [0x7F]);
        assert_eq!(test_coding!(u64, 0x80), [0x80, 0x01]);
        assert_eq!(test_coding!(u64, 0xC0C0C0C0), [0xC0, 0x81, 0x83, 0x86, 0x0C]);
        // Test for overflow.
        let sink = test_coding!(u64, u32::MAX as u64 + 1);
        assert_eq!(sink, [0x80, 0x80, 0x80, 0x80, 0x10]);
        let mut source = sink.as_slice();
        assert!(matches!(u32::decode(&mut source), Err(DecodingError::IntegerOverflow)));
    }

    #[test]
    fn test_varint_too_long() {
        // Eleven continuation groups never fit a `u64`.
        let mut source: &[u8] = &[0xFF; 11];
        assert!(matches!(u64::decode(&mut source), Err(DecodingError::IntegerOverflow)));

        // The tenth byte may only carry the top bit.
        let mut source: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02];
        assert!(matches!(u64::decode(&mut source), Err(DecodingError::IntegerOverflow)));
        assert_eq!(test_coding!(u64, u64::MAX).len(), 10);
    }

    #[test]
    fn test_field_len_limit() {
        assert!(check_field_len(0).is_ok());
        assert!(check_field_len(u32::MAX as usize).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            check_field_len(u32::MAX as usize + 1),
            Err(EncodingError::FieldTooLong { len }) if len == 1 << 32
        ));
    }

    #[test]
    fn test_str() {
        assert_eq!(test_coding!(&str, ""), [0x00]);
        assert_eq!(test_coding!(&str, "héllo"), [0x06, 0x68, 0xC3, 0xA9, 0x6C, 0x6C, 0x6F]);

        // Invalid UTF-8.
        let mut source: &[u8] = &[0x02, 0xC3, 0x28];
        assert!(matches!(<&str>::decode(&mut source), Err(DecodingError::Str(_))));
    }

    #[test]
    fn test_level() {
        assert_eq!(test_coding!(Level, Level::Warn), [0x03]);

        let mut source: &[u8] = &[0x09];
        assert!(matches!(
            Level::decode(&mut source),
            Err(DecodingError::UnexpectedVariant { found_byte: 0x09, .. })
        ));
    }

    #[test]
    fn test_unexpected_end() {
        let mut source: &[u8] = &[0x05, b'a', b'b'];
        assert!(matches!(
            <&[u8]>::decode(&mut source),
            Err(DecodingError::UnexpectedEnd { extra_len: 3 })
        ));
    }
}
