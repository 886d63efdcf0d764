//! Canonical serialization for every hashed, wire, or on-disk object.
//!
//! One byte layout rules them all:
//! - fixed-width integers little-endian, written raw
//! - variable-length byte fields prefixed by a LEB128 length varint
//! - arrays prefixed by a LEB128 count varint
//! - strings UTF-8, length-prefixed like byte fields
//! - fixed-size fields (hashes, keys, signatures) written raw
//!
//! Transaction IDs and block hashes depend only on this encoding, never on
//! the in-memory representation. For any accepted object,
//! `decode(encode(x)) == x` and `encode(decode(b)) == b`.

use crate::error::CodecError;

/// Largest varint-prefixed collection the decoder will allocate for.
///
/// Concrete per-object limits (MAX_INPUTS, max_block_bytes) are enforced by
/// the validators; this is the decoder's own sanity bound.
pub const MAX_DECODE_ITEMS: u64 = 1 << 24;

/// Append-only canonical byte writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// LEB128 unsigned varint.
    pub fn put_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Raw fixed-size bytes, no prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed variable bytes.
    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_string(&mut self, s: &str) {
        self.put_var_bytes(s.as_bytes());
    }

    /// Option encoded as a presence byte (0 = None, 1 = Some).
    pub fn put_option<T: Encodable>(&mut self, v: &Option<T>) {
        match v {
            None => self.put_u8(0),
            Some(x) => {
                self.put_u8(1);
                x.encode_into(self);
            }
        }
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Count-prefixed array.
    pub fn put_vec<T: Encodable>(&mut self, items: &[T]) {
        self.put_varint(items.len() as u64);
        for item in items {
            item.encode_into(self);
        }
    }
}

/// Positioned canonical byte reader.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn get_varint(&mut self) -> Result<u64, CodecError> {
        let mut result: u64 = 0;
        for shift in (0..70).step_by(7) {
            let byte = self.get_u8()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                // Reject non-minimal encodings so encode(decode(b)) == b holds.
                if byte == 0 && shift > 0 {
                    return Err(CodecError::VarintOverflow);
                }
                return Ok(result);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// Raw fixed-size array.
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let b = self.take(N)?;
        Ok(b.try_into().expect("exact length"))
    }

    /// Length-prefixed variable bytes, bounds-checked against the buffer.
    pub fn get_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_varint()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::LengthOutOfBounds { len, remaining: self.remaining() });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag { what: "bool", tag }),
        }
    }

    pub fn get_option<T: Encodable>(&mut self) -> Result<Option<T>, CodecError> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode_from(self)?)),
            tag => Err(CodecError::InvalidTag { what: "option", tag }),
        }
    }

    pub fn get_vec<T: Encodable>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.get_varint()?;
        if count > MAX_DECODE_ITEMS {
            return Err(CodecError::OversizedCollection { len: count, max: MAX_DECODE_ITEMS });
        }
        // An item takes at least one byte; anything claiming more is bogus.
        if count > self.remaining() as u64 {
            return Err(CodecError::LengthOutOfBounds { len: count, remaining: self.remaining() });
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::decode_from(self)?);
        }
        Ok(items)
    }
}

/// An object with a canonical byte representation.
pub trait Encodable: Sized {
    /// Write the canonical encoding into `w`.
    fn encode_into(&self, w: &mut Writer);

    /// Read one object from `r`, advancing its position.
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Canonical bytes of this object.
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_into(&mut w);
        w.into_bytes()
    }

    /// Serialized size in bytes.
    fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    /// Decode exactly one object; trailing bytes are an error.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let value = Self::decode_from(&mut r)?;
        if r.remaining() > 0 {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }
        Ok(value)
    }
}

impl Encodable for u64 {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u64(*self);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.get_u64()
    }
}

impl Encodable for String {
    fn encode_into(&self, w: &mut Writer) {
        w.put_string(self);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.get_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_small_values_one_byte() {
        for v in [0u64, 1, 127] {
            let mut w = Writer::new();
            w.put_varint(v);
            assert_eq!(w.len(), 1);
            let mut r = Reader::new(&w.buf);
            assert_eq!(r.get_varint().unwrap(), v);
        }
    }

    #[test]
    fn varint_boundaries() {
        for v in [128u64, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut w = Writer::new();
            w.put_varint(v);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            assert_eq!(r.get_varint().unwrap(), v);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn varint_max_is_ten_bytes() {
        let mut w = Writer::new();
        w.put_varint(u64::MAX);
        assert_eq!(w.len(), 10);
    }

    #[test]
    fn varint_non_minimal_rejected() {
        // 0x80 0x00 decodes to 0 but is not the minimal encoding.
        let mut r = Reader::new(&[0x80, 0x00]);
        assert_eq!(r.get_varint().unwrap_err(), CodecError::VarintOverflow);
    }

    #[test]
    fn varint_overflow_rejected() {
        // 11 continuation bytes cannot be a valid u64.
        let bytes = [0xFFu8; 11];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_varint().unwrap_err(), CodecError::VarintOverflow);
    }

    #[test]
    fn u64_little_endian() {
        let mut w = Writer::new();
        w.put_u64(0x0102_0304_0506_0708);
        assert_eq!(w.into_bytes(), vec![8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn var_bytes_round_trip() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut w = Writer::new();
        w.put_var_bytes(&data);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_var_bytes().unwrap(), data);
    }

    #[test]
    fn var_bytes_length_beyond_buffer_rejected() {
        // Claims 100 bytes, provides 2.
        let mut w = Writer::new();
        w.put_varint(100);
        w.put_raw(&[1, 2]);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.get_var_bytes().unwrap_err(),
            CodecError::LengthOutOfBounds { len: 100, .. }
        ));
    }

    #[test]
    fn string_invalid_utf8_rejected() {
        let mut w = Writer::new();
        w.put_var_bytes(&[0xFF, 0xFE]);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_string().unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn bool_rejects_non_canonical_tag() {
        let mut r = Reader::new(&[2]);
        assert!(matches!(r.get_bool().unwrap_err(), CodecError::InvalidTag { .. }));
    }

    #[test]
    fn option_round_trip() {
        let mut w = Writer::new();
        w.put_option(&Some(42u64));
        w.put_option::<u64>(&None);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_option::<u64>().unwrap(), Some(42));
        assert_eq!(r.get_option::<u64>().unwrap(), None);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn vec_count_beyond_buffer_rejected() {
        let mut w = Writer::new();
        w.put_varint(1_000);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(r.get_vec::<u64>().is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut w = Writer::new();
        w.put_u64(7);
        w.put_u8(0xAA);
        let bytes = w.into_bytes();
        assert_eq!(u64::decode(&bytes).unwrap_err(), CodecError::TrailingBytes(1));
    }

    #[test]
    fn eof_mid_integer() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.get_u64().unwrap_err(), CodecError::UnexpectedEof(_)));
    }

    proptest! {
        #[test]
        fn varint_round_trips(v in any::<u64>()) {
            let mut w = Writer::new();
            w.put_varint(v);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.get_varint().unwrap(), v);
            prop_assert_eq!(r.remaining(), 0);
        }

        #[test]
        fn var_bytes_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut w = Writer::new();
            w.put_var_bytes(&data);
            let bytes = w.into_bytes();
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(r.get_var_bytes().unwrap(), data);
        }
    }
}
