// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Field-by-field little-endian wire codec. Fixed-width integers are
// written verbatim; strings carry a 4-byte count, vectors an 8-byte
// count. Every control message implements `Wire` over these primitives.

use crate::error::{MmcError, Result};

/// Append-only encoder over a growable byte buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    pub fn with_capacity(cap: usize) -> Encoder {
        Encoder {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// 4-byte count followed by the bytes.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// 8-byte count followed by each element.
    pub fn put_vec<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Encoder, &T)) {
        self.put_u64(items.len() as u64);
        for item in items {
            f(self, item);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor-style decoder over a received byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(MmcError::Transport(format!(
                "message truncated at byte {} (wanted {n} more of {})",
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| MmcError::Transport("string field is not utf-8".into()))
    }

    pub fn get_vec<T>(&mut self, mut f: impl FnMut(&mut Decoder<'a>) -> Result<T>) -> Result<Vec<T>> {
        let len = self.get_u64()? as usize;
        // Bound preallocation by what the buffer could possibly hold.
        let mut out = Vec::with_capacity(len.min(self.buf.len() - self.pos + 1));
        for _ in 0..len {
            out.push(f(self)?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// A typed message that can cross the wire.
pub trait Wire: Sized {
    fn encode(&self, enc: &mut Encoder);
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(64);
        self.encode(&mut enc);
        enc.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut Decoder::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let mut enc = Encoder::new();
        enc.put_u32(0x0102_0304);
        assert_eq!(enc.as_bytes(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn string_and_vec_round_trip() {
        let mut enc = Encoder::new();
        enc.put_str("cache-key");
        enc.put_vec(&[1u64, 2, 3], |e, v| e.put_u64(*v));

        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_str().unwrap(), "cache-key");
        assert_eq!(dec.get_vec(|d| d.get_u64()).unwrap(), vec![1, 2, 3]);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn truncation_is_an_error_not_a_panic() {
        let bytes = [0x05, 0x00, 0x00, 0x00, b'a'];
        let mut dec = Decoder::new(&bytes);
        assert!(dec.get_str().is_err());
    }
}
