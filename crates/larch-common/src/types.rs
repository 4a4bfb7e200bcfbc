//! Key and value capabilities.
//!
//! Tree keys and values must round-trip through two encodings: a binary one
//! used for node bodies on the backing store, and a text one used for
//! write-ahead-log lines. Values must additionally be combinable so that
//! UPDATE messages can be folded together.

use crate::error::{LarchError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// A serializable datum usable as a tree key or value.
///
/// `encode`/`decode` is the binary form (little-endian, length-prefixed);
/// `encode_text`/`decode_text` is the line-oriented text form used by the
/// log file. Strings encode as `len,bytes` in text so embedded whitespace
/// survives a round-trip.
pub trait Datum: Sized + Clone + std::fmt::Debug {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut &[u8]) -> Result<Self>;

    fn encode_text(&self, out: &mut String);

    /// Consumes one datum from the front of `input`, advancing it past any
    /// leading whitespace and the datum itself.
    fn decode_text(input: &mut &str) -> Result<Self>;
}

/// Additively combinable values, used to fold UPDATE messages.
///
/// `a.combine(b)` applies `b` on top of `a`; it is not required to be
/// commutative (string concatenation is the canonical instance).
pub trait Combine {
    fn combine(&self, other: &Self) -> Self;
}

fn skip_ws(input: &mut &str) {
    *input = input.trim_start();
}

fn take_u64(input: &mut &str) -> Result<u64> {
    skip_ws(input);
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if end == 0 {
        return Err(LarchError::Format(format!(
            "expected integer, found {:?}",
            input.chars().next()
        )));
    }
    let (digits, rest) = input.split_at(end);
    let n = digits
        .parse::<u64>()
        .map_err(|e| LarchError::Format(e.to_string()))?;
    *input = rest;
    Ok(n)
}

impl Datum for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(LarchError::Format("truncated u64".to_string()));
        }
        Ok(buf.get_u64_le())
    }

    fn encode_text(&self, out: &mut String) {
        out.push_str(&self.to_string());
    }

    fn decode_text(input: &mut &str) -> Result<Self> {
        take_u64(input)
    }
}

impl Combine for u64 {
    fn combine(&self, other: &Self) -> Self {
        self.wrapping_add(*other)
    }
}

impl Datum for String {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(LarchError::Format("truncated string length".to_string()));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(LarchError::Format("truncated string body".to_string()));
        }
        let s = String::from_utf8(buf[..len].to_vec())
            .map_err(|e| LarchError::Format(e.to_string()))?;
        buf.advance(len);
        Ok(s)
    }

    fn encode_text(&self, out: &mut String) {
        out.push_str(&self.len().to_string());
        out.push(',');
        out.push_str(self);
    }

    fn decode_text(input: &mut &str) -> Result<Self> {
        let len = take_u64(input)? as usize;
        let rest = input
            .strip_prefix(',')
            .ok_or_else(|| LarchError::Format("expected ',' after string length".to_string()))?;
        if rest.len() < len {
            return Err(LarchError::Format("truncated string body".to_string()));
        }
        let (body, tail) = rest.split_at(len);
        *input = tail;
        Ok(body.to_string())
    }
}

impl Combine for String {
    fn combine(&self, other: &Self) -> Self {
        let mut s = String::with_capacity(self.len() + other.len());
        s.push_str(self);
        s.push_str(other);
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_roundtrip<T: Datum + PartialEq>(value: T) {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        let mut slice = &buf[..];
        let decoded = T::decode(&mut slice).unwrap();
        assert!(decoded == value);
        assert!(slice.is_empty());
    }

    fn text_roundtrip<T: Datum + PartialEq>(value: T) {
        let mut out = String::new();
        value.encode_text(&mut out);
        let mut cursor = out.as_str();
        let decoded = T::decode_text(&mut cursor).unwrap();
        assert!(decoded == value);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_u64_binary_roundtrip() {
        binary_roundtrip(0u64);
        binary_roundtrip(42u64);
        binary_roundtrip(u64::MAX);
    }

    #[test]
    fn test_u64_text_roundtrip() {
        text_roundtrip(0u64);
        text_roundtrip(123456789u64);
        text_roundtrip(u64::MAX);
    }

    #[test]
    fn test_string_binary_roundtrip() {
        binary_roundtrip(String::new());
        binary_roundtrip("hello".to_string());
        binary_roundtrip("with spaces and -> arrows".to_string());
    }

    #[test]
    fn test_string_text_roundtrip() {
        text_roundtrip(String::new());
        text_roundtrip("7:".to_string());
        text_roundtrip("value with spaces".to_string());
    }

    #[test]
    fn test_string_text_preserves_trailing_input() {
        let mut out = String::new();
        "ab".to_string().encode_text(&mut out);
        out.push_str(" trailing");

        let mut cursor = out.as_str();
        let decoded = String::decode_text(&mut cursor).unwrap();
        assert_eq!(decoded, "ab");
        assert_eq!(cursor, " trailing");
    }

    #[test]
    fn test_u64_decode_truncated() {
        let mut slice: &[u8] = &[1, 2, 3];
        assert!(u64::decode(&mut slice).is_err());
    }

    #[test]
    fn test_string_decode_truncated_body() {
        let mut buf = BytesMut::new();
        "hello".to_string().encode(&mut buf);
        let mut slice = &buf[..6]; // length prefix plus two bytes
        assert!(String::decode(&mut slice).is_err());
    }

    #[test]
    fn test_u64_decode_text_rejects_garbage() {
        let mut cursor = "not-a-number";
        assert!(u64::decode_text(&mut cursor).is_err());
    }

    #[test]
    fn test_combine_u64() {
        assert_eq!(2u64.combine(&3), 5);
        assert_eq!(u64::MAX.combine(&1), 0);
    }

    #[test]
    fn test_combine_string_order() {
        let a = "ab".to_string();
        let b = "cd".to_string();
        assert_eq!(a.combine(&b), "abcd");
        assert_eq!(b.combine(&a), "cdab");
    }
}
