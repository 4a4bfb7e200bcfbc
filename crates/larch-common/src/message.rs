//! Upsert messages and their ordering keys.
//!
//! Every mutation entering the tree is a message stamped with the tree's
//! monotonically increasing timestamp. Messages are buffered inside nodes
//! keyed by (key, timestamp), so all pending operations on one key sit next
//! to each other in timestamp order.

use crate::error::{LarchError, Result};
use crate::types::Datum;
use bytes::{Buf, BufMut, BytesMut};

/// The kinds of message that flow through the tree and the log.
///
/// `Checkpoint` appears only in the log stream; it never enters a node
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Insert = 0,
    Update = 1,
    Delete = 2,
    Checkpoint = 4,
}

impl TryFrom<u8> for Opcode {
    type Error = LarchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::Insert),
            1 => Ok(Opcode::Update),
            2 => Ok(Opcode::Delete),
            4 => Ok(Opcode::Checkpoint),
            _ => Err(LarchError::Format(format!("invalid opcode: {}", value))),
        }
    }
}

/// Ordering key for a buffered message: the user key plus the timestamp
/// assigned at upsert. Ordered by key, then timestamp, so
/// `range_start(k)..=range_end(k)` spans every message for `k`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageKey<K> {
    pub key: K,
    pub timestamp: u64,
}

impl<K: Clone> MessageKey<K> {
    pub fn new(key: K, timestamp: u64) -> Self {
        Self { key, timestamp }
    }

    /// Smallest message key for `key`.
    pub fn range_start(key: &K) -> Self {
        Self {
            key: key.clone(),
            timestamp: 0,
        }
    }

    /// Largest message key for `key`.
    pub fn range_end(key: &K) -> Self {
        Self {
            key: key.clone(),
            timestamp: u64::MAX,
        }
    }
}

impl<K: Datum> MessageKey<K> {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.timestamp);
        self.key.encode(buf);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(LarchError::Format("truncated message key".to_string()));
        }
        let timestamp = buf.get_u64_le();
        let key = K::decode(buf)?;
        Ok(Self { key, timestamp })
    }
}

/// A pending operation: opcode plus payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<V> {
    pub opcode: Opcode,
    pub value: V,
}

impl<V> Message<V> {
    pub fn new(opcode: Opcode, value: V) -> Self {
        Self { opcode, value }
    }
}

impl<V: Datum> Message<V> {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode as u8);
        self.value.encode(buf);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(LarchError::Format("truncated message".to_string()));
        }
        let opcode = Opcode::try_from(buf.get_u8())?;
        let value = V::decode(buf)?;
        Ok(Self { opcode, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0).unwrap(), Opcode::Insert);
        assert_eq!(Opcode::try_from(1).unwrap(), Opcode::Update);
        assert_eq!(Opcode::try_from(2).unwrap(), Opcode::Delete);
        assert_eq!(Opcode::try_from(4).unwrap(), Opcode::Checkpoint);
        assert!(Opcode::try_from(3).is_err());
        assert!(Opcode::try_from(255).is_err());
    }

    #[test]
    fn test_message_key_ordering() {
        let a = MessageKey::new(1u64, 5);
        let b = MessageKey::new(1u64, 9);
        let c = MessageKey::new(2u64, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_message_key_range_sentinels() {
        let start = MessageKey::range_start(&7u64);
        let end = MessageKey::range_end(&7u64);
        let mid = MessageKey::new(7u64, 1234);

        assert!(start < mid);
        assert!(mid < end);
    }

    #[test]
    fn test_message_key_roundtrip() {
        let mkey = MessageKey::new(42u64, 17);
        let mut buf = BytesMut::new();
        mkey.encode(&mut buf);

        let mut slice = &buf[..];
        let decoded = MessageKey::<u64>::decode(&mut slice).unwrap();
        assert_eq!(decoded, mkey);
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = Message::new(Opcode::Update, "payload".to_string());
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let mut slice = &buf[..];
        let decoded = Message::<String>::decode(&mut slice).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_decode_bad_opcode() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        "x".to_string().encode(&mut buf);

        let mut slice = &buf[..];
        assert!(Message::<String>::decode(&mut slice).is_err());
    }
}
