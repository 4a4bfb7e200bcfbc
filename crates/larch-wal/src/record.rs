//! Log record line format.

use larch_common::{Datum, LarchError, Message, MessageKey, Opcode, Result};

/// One logged upsert: the stamped message key plus the message itself.
///
/// The record's LSN is the message timestamp. On disk a record is one text
/// line:
///
/// ```text
/// <lsn> <key> -> <opcode> <value>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord<K, V> {
    pub mkey: MessageKey<K>,
    pub msg: Message<V>,
}

impl<K: Datum + Ord, V: Datum> LogRecord<K, V> {
    pub fn new(mkey: MessageKey<K>, msg: Message<V>) -> Self {
        Self { mkey, msg }
    }

    /// The record's logical sequence number.
    pub fn lsn(&self) -> u64 {
        self.mkey.timestamp
    }

    /// Renders the record as a log line (without trailing newline).
    pub fn encode_line(&self) -> String {
        let mut line = String::new();
        line.push_str(&self.mkey.timestamp.to_string());
        line.push(' ');
        self.mkey.key.encode_text(&mut line);
        line.push_str(" -> ");
        line.push_str(&(self.msg.opcode as u8).to_string());
        line.push(' ');
        self.msg.value.encode_text(&mut line);
        line
    }

    /// Parses one log line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut cursor = line;
        let timestamp = u64::decode_text(&mut cursor)?;
        let key = K::decode_text(&mut cursor)?;

        cursor = cursor.trim_start();
        cursor = cursor
            .strip_prefix("->")
            .ok_or_else(|| LarchError::Format("expected '->' in log line".to_string()))?;

        let opcode_raw = u64::decode_text(&mut cursor)?;
        let opcode = Opcode::try_from(u8::try_from(opcode_raw).map_err(|_| {
            LarchError::Format(format!("opcode out of range: {}", opcode_raw))
        })?)?;
        let value = V::decode_text(&mut cursor)?;

        Ok(Self {
            mkey: MessageKey::new(key, timestamp),
            msg: Message::new(opcode, value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lsn: u64, key: u64, opcode: Opcode, value: &str) -> LogRecord<u64, String> {
        LogRecord::new(
            MessageKey::new(key, lsn),
            Message::new(opcode, value.to_string()),
        )
    }

    #[test]
    fn test_record_lsn_is_timestamp() {
        let rec = record(17, 3, Opcode::Insert, "x");
        assert_eq!(rec.lsn(), 17);
    }

    #[test]
    fn test_record_line_roundtrip() {
        let rec = record(5, 42, Opcode::Insert, "42:");
        let line = rec.encode_line();
        let parsed = LogRecord::<u64, String>::parse_line(&line).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_record_line_with_spaces_in_value() {
        let rec = record(9, 1, Opcode::Update, "a value -> with arrows");
        let line = rec.encode_line();
        let parsed = LogRecord::<u64, String>::parse_line(&line).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn test_record_line_checkpoint_opcode() {
        let rec = record(100, 7, Opcode::Checkpoint, "7:");
        let line = rec.encode_line();
        assert!(line.contains(" -> 4 "));
        let parsed = LogRecord::<u64, String>::parse_line(&line).unwrap();
        assert_eq!(parsed.msg.opcode, Opcode::Checkpoint);
    }

    #[test]
    fn test_record_line_shape() {
        let rec = record(3, 8, Opcode::Delete, "");
        assert_eq!(rec.encode_line(), "3 8 -> 2 0,");
    }

    #[test]
    fn test_parse_rejects_missing_arrow() {
        assert!(LogRecord::<u64, String>::parse_line("3 8 2 0,").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_opcode() {
        assert!(LogRecord::<u64, String>::parse_line("3 8 -> 9 0,").is_err());
    }
}
