//! Ordered traversal over live keys.
//!
//! A thin projection over the tree's message stream: pending messages are
//! visited in (key, timestamp) order and folded into live (key, value)
//! pairs with the usual precedence (INSERT establishes, UPDATE combines,
//! DELETE suppresses).

use crate::tree::Betree;
use larch_common::{Combine, Datum, Message, MessageKey, Opcode, Result};

/// Streaming cursor over a tree's live entries, in key order.
pub struct Cursor<'a, K: Datum + Ord, V: Datum + Combine> {
    tree: &'a mut Betree<K, V>,
    start: Option<MessageKey<K>>,
    position: Option<(MessageKey<K>, Message<V>)>,
    primed: bool,
}

impl<'a, K: Datum + Ord, V: Datum + Combine> Cursor<'a, K, V> {
    pub(crate) fn new(tree: &'a mut Betree<K, V>, start: Option<MessageKey<K>>) -> Self {
        Self {
            tree,
            start,
            position: None,
            primed: false,
        }
    }

    fn prime(&mut self) -> Result<()> {
        if self.primed {
            return Ok(());
        }
        self.position = self.tree.first_message_from(self.start.as_ref())?;
        self.primed = true;
        Ok(())
    }

    /// Produces the next live (key, value) pair, or None at the end.
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        self.prime()?;

        let mut key: Option<K> = None;
        let mut value: Option<V> = None;
        let mut valid = false;

        while let Some((mkey, msg)) = self.position.clone() {
            if valid && key.as_ref() != Some(&mkey.key) {
                break;
            }
            match msg.opcode {
                Opcode::Insert => {
                    key = Some(mkey.key.clone());
                    value = Some(msg.value);
                    valid = true;
                }
                Opcode::Update => {
                    let base = match (valid, value.take()) {
                        (true, Some(v)) => v,
                        _ => self.tree.default_value().clone(),
                    };
                    key = Some(mkey.key.clone());
                    value = Some(base.combine(&msg.value));
                    valid = true;
                }
                Opcode::Delete => {
                    valid = false;
                }
                Opcode::Checkpoint => {
                    unreachable!("checkpoint messages never enter tree nodes")
                }
            }
            self.position = self.tree.first_message_from(Some(&mkey))?;
        }

        Ok(match (valid, key, value) {
            (true, Some(k), Some(v)) => Some((k, v)),
            _ => None,
        })
    }

    /// Collects the remaining entries. Convenience for tests and dumps.
    pub fn collect_all(mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(pair) = self.next()? {
            out.push(pair);
        }
        Ok(out)
    }
}
