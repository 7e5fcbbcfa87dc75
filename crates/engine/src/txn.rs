use skdb_common::WriteOp;
use std::collections::HashMap;

/// A staged write set: `Open → Staged` while ops accumulate, then
/// `Committed` or `Aborted` by handing it to `Db::commit` or dropping it.
///
/// Ops keep their insertion order; a later op for the same key shadows the
/// earlier one, which is also what intra-transaction reads observe.
#[derive(Default)]
pub struct Transaction {
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    /// Stage a put with an absolute expiry in epoch milliseconds.
    pub fn put_with_expiry(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        expiry_ms: u64,
    ) {
        self.ops.push(WriteOp::PutTtl { key: key.into(), value: value.into(), expiry_ms });
    }

    /// The op that currently shadows `key`, if any.
    pub fn staged(&self, key: &[u8]) -> Option<&WriteOp> {
        self.ops.iter().rev().find(|op| op.key() == key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Collapse a staged op list so each key appears once, keeping the order
/// in which keys saw their final op.
pub(crate) fn dedupe(ops: Vec<WriteOp>) -> Vec<WriteOp> {
    let mut last_index: HashMap<Vec<u8>, usize> = HashMap::new();
    for (i, op) in ops.iter().enumerate() {
        last_index.insert(op.key().to_vec(), i);
    }
    ops.into_iter()
        .enumerate()
        .filter(|(i, op)| last_index.get(op.key()) == Some(i))
        .map(|(_, op)| op)
        .collect()
}
