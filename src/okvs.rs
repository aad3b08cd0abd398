//! In-memory ordered key-value store with an explicit byte budget
//! (spec.md §4.3, [MODULE C]).
//!
//! A transaction here does not provide multi-version isolation — each
//! [`Bank`](crate::bank::Bank) already gives every in-flight write its own
//! `Okvs` half, so the only job of [`Txn`] is to stage writes and let them
//! be discarded atomically on rollback, charging the byte budget as they're
//! staged so an overflow is caught before anything lands in the store.

use crate::error::{FlowError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

fn entry_cost(key: &[u8], val: &[u8]) -> usize {
    key.len() + val.len()
}

/// The ordered store itself: one per bank half.
pub struct Okvs {
    inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    used_bytes: AtomicUsize,
    limit_bytes: usize,
}

impl Okvs {
    /// Creates an empty store with the given byte budget.
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            used_bytes: AtomicUsize::new(0),
            limit_bytes,
        }
    }

    /// Bytes currently charged against the budget.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// The configured byte budget.
    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Reads a key directly against committed state.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the store holds no committed entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Discards every committed entry and resets the byte budget, used when
    /// a bank half is reclaimed (spec.md §4.6 "arena full" / §4.4 swap
    /// drain).
    pub fn clear(&self) {
        self.inner.lock().clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    /// Begins a transaction staging writes against this store.
    pub fn begin(&self) -> Txn<'_> {
        Txn { okvs: self, staged: BTreeMap::new(), staged_bytes: 0, state: TxState::Active }
    }

    /// Snapshots the current committed contents into an ascending cursor.
    pub fn cursor(&self) -> Cursor {
        let entries: Vec<(Vec<u8>, Vec<u8>)> =
            self.inner.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Cursor { entries, pos: 0 }
    }

    /// Drops every committed entry for which `keep` returns `false`,
    /// recomputing the byte budget from what remains. Used by the MAVG
    /// per-thread arena-full reclaim (spec.md §4.6): "copy forward only rows
    /// whose `time_prev + W > now`; all stale rows are dropped."
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut inner = self.inner.lock();
        inner.retain(|k, v| keep(k, v));
        let used: usize = inner.iter().map(|(k, v)| entry_cost(k, v)).sum();
        drop(inner);
        self.used_bytes.store(used, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

enum StagedOp {
    Put(Vec<u8>),
    Delete,
}

/// A staged batch of writes against an [`Okvs`]. Must be explicitly
/// committed or rolled back; dropping it active is a programmer error.
pub struct Txn<'a> {
    okvs: &'a Okvs,
    staged: BTreeMap<Vec<u8>, StagedOp>,
    staged_bytes: usize,
    state: TxState,
}

impl<'a> Txn<'a> {
    /// Reads a key, preferring this transaction's own staged writes.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.staged.get(key) {
            Some(StagedOp::Put(v)) => Some(v.clone()),
            Some(StagedOp::Delete) => None,
            None => self.okvs.get(key),
        }
    }

    /// Stages a write, failing if it would push the store past its byte
    /// budget.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let cost = entry_cost(key, val);
        let prospective = self.okvs.used_bytes() + self.staged_bytes + cost;
        if prospective > self.okvs.limit_bytes {
            return Err(FlowError::OutOfMemory { used: prospective, limit: self.okvs.limit_bytes });
        }
        self.staged_bytes += cost;
        self.staged.insert(key.to_vec(), StagedOp::Put(val.to_vec()));
        Ok(())
    }

    /// Stages a delete.
    pub fn delete(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), StagedOp::Delete);
    }

    /// Applies every staged write to the underlying store.
    pub fn commit(mut self) -> Result<()> {
        let mut inner = self.okvs.inner.lock();
        let mut delta: i64 = 0;
        for (key, op) in std::mem::take(&mut self.staged) {
            match op {
                StagedOp::Put(val) => {
                    let added = entry_cost(&key, &val) as i64;
                    let removed = inner.get(&key).map(|old| entry_cost(&key, old) as i64).unwrap_or(0);
                    delta += added - removed;
                    inner.insert(key, val);
                }
                StagedOp::Delete => {
                    if let Some(old) = inner.remove(&key) {
                        delta -= entry_cost(&key, &old) as i64;
                    }
                }
            }
        }
        drop(inner);
        if delta >= 0 {
            self.okvs.used_bytes.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            self.okvs.used_bytes.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
        self.state = TxState::Committed;
        Ok(())
    }

    /// Discards every staged write.
    pub fn rollback(mut self) {
        self.staged.clear();
        self.staged_bytes = 0;
        self.state = TxState::RolledBack;
    }
}

impl<'a> Drop for Txn<'a> {
    fn drop(&mut self) {
        if self.state == TxState::Active && !std::thread::panicking() {
            panic!("okvs transaction dropped without commit or rollback");
        }
    }
}

/// An ascending snapshot iterator over an [`Okvs`]'s committed contents,
/// taken at the moment [`Okvs::cursor`] was called.
pub struct Cursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl Cursor {
    /// Positions the cursor at the first entry whose key is `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.pos = self.entries.partition_point(|(k, _)| k.as_slice() < key);
    }

    /// Returns the entry under the cursor and advances past it.
    pub fn next(&mut self) -> Option<(&[u8], &[u8])> {
        let (k, v) = self.entries.get(self.pos)?;
        self.pos += 1;
        Some((k.as_slice(), v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_staged_writes() {
        let okvs = Okvs::new(1024);
        let mut txn = okvs.begin();
        txn.put(b"a", b"1").unwrap();
        txn.put(b"b", b"2").unwrap();
        txn.commit().unwrap();
        assert_eq!(okvs.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(okvs.len(), 2);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let okvs = Okvs::new(1024);
        let mut txn = okvs.begin();
        txn.put(b"a", b"1").unwrap();
        txn.rollback();
        assert_eq!(okvs.get(b"a"), None);
    }

    #[test]
    fn put_past_budget_is_out_of_memory() {
        let okvs = Okvs::new(4);
        let mut txn = okvs.begin();
        let err = txn.put(b"toolong", b"value").unwrap_err();
        assert!(matches!(err, FlowError::OutOfMemory { .. }));
        txn.rollback();
    }

    #[test]
    fn cursor_seeks_ascending() {
        let okvs = Okvs::new(1024);
        let mut txn = okvs.begin();
        for k in [b"c", b"a", b"b"] {
            txn.put(k, b"x").unwrap();
        }
        txn.commit().unwrap();
        let mut cur = okvs.cursor();
        cur.seek(b"b");
        assert_eq!(cur.next().unwrap().0, b"b");
        assert_eq!(cur.next().unwrap().0, b"c");
        assert!(cur.next().is_none());
    }
}
