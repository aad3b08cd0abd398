//! Per-thread double-buffered store with a lock-free swap (spec.md §4.4,
//! [MODULE D]).
//!
//! The producer fast path is one relaxed atomic load plus an [`Okvs`]
//! transaction, never a blocking lock acquisition: one atomic load and two
//! pointer dereferences to reach the active half.

use crate::error::Result;
use crate::okvs::{Cursor, Okvs, Txn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const QUIESCE_SLEEP: Duration = Duration::from_micros(50);

/// A double-buffered [`Okvs`] pair: one half absorbs new writes while the
/// other, once quiesced, is drained by a collection cycle and reclaimed for
/// reuse.
pub struct Bank {
    halves: [Okvs; 2],
    /// Low bit selects the half currently open to writers.
    selector: AtomicUsize,
    inflight: [AtomicUsize; 2],
}

impl Bank {
    /// Creates a bank with both halves sized to `half_limit_bytes`.
    pub fn new(half_limit_bytes: usize) -> Self {
        Self {
            halves: [Okvs::new(half_limit_bytes), Okvs::new(half_limit_bytes)],
            selector: AtomicUsize::new(0),
            inflight: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    fn enter(&self) -> usize {
        loop {
            let idx = self.selector.load(Ordering::Relaxed) & 1;
            self.inflight[idx].fetch_add(1, Ordering::Relaxed);
            if self.selector.load(Ordering::Relaxed) & 1 == idx {
                return idx;
            }
            // Swap raced us between the load and the fetch_add: back out and
            // retry against whichever half is active now.
            self.inflight[idx].fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn leave(&self, idx: usize) {
        self.inflight[idx].fetch_sub(1, Ordering::Relaxed);
    }

    /// Runs `f` against a transaction on the currently-active half, on the
    /// producer fast path (no locks taken).
    pub fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Txn) -> Result<()>,
    {
        let idx = self.enter();
        let mut txn = self.halves[idx].begin();
        let result = f(&mut txn);
        match &result {
            Ok(()) => txn.commit()?,
            Err(_) => txn.rollback(),
        }
        self.leave(idx);
        result
    }

    /// Reads a key from whichever half is currently active.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let idx = self.selector.load(Ordering::Relaxed) & 1;
        self.halves[idx].get(key)
    }

    /// Drops entries from the currently-active half for which `keep` returns
    /// `false`, in place, without swapping. Only safe when called by the
    /// single owning producer thread for this bank (spec.md §4.6 per-thread
    /// arena-full reclaim) — never by the background merger.
    pub fn retain_active<F>(&self, keep: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let idx = self.selector.load(Ordering::Relaxed) & 1;
        self.halves[idx].retain(keep);
    }

    /// Bytes currently used by the active half.
    pub fn active_used_bytes(&self) -> usize {
        let idx = self.selector.load(Ordering::Relaxed) & 1;
        self.halves[idx].used_bytes()
    }

    /// Configured per-half byte budget.
    pub fn half_limit_bytes(&self) -> usize {
        self.halves[0].limit_bytes()
    }

    /// Flips the active half, quiesces writers on the old one, and returns a
    /// cursor over its contents. The old half is cleared for reuse once the
    /// returned cursor is dropped; callers must finish draining it before
    /// starting the next `swap`.
    pub fn swap(&self) -> Cursor {
        let old = self.selector.load(Ordering::Relaxed) & 1;
        self.selector.fetch_xor(1, Ordering::Relaxed);
        while self.inflight[old].load(Ordering::Relaxed) != 0 {
            thread::sleep(QUIESCE_SLEEP);
        }
        let cursor = self.halves[old].cursor();
        self.halves[old].clear();
        cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_swap_drains_and_reclaims() {
        let bank = Bank::new(4096);
        bank.write(|txn| txn.put(b"k1", b"v1")).unwrap();
        bank.write(|txn| txn.put(b"k2", b"v2")).unwrap();

        let mut cur = bank.swap();
        let mut seen = Vec::new();
        while let Some((k, v)) = cur.next() {
            seen.push((k.to_vec(), v.to_vec()));
        }
        assert_eq!(seen, vec![(b"k1".to_vec(), b"v1".to_vec()), (b"k2".to_vec(), b"v2".to_vec())]);

        // Old half reclaimed; writes now land on the other half and a second
        // swap drains only those.
        bank.write(|txn| txn.put(b"k3", b"v3")).unwrap();
        let mut cur2 = bank.swap();
        let mut seen2 = Vec::new();
        while let Some((k, v)) = cur2.next() {
            seen2.push(k.to_vec());
        }
        assert_eq!(seen2, vec![b"k3".to_vec()]);
    }

    #[test]
    fn get_reads_active_half() {
        let bank = Bank::new(4096);
        bank.write(|txn| txn.put(b"a", b"1")).unwrap();
        assert_eq!(bank.get(b"a"), Some(b"1".to_vec()));
    }
}
