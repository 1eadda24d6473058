//! `pthread_key_create`/`setspecific`/`getspecific`. Thread-specific data is
//! a flat `Vec<GuestAddr>` per thread, indexed by key; the key table itself
//! just tracks which indices are in use, since TSD storage lives on the
//! owning `ThreadRecord` and is freed along with it.

use crate::error::PthreadError;
use dynamo_sched::ThreadTable;
use dynamo_types::{GuestAddr, ThreadId};

/// Maximum number of distinct keys live at once (`PTHREAD_KEYS_MAX`-style
/// cap), matched by every thread's `tsd` vector length.
pub const MAX_KEYS: usize = 64;

/// Which key slots are currently allocated, independent of any one
/// thread's `tsd` storage.
pub struct KeyTable {
    in_use: [bool; MAX_KEYS],
}

impl KeyTable {
    pub fn new() -> Self {
        KeyTable { in_use: [false; MAX_KEYS] }
    }

    /// `KEY_CREATE()`.
    pub fn create(&mut self) -> Result<usize, PthreadError> {
        let slot = self.in_use.iter().position(|used| !used).ok_or(PthreadError::KeyTableFull)?;
        self.in_use[slot] = true;
        Ok(slot)
    }

    /// `KEY_DELETE(key)`.
    pub fn delete(&mut self, key: usize) -> Result<(), PthreadError> {
        self.check(key)?;
        self.in_use[key] = false;
        Ok(())
    }

    fn check(&self, key: usize) -> Result<(), PthreadError> {
        if key >= MAX_KEYS || !self.in_use[key] {
            return Err(PthreadError::UnknownKey);
        }
        Ok(())
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new()
    }
}

fn tsd_slot<'a>(threads: &'a mut ThreadTable, tid: ThreadId, key: usize) -> &'a mut GuestAddr {
    let tsd = &mut threads.get_mut(tid).tsd;
    if tsd.len() <= key {
        tsd.resize(key + 1, 0);
    }
    &mut tsd[key]
}

/// `KEY_SETSPECIFIC_PTR(key, value)`.
pub fn set_specific(keys: &KeyTable, threads: &mut ThreadTable, tid: ThreadId, key: usize, value: GuestAddr) -> Result<(), PthreadError> {
    keys.check(key)?;
    *tsd_slot(threads, tid, key) = value;
    Ok(())
}

/// `KEY_GETSPECIFIC_PTR(key)`.
pub fn get_specific(keys: &KeyTable, threads: &ThreadTable, tid: ThreadId, key: usize) -> Result<GuestAddr, PthreadError> {
    keys.check(key)?;
    Ok(threads.get(tid).tsd.get(key).copied().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_keys_are_distinct() {
        let mut keys = KeyTable::new();
        let a = keys.create().unwrap();
        let b = keys.create().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn table_reports_full_once_exhausted() {
        let mut keys = KeyTable::new();
        for _ in 0..MAX_KEYS {
            keys.create().unwrap();
        }
        assert_eq!(keys.create(), Err(PthreadError::KeyTableFull));
    }

    #[test]
    fn deleted_key_slot_is_reusable() {
        let mut keys = KeyTable::new();
        let k = keys.create().unwrap();
        keys.delete(k).unwrap();
        assert_eq!(keys.create(), Ok(k));
    }

    #[test]
    fn set_then_get_round_trips_per_thread() {
        let mut keys = KeyTable::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        let key = keys.create().unwrap();
        set_specific(&keys, &mut threads, tid, key, 0xdead).unwrap();
        assert_eq!(get_specific(&keys, &threads, tid, key), Ok(0xdead));
    }

    #[test]
    fn unset_key_for_a_thread_reads_as_null() {
        let mut keys = KeyTable::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        let key = keys.create().unwrap();
        assert_eq!(get_specific(&keys, &threads, tid, key), Ok(0));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let keys = KeyTable::new();
        let mut threads = ThreadTable::new();
        let tid = threads.alloc().unwrap();
        assert_eq!(get_specific(&keys, &threads, tid, 5), Err(PthreadError::UnknownKey));
    }
}
