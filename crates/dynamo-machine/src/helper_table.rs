//! Plugin helper-slot registration: the core asks the tool to register up
//! to 8 "compact" helpers (short call-site encoding) and up to 50
//! non-compact ones, then assigns each a base-block slot so codegen can
//! emit `call *off(%ebp)` for the indirection.

use thiserror::Error;

pub const MAX_COMPACT_HELPERS: usize = 8;
pub const MAX_NONCOMPACT_HELPERS: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HelperTableError {
    #[error("compact helper slots exhausted (max {MAX_COMPACT_HELPERS})")]
    CompactFull,
    #[error("non-compact helper slots exhausted (max {MAX_NONCOMPACT_HELPERS})")]
    NonCompactFull,
}

/// One registered helper's host function pointer, as a raw address —
/// plugin helpers share the `extern "C" fn(*mut BaseBlock)` convention
/// `dynamo-jit-x86`'s own helper table uses.
pub type HelperAddr = usize;

#[derive(Default)]
pub struct HelperTable {
    compact: Vec<HelperAddr>,
    noncompact: Vec<HelperAddr>,
}

/// Where a registered helper landed: which bank, and its index within it.
/// Codegen turns this into a base-block field offset for the `call
/// *off(%ebp)` site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperSlot {
    Compact(usize),
    NonCompact(usize),
}

impl HelperTable {
    pub fn new() -> Self {
        HelperTable::default()
    }

    pub fn register_compact(&mut self, addr: HelperAddr) -> Result<HelperSlot, HelperTableError> {
        if self.compact.len() >= MAX_COMPACT_HELPERS {
            return Err(HelperTableError::CompactFull);
        }
        self.compact.push(addr);
        Ok(HelperSlot::Compact(self.compact.len() - 1))
    }

    pub fn register_noncompact(&mut self, addr: HelperAddr) -> Result<HelperSlot, HelperTableError> {
        if self.noncompact.len() >= MAX_NONCOMPACT_HELPERS {
            return Err(HelperTableError::NonCompactFull);
        }
        self.noncompact.push(addr);
        Ok(HelperSlot::NonCompact(self.noncompact.len() - 1))
    }

    pub fn address_of(&self, slot: HelperSlot) -> HelperAddr {
        match slot {
            HelperSlot::Compact(i) => self.compact[i],
            HelperSlot::NonCompact(i) => self.noncompact[i],
        }
    }

    /// Registered compact-helper addresses in slot order, for installing
    /// into a live base block's `compact_helpers` bank.
    pub fn compact_addrs(&self) -> &[HelperAddr] {
        &self.compact
    }

    /// Registered non-compact-helper addresses in slot order, for
    /// installing into a live base block's `noncompact_helpers` bank.
    pub fn noncompact_addrs(&self) -> &[HelperAddr] {
        &self.noncompact
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_slots_are_assigned_in_registration_order() {
        let mut table = HelperTable::new();
        let a = table.register_compact(0x1000).unwrap();
        let b = table.register_compact(0x2000).unwrap();
        assert_eq!(a, HelperSlot::Compact(0));
        assert_eq!(b, HelperSlot::Compact(1));
        assert_eq!(table.address_of(a), 0x1000);
        assert_eq!(table.address_of(b), 0x2000);
    }

    #[test]
    fn compact_bank_reports_full_past_eight() {
        let mut table = HelperTable::new();
        for i in 0..MAX_COMPACT_HELPERS {
            table.register_compact(0x1000 + i).unwrap();
        }
        assert_eq!(table.register_compact(0xffff), Err(HelperTableError::CompactFull));
    }

    #[test]
    fn noncompact_bank_reports_full_past_fifty() {
        let mut table = HelperTable::new();
        for i in 0..MAX_NONCOMPACT_HELPERS {
            table.register_noncompact(0x1000 + i).unwrap();
        }
        assert_eq!(table.register_noncompact(0xffff), Err(HelperTableError::NonCompactFull));
    }
}
