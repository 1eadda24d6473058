//! Greedy linear-scan register allocation for one `UCodeBlock`, run as a
//! sub-pass after the decoder finishes emitting it and before codegen sees it.
//!
//! Temps are single-block SSA-ish values, so a simple forward scan with a small number of physical
//! registers is sufficient — there is no cross-block live range to reason
//! about.

use std::collections::HashMap;

use crate::{Operand, RealReg, RegSet, TempId, UCodeBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocResult {
    /// Number of distinct spill slots used by this block.
    pub spill_slots_used: u16,
}

/// Runs liveness + greedy assignment over `block` in place, rewriting every
/// `Operand::TempReg` into `Operand::RealReg`/`Operand::SpillNo`, and fills
/// each `UInstr::live_after` bitmap.
pub fn allocate(block: &mut UCodeBlock) -> AllocResult {
    let n = block.instrs.len();

    // Last instruction index (inclusive) at which each temp is read or
    // defined; used to know when a physical assignment can be freed.
    let mut last_use: HashMap<TempId, usize> = HashMap::new();
    for (idx, instr) in block.instrs.iter().enumerate() {
        for t in instr.temp_uses() {
            last_use.insert(t, idx);
        }
        if let Some(t) = instr.temp_def() {
            last_use.entry(t).or_insert(idx);
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Slot {
        Reg(RealReg),
        Spill(u16),
    }

    let mut assignment: HashMap<TempId, Slot> = HashMap::new();
    let mut free_regs: Vec<RealReg> = RealReg::ALL.to_vec();
    let mut active: Vec<TempId> = Vec::new();
    let mut free_spill_slots: Vec<u16> = Vec::new();
    let mut next_spill_slot: u16 = 0;

    let expire_before = |idx: usize,
                         active: &mut Vec<TempId>,
                         assignment: &HashMap<TempId, Slot>,
                         last_use: &HashMap<TempId, usize>,
                         free_regs: &mut Vec<RealReg>,
                         free_spill_slots: &mut Vec<u16>| {
        active.retain(|t| {
            let still_live = last_use.get(t).copied().unwrap_or(idx) >= idx;
            if !still_live {
                match assignment.get(t) {
                    Some(Slot::Reg(r)) => free_regs.push(*r),
                    Some(Slot::Spill(s)) => free_spill_slots.push(*s),
                    None => {}
                }
            }
            still_live
        });
    };

    for idx in 0..n {
        expire_before(
            idx,
            &mut active,
            &assignment,
            &last_use,
            &mut free_regs,
            &mut free_spill_slots,
        );

        let def = block.instrs[idx].temp_def();
        if let Some(t) = def {
            if !assignment.contains_key(&t) {
                let slot = if let Some(r) = free_regs.pop() {
                    Slot::Reg(r)
                } else if let Some(s) = free_spill_slots.pop() {
                    Slot::Spill(s)
                } else {
                    let s = next_spill_slot;
                    next_spill_slot += 1;
                    Slot::Spill(s)
                };
                assignment.insert(t, slot);
                active.push(t);
            }
        }
        // Uses that were never seen as a def (e.g. a temp materialized by
        // an earlier CCALL result consumed here) still need a binding; this
        // never happens in well-formed decoder output since every temp is
        // defined before use, but bind defensively rather than panic.
        for t in block.instrs[idx].temp_uses() {
            if !assignment.contains_key(&t) {
                let slot = if let Some(r) = free_regs.pop() {
                    Slot::Reg(r)
                } else {
                    let s = next_spill_slot;
                    next_spill_slot += 1;
                    Slot::Spill(s)
                };
                assignment.insert(t, slot);
                active.push(t);
            }
        }

        for operand in block.instrs[idx].operands.iter_mut() {
            if let Operand::TempReg(t) = operand {
                *operand = match assignment[t] {
                    Slot::Reg(r) => Operand::RealReg(r),
                    Slot::Spill(s) => Operand::SpillNo(s),
                };
            }
        }

        let mut live_after = RegSet::empty();
        for t in &active {
            if last_use.get(t).copied().unwrap_or(idx) > idx {
                if let Some(Slot::Reg(r)) = assignment.get(t) {
                    live_after |= RegSet::of(*r);
                }
            }
        }
        block.instrs[idx].live_after = live_after;
    }

    AllocResult {
        spill_slots_used: next_spill_slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlagsRWU, JumpKind, OpSize, UInstr, UOpcode};

    #[test]
    fn temps_are_rewritten_to_real_regs_or_spills() {
        let mut block = UCodeBlock::default();
        // t0 = GET eax; t1 = GET ecx; ... ; PUT ebx, t0
        block.push(
            UInstr::new(UOpcode::Get, OpSize::Dword).with_operands([
                Operand::TempReg(TempId(0)),
                Operand::ArchReg(crate::ArchReg::Eax),
                Operand::NoValue,
            ]),
        );
        block.push(
            UInstr::new(UOpcode::Put, OpSize::Dword).with_operands([
                Operand::ArchReg(crate::ArchReg::Ebx),
                Operand::TempReg(TempId(0)),
                Operand::NoValue,
            ]),
        );
        block.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(0), Operand::NoValue, Operand::NoValue])
                .with_jump_kind(JumpKind::Boring)
                .with_flags(FlagsRWU::NONE),
        );

        let result = allocate(&mut block);
        assert_eq!(result.spill_slots_used, 0);
        match block.instrs[0].operands[0] {
            Operand::RealReg(_) => {}
            other => panic!("expected RealReg, got {other:?}"),
        }
    }

    #[test]
    fn more_than_six_live_temps_spill() {
        let mut block = UCodeBlock::default();
        for i in 0..8u32 {
            block.push(
                UInstr::new(UOpcode::Get, OpSize::Dword).with_operands([
                    Operand::TempReg(TempId(i)),
                    Operand::ArchReg(crate::ArchReg::Eax),
                    Operand::NoValue,
                ]),
            );
        }
        // All 8 temps used in one final instruction slot set (only 3
        // operand slots exist, so fold via repeated reads across synthetic
        // uses isn't representable directly; instead keep them all alive by
        // reusing the first three operand slots across several Mov ops).
        for i in 0..8u32 {
            block.push(
                UInstr::new(UOpcode::Mov, OpSize::Dword).with_operands([
                    Operand::TempReg(TempId(100 + i)),
                    Operand::TempReg(TempId(i)),
                    Operand::NoValue,
                ]),
            );
        }
        block.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(0), Operand::NoValue, Operand::NoValue])
                .with_jump_kind(JumpKind::Boring),
        );

        let result = allocate(&mut block);
        assert!(result.spill_slots_used >= 2, "expected spills beyond the 6 real regs");
    }
}
