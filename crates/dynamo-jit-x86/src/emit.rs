//! Raw x86-32 byte emission primitives. The generated code always addresses
//! the base block through `%ebp`:
//! `%ebp` is loaded with a pointer to the `BaseBlock` once by the dispatcher
//! before calling into a compiled host basic block and is never otherwise
//! touched by generated code.

use dynamo_cpu_core::trace_cache::PatchSite;
use dynamo_types::GuestAddr;
use dynamo_ucode::{AluOp, RealReg, ShiftOp};

fn reg_code(r: RealReg) -> u8 {
    match r {
        RealReg::Eax => 0,
        RealReg::Ecx => 1,
        RealReg::Edx => 2,
        RealReg::Ebx => 3,
        RealReg::Esi => 6,
        RealReg::Edi => 7,
    }
}

fn modrm(mod_bits: u8, reg: u8, rm: u8) -> u8 {
    (mod_bits << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
}

/// `[%ebp + disp]`. `%ebp` (rm=101) cannot use `mod=00` in x86's ModR/M
/// encoding (that combination means "disp32, no base"), so a zero
/// displacement still costs a disp8 byte.
fn membase_bytes(reg_field: u8, disp: i32) -> Vec<u8> {
    if let Ok(d8) = i8::try_from(disp) {
        vec![modrm(0b01, reg_field, 0b101), d8 as u8]
    } else {
        let mut v = vec![modrm(0b10, reg_field, 0b101)];
        v.extend_from_slice(&disp.to_le_bytes());
        v
    }
}

fn alu_digit(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0,
        AluOp::Or => 1,
        AluOp::Adc => 2,
        AluOp::Sbb => 3,
        AluOp::And => 4,
        AluOp::Sub => 5,
        AluOp::Xor => 6,
        AluOp::Cmp => 7,
        AluOp::Test => 0, // test uses its own opcode family; digit unused.
        AluOp::Not => 2,
        AluOp::Neg => 3,
        AluOp::Mul | AluOp::IMul | AluOp::Div | AluOp::IDiv => {
            unreachable!("wide multiply/divide are lowered through helper calls, not ALU opcodes")
        }
    }
}

fn alu_reg_reg_opcode(op: AluOp) -> u8 {
    match op {
        AluOp::Add => 0x01,
        AluOp::Or => 0x09,
        AluOp::Adc => 0x11,
        AluOp::Sbb => 0x19,
        AluOp::And => 0x21,
        AluOp::Sub => 0x29,
        AluOp::Xor => 0x31,
        AluOp::Cmp => 0x39,
        AluOp::Test => 0x85,
        _ => unreachable!("unary/wide ops have no r/m,r form"),
    }
}

fn shift_digit(op: ShiftOp) -> u8 {
    match op {
        ShiftOp::Rol => 0,
        ShiftOp::Ror => 1,
        ShiftOp::Rcl => 2,
        ShiftOp::Rcr => 3,
        ShiftOp::Shl => 4,
        ShiftOp::Shr => 5,
        ShiftOp::Sar => 7,
    }
}

pub struct Emitter {
    buf: Vec<u8>,
    pub patch_sites: Vec<PatchSite>,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter {
            buf: Vec::with_capacity(256),
            patch_sites: Vec::new(),
        }
    }

    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> (Vec<u8>, Vec<PatchSite>) {
        (self.buf, self.patch_sites)
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn mov_reg_imm32(&mut self, dst: RealReg, imm: u32) {
        self.push(&[0xB8 + reg_code(dst)]);
        self.push(&imm.to_le_bytes());
    }

    /// Like [`Self::mov_reg_imm32`] but records the 4 immediate bytes as a
    /// chain-able exit: `dynamo-sched` may later overwrite this instruction
    /// in place with a `jmp rel32` into `target`'s compiled code once it
    /// exists. Both forms are 5 bytes.
    pub fn mov_reg_imm32_chainable(&mut self, dst: RealReg, target: GuestAddr) {
        let offset = self.offset();
        self.mov_reg_imm32(dst, target);
        self.patch_sites.push(PatchSite {
            offset,
            target_pc: target,
        });
    }

    pub fn mov_reg_membase(&mut self, dst: RealReg, disp: i32) {
        self.push(&[0x8B]);
        self.push(&membase_bytes(reg_code(dst), disp));
    }

    pub fn mov_membase_reg(&mut self, disp: i32, src: RealReg) {
        self.push(&[0x89]);
        self.push(&membase_bytes(reg_code(src), disp));
    }

    pub fn mov_reg_reg(&mut self, dst: RealReg, src: RealReg) {
        self.push(&[0x89, modrm(0b11, reg_code(src), reg_code(dst))]);
    }

    /// `mov dst, [addr]` — `addr` holds an absolute host pointer, not a
    /// `%ebp`-relative displacement. Sound
    /// for every `RealReg` because none of them encode to 4 (`%esp`) or 5
    /// (`%ebp`), the two rm codes that need a SIB byte or disp32 at `mod=00`.
    pub fn mov_reg_indirect(&mut self, dst: RealReg, addr: RealReg) {
        self.push(&[0x8B, modrm(0b00, reg_code(dst), reg_code(addr))]);
    }

    pub fn mov_indirect_reg(&mut self, addr: RealReg, src: RealReg) {
        self.push(&[0x89, modrm(0b00, reg_code(src), reg_code(addr))]);
    }

    pub fn alu_reg_reg(&mut self, op: AluOp, dst: RealReg, src: RealReg) {
        self.push(&[alu_reg_reg_opcode(op), modrm(0b11, reg_code(src), reg_code(dst))]);
    }

    pub fn alu_reg_imm32(&mut self, op: AluOp, dst: RealReg, imm: u32) {
        if matches!(op, AluOp::Test) {
            self.push(&[0xF7, modrm(0b11, 0, reg_code(dst))]);
        } else {
            self.push(&[0x81, modrm(0b11, alu_digit(op), reg_code(dst))]);
        }
        self.push(&imm.to_le_bytes());
    }

    pub fn not_reg(&mut self, dst: RealReg) {
        self.push(&[0xF7, modrm(0b11, alu_digit(AluOp::Not), reg_code(dst))]);
    }

    pub fn neg_reg(&mut self, dst: RealReg) {
        self.push(&[0xF7, modrm(0b11, alu_digit(AluOp::Neg), reg_code(dst))]);
    }

    pub fn shift_reg_imm8(&mut self, op: ShiftOp, dst: RealReg, amount: u8) {
        self.push(&[0xC1, modrm(0b11, shift_digit(op), reg_code(dst)), amount]);
    }

    /// Shift count taken from `%cl` (x86's only register-operand shift
    /// form).
    pub fn shift_reg_cl(&mut self, op: ShiftOp, dst: RealReg) {
        self.push(&[0xD3, modrm(0b11, shift_digit(op), reg_code(dst))]);
    }

    pub fn pushf(&mut self) {
        self.push(&[0x9C]);
    }

    pub fn popf(&mut self) {
        self.push(&[0x9D]);
    }

    pub fn push_reg(&mut self, r: RealReg) {
        self.push(&[0x50 + reg_code(r)]);
    }

    pub fn pop_reg(&mut self, r: RealReg) {
        self.push(&[0x58 + reg_code(r)]);
    }

    pub fn ret(&mut self) {
        self.push(&[0xC3]);
    }

    /// `call r/m32` — indirect call through a register.
    pub fn call_indirect_reg(&mut self, target: RealReg) {
        self.push(&[0xFF, modrm(0b11, 2, reg_code(target))]);
    }

    /// `call [%ebp+disp]` — indirects through a base-block-resident helper
    /// slot rather than baking an address into the generated code, so a
    /// tool's registered helper (or a core one, reseated at process start)
    /// can be called without retranslating every site that calls it.
    pub fn call_membase(&mut self, disp: i32) {
        self.push(&[0xFF]);
        self.push(&membase_bytes(2, disp));
    }

    #[cfg(test)]
    fn nop_pad(&mut self, n: usize) {
        self.push(&vec![0x90; n]);
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces the bytes to overwrite a [`Emitter::mov_reg_imm32_chainable`]
/// site with, once the destination block's host address is known: a direct
/// `jmp rel32`. Both forms are exactly 5 bytes, so the patch never disturbs
/// surrounding code; the original `mov`+store+`ret` tail that followed
/// becomes dead bytes in the buffer.
pub fn encode_chain_jmp(patch_site_host_addr: *const u8, target_host_addr: *const u8) -> Vec<u8> {
    let rel = (target_host_addr as isize) - (patch_site_host_addr as isize) - 5;
    let mut bytes = vec![0xE9];
    bytes.extend_from_slice(&(rel as i32).to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_reg_imm32_is_five_bytes() {
        let mut e = Emitter::new();
        e.mov_reg_imm32(RealReg::Eax, 0x1234);
        let (code, _) = e.finish();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0], 0xB8);
    }

    #[test]
    fn chainable_mov_records_a_patch_site_at_its_own_offset() {
        let mut e = Emitter::new();
        e.nop_pad(2);
        e.mov_reg_imm32_chainable(RealReg::Eax, 0x2000);
        let (_, sites) = e.finish();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].offset, 2);
        assert_eq!(sites[0].target_pc, 0x2000);
    }

    #[test]
    fn chain_jmp_encoding_is_five_bytes_like_the_mov_it_replaces() {
        let base = 0x1000 as *const u8;
        let target = 0x2000 as *const u8;
        let bytes = encode_chain_jmp(base, target);
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[0], 0xE9);
    }

    #[test]
    fn membase_encoding_always_escapes_ebp_rm_with_a_displacement() {
        let mut e = Emitter::new();
        e.mov_reg_membase(RealReg::Eax, 0);
        let (code, _) = e.finish();
        // mod bits must not be 0b00 when rm selects %ebp.
        assert_ne!(code[1] >> 6, 0b00);
    }
}
