//! Per-instruction lowering: one `iced_x86::Instruction` in, zero or more
//! `UInstr`s out.

use dynamo_types::GuestAddr;
use dynamo_ucode::{
    AluOp, ArchReg, CondCode, FlagsRWU, HelperId, JumpKind, OpSize, Operand, ShiftOp, TempId,
    UCodeBlock, UInstr, UOpcode,
};
use dynamo_types::EflagBits;
use iced_x86::{Instruction, Mnemonic, OpKind, Register};

pub struct LowerCtx {
    pc: GuestAddr,
    block: UCodeBlock,
    next_temp: u32,
    consumed: u32,
}

impl LowerCtx {
    pub fn new(pc: GuestAddr) -> Self {
        LowerCtx {
            pc,
            block: UCodeBlock::default(),
            next_temp: 0,
            consumed: 0,
        }
    }

    pub fn bytes_consumed(&self) -> u32 {
        self.consumed
    }

    pub fn block_ends_in_jmp(&self) -> bool {
        matches!(
            self.block.instrs.last(),
            Some(i) if i.op == UOpcode::Jmp && i.cond.is_none()
        )
    }

    pub fn finish(self) -> UCodeBlock {
        self.block
    }

    fn fresh(&mut self) -> TempId {
        let id = TempId(self.next_temp);
        self.next_temp += 1;
        id
    }

    fn push(&mut self, instr: UInstr) {
        self.block.push(instr);
    }

    pub fn emit_inceip(&mut self, len: u32) {
        self.push(
            UInstr::new(UOpcode::IncEip, OpSize::Dword).with_lit32(len),
        );
        self.consumed += len;
    }

    pub fn emit_boring_jmp_to(&mut self, target: GuestAddr) {
        self.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(target), Operand::NoValue, Operand::NoValue])
                .with_jump_kind(JumpKind::Boring),
        );
    }

    pub fn emit_client_request_jump(&mut self, eax_resume: GuestAddr) {
        self.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(eax_resume), Operand::NoValue, Operand::NoValue])
                .with_jump_kind(JumpKind::ClientReq),
        );
    }

    pub fn emit_undefined_instruction(&mut self, at_least_one_byte: u32) {
        let len = at_least_one_byte.max(1);
        let dst = self.fresh();
        self.push(
            UInstr::new(UOpcode::CCall, OpSize::Dword)
                .with_operands([Operand::TempReg(dst), Operand::NoValue, Operand::NoValue])
                .with_lit32(HelperId::UndefinedInstruction as u32),
        );
        self.emit_inceip(len);
        self.emit_boring_jmp_to(self.pc.wrapping_add(len));
    }

    fn emit_get(&mut self, reg: ArchReg, size: OpSize) -> TempId {
        let t = self.fresh();
        self.push(
            UInstr::new(UOpcode::Get, size)
                .with_operands([Operand::TempReg(t), Operand::ArchReg(reg), Operand::NoValue]),
        );
        t
    }

    fn emit_put(&mut self, reg: ArchReg, val: TempId, size: OpSize) {
        self.push(
            UInstr::new(UOpcode::Put, size)
                .with_operands([Operand::ArchReg(reg), Operand::TempReg(val), Operand::NoValue]),
        );
    }

    fn emit_mov_imm(&mut self, imm: u32, size: OpSize) -> TempId {
        let t = self.fresh();
        self.push(
            UInstr::new(UOpcode::Mov, size)
                .with_operands([Operand::TempReg(t), Operand::Literal(imm), Operand::NoValue]),
        );
        t
    }

    fn emit_load(&mut self, addr: TempId, size: OpSize) -> TempId {
        let t = self.fresh();
        self.push(
            UInstr::new(UOpcode::Load, size)
                .with_operands([Operand::TempReg(t), Operand::TempReg(addr), Operand::NoValue]),
        );
        t
    }

    fn emit_store(&mut self, addr: TempId, val: TempId, size: OpSize) {
        self.push(
            UInstr::new(UOpcode::Store, size)
                .with_operands([Operand::TempReg(addr), Operand::TempReg(val), Operand::NoValue]),
        );
    }

    fn emit_alu(&mut self, op: AluOp, dst: TempId, src: Operand, size: OpSize) {
        self.push(
            UInstr::new(UOpcode::Alu(op), size)
                .with_operands([Operand::TempReg(dst), src, Operand::NoValue])
                .with_flags(alu_flags(op)),
        );
    }

    fn emit_shift(&mut self, op: ShiftOp, dst: TempId, count: Operand, size: OpSize) {
        self.push(
            UInstr::new(UOpcode::Shift(op), size)
                .with_operands([Operand::TempReg(dst), count, Operand::NoValue])
                .with_flags(shift_flags()),
        );
    }

    fn emit_lea1(&mut self, base: Option<TempId>, disp: u32, size: OpSize) -> TempId {
        let dst = self.fresh();
        let base_op = match base {
            Some(t) => Operand::TempReg(t),
            None => Operand::Literal(0),
        };
        self.push(
            UInstr::new(UOpcode::Lea1, size)
                .with_operands([Operand::TempReg(dst), base_op, Operand::NoValue])
                .with_lit32(disp),
        );
        dst
    }

    fn emit_lea2(&mut self, base: TempId, scaled_index: TempId, disp: u32, size: OpSize) -> TempId {
        let dst = self.fresh();
        self.push(
            UInstr::new(UOpcode::Lea2, size)
                .with_operands([
                    Operand::TempReg(dst),
                    Operand::TempReg(base),
                    Operand::TempReg(scaled_index),
                ])
                .with_lit32(disp),
        );
        dst
    }

    fn emit_getseg(&mut self, selector_id: u32) -> TempId {
        let t = self.fresh();
        self.push(
            UInstr::new(UOpcode::GetSeg, OpSize::Dword)
                .with_operands([Operand::TempReg(t), Operand::Literal(selector_id), Operand::NoValue]),
        );
        t
    }

    fn emit_useseg(&mut self, addr: TempId, seg_base: TempId) {
        self.push(
            UInstr::new(UOpcode::UseSeg, OpSize::Dword)
                .with_operands([Operand::TempReg(addr), Operand::TempReg(seg_base), Operand::NoValue]),
        );
    }

    fn emit_ccall1(&mut self, helper: HelperId, arg: TempId) -> TempId {
        let dst = self.fresh();
        self.push(
            UInstr::new(UOpcode::CCall, OpSize::Dword)
                .with_operands([Operand::TempReg(dst), Operand::TempReg(arg), Operand::NoValue])
                .with_lit32(helper as u32),
        );
        dst
    }

    fn emit_ccall0(&mut self, helper: HelperId) -> TempId {
        let dst = self.fresh();
        self.push(
            UInstr::new(UOpcode::CCall, OpSize::Dword)
                .with_operands([Operand::TempReg(dst), Operand::NoValue, Operand::NoValue])
                .with_lit32(helper as u32),
        );
        dst
    }

    /// In-place `AND`/`OR`/`SHR`/`SHL` by a constant, used only to carve a
    /// sub-register view out of a full 32-bit fetch. Pushed with no
    /// `FlagsRWU` so this bookkeeping never clobbers EFLAGS the way the real
    /// guest ALU op it surrounds does.
    fn emit_mask(&mut self, val: TempId, mask: u32) {
        self.push(
            UInstr::new(UOpcode::Alu(AluOp::And), OpSize::Dword)
                .with_operands([Operand::TempReg(val), Operand::Literal(mask), Operand::NoValue]),
        );
    }

    fn emit_or_into(&mut self, dst: TempId, src: TempId) {
        self.push(
            UInstr::new(UOpcode::Alu(AluOp::Or), OpSize::Dword)
                .with_operands([Operand::TempReg(dst), Operand::TempReg(src), Operand::NoValue]),
        );
    }

    fn emit_shr_const(&mut self, val: TempId, amount: u32) {
        self.push(
            UInstr::new(UOpcode::Shift(ShiftOp::Shr), OpSize::Dword)
                .with_operands([Operand::TempReg(val), Operand::Literal(amount), Operand::NoValue]),
        );
    }

    fn emit_shl_const(&mut self, val: TempId, amount: u32) {
        self.push(
            UInstr::new(UOpcode::Shift(ShiftOp::Shl), OpSize::Dword)
                .with_operands([Operand::TempReg(val), Operand::Literal(amount), Operand::NoValue]),
        );
    }

    /// Fetches `reg` and narrows it to the sub-register `width` actually
    /// named by the guest operand (AL/AX vs EAX, AH's high-byte slice, ...).
    fn emit_get_width(&mut self, reg: ArchReg, width: SubWidth) -> TempId {
        let t = self.emit_get(reg, OpSize::Dword);
        match width {
            SubWidth::Full32 => {}
            SubWidth::Low16 => self.emit_mask(t, 0xFFFF),
            SubWidth::Low8 => self.emit_mask(t, 0xFF),
            SubWidth::High8 => {
                self.emit_shr_const(t, 8);
                self.emit_mask(t, 0xFF);
            }
        }
        t
    }

    /// Writes `val` back into the `width` slice of `reg`, read-modify-write
    /// so the untouched bits of the full register survive (`mov al, ...`
    /// must not disturb AH/the top 24 bits of EAX).
    fn emit_put_width(&mut self, reg: ArchReg, width: SubWidth, val: TempId) {
        match width {
            SubWidth::Full32 => self.emit_put(reg, val, OpSize::Dword),
            SubWidth::Low16 => {
                let old = self.emit_get(reg, OpSize::Dword);
                self.emit_mask(old, 0xFFFF_0000);
                self.emit_mask(val, 0xFFFF);
                self.emit_or_into(old, val);
                self.emit_put(reg, old, OpSize::Dword);
            }
            SubWidth::Low8 => {
                let old = self.emit_get(reg, OpSize::Dword);
                self.emit_mask(old, 0xFFFF_FF00);
                self.emit_mask(val, 0xFF);
                self.emit_or_into(old, val);
                self.emit_put(reg, old, OpSize::Dword);
            }
            SubWidth::High8 => {
                let old = self.emit_get(reg, OpSize::Dword);
                self.emit_mask(old, 0xFFFF_00FF);
                self.emit_mask(val, 0xFF);
                self.emit_shl_const(val, 8);
                self.emit_or_into(old, val);
                self.emit_put(reg, old, OpSize::Dword);
            }
        }
    }
}

fn alu_flags(op: AluOp) -> FlagsRWU {
    use AluOp::*;
    match op {
        Add | Sub => FlagsRWU {
            reads: EflagBits::empty(),
            writes: EflagBits::CF | EflagBits::PF | EflagBits::AF | EflagBits::ZF | EflagBits::SF | EflagBits::OF,
            undef: EflagBits::empty(),
        },
        Adc | Sbb => FlagsRWU {
            reads: EflagBits::CF,
            writes: EflagBits::CF | EflagBits::PF | EflagBits::AF | EflagBits::ZF | EflagBits::SF | EflagBits::OF,
            undef: EflagBits::empty(),
        },
        And | Or | Xor | Test => FlagsRWU {
            reads: EflagBits::empty(),
            writes: EflagBits::CF | EflagBits::PF | EflagBits::ZF | EflagBits::SF | EflagBits::OF,
            undef: EflagBits::AF,
        },
        Cmp => FlagsRWU {
            reads: EflagBits::empty(),
            writes: EflagBits::CF | EflagBits::PF | EflagBits::AF | EflagBits::ZF | EflagBits::SF | EflagBits::OF,
            undef: EflagBits::empty(),
        },
        Not => FlagsRWU::NONE,
        Neg => FlagsRWU {
            reads: EflagBits::empty(),
            writes: EflagBits::CF | EflagBits::PF | EflagBits::AF | EflagBits::ZF | EflagBits::SF | EflagBits::OF,
            undef: EflagBits::empty(),
        },
        Mul | IMul | Div | IDiv => FlagsRWU {
            reads: EflagBits::empty(),
            writes: EflagBits::CF | EflagBits::OF,
            undef: EflagBits::PF | EflagBits::AF | EflagBits::ZF | EflagBits::SF,
        },
    }
}

fn shift_flags() -> FlagsRWU {
    FlagsRWU {
        reads: EflagBits::empty(),
        writes: EflagBits::CF | EflagBits::OF,
        undef: EflagBits::AF,
    }
}

fn arch_gpr(reg: Register) -> Option<ArchReg> {
    Some(match reg {
        Register::EAX => ArchReg::Eax,
        Register::ECX => ArchReg::Ecx,
        Register::EDX => ArchReg::Edx,
        Register::EBX => ArchReg::Ebx,
        Register::ESP => ArchReg::Esp,
        Register::EBP => ArchReg::Ebp,
        Register::ESI => ArchReg::Esi,
        Register::EDI => ArchReg::Edi,
        _ => return None,
    })
}

/// Which slice of its owning 32-bit register a GPR operand names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubWidth {
    Full32,
    Low16,
    Low8,
    High8,
}

/// Maps every x86-32 legacy GPR form — 32-, 16-, and 8-bit, including the
/// high-byte AH/CH/DH/BH quartet with no 64-bit-mode equivalent — onto the
/// `ArchReg` it shares storage with plus which slice is being named.
/// `None` means the operand is a `Register` kind this decoder doesn't model
/// as integer-GPR state at all (segment/control/debug registers); callers
/// treat that the same as any other unsupported operand, not as a panic.
fn arch_gpr_sized(reg: Register) -> Option<(ArchReg, SubWidth)> {
    use Register::*;
    Some(match reg {
        EAX => (ArchReg::Eax, SubWidth::Full32),
        AX => (ArchReg::Eax, SubWidth::Low16),
        AL => (ArchReg::Eax, SubWidth::Low8),
        AH => (ArchReg::Eax, SubWidth::High8),
        ECX => (ArchReg::Ecx, SubWidth::Full32),
        CX => (ArchReg::Ecx, SubWidth::Low16),
        CL => (ArchReg::Ecx, SubWidth::Low8),
        CH => (ArchReg::Ecx, SubWidth::High8),
        EDX => (ArchReg::Edx, SubWidth::Full32),
        DX => (ArchReg::Edx, SubWidth::Low16),
        DL => (ArchReg::Edx, SubWidth::Low8),
        DH => (ArchReg::Edx, SubWidth::High8),
        EBX => (ArchReg::Ebx, SubWidth::Full32),
        BX => (ArchReg::Ebx, SubWidth::Low16),
        BL => (ArchReg::Ebx, SubWidth::Low8),
        BH => (ArchReg::Ebx, SubWidth::High8),
        ESP => (ArchReg::Esp, SubWidth::Full32),
        SP => (ArchReg::Esp, SubWidth::Low16),
        EBP => (ArchReg::Ebp, SubWidth::Full32),
        BP => (ArchReg::Ebp, SubWidth::Low16),
        ESI => (ArchReg::Esi, SubWidth::Full32),
        SI => (ArchReg::Esi, SubWidth::Low16),
        EDI => (ArchReg::Edi, SubWidth::Full32),
        DI => (ArchReg::Edi, SubWidth::Low16),
        _ => return None,
    })
}

fn segment_id(reg: Register) -> u32 {
    match reg {
        Register::ES => 0,
        Register::CS => 1,
        Register::SS => 2,
        Register::DS => 3,
        Register::FS => 4,
        Register::GS => 5,
        _ => 3, // default to DS
    }
}

/// Computes the effective address of a memory operand into a fresh temp,
/// applying a segment override via GETSEG/USESEG when the instruction
/// carries an explicit segment prefix.
fn compute_address(ctx: &mut LowerCtx, ins: &Instruction) -> TempId {
    let base = ins.memory_base();
    let index = ins.memory_index();
    let scale = ins.memory_index_scale();
    let disp = ins.memory_displacement32();

    let base_temp = arch_gpr(base).map(|r| ctx.emit_get(r, OpSize::Dword));

    let addr = if index != Register::None {
        let index_temp = arch_gpr(index)
            .map(|r| ctx.emit_get(r, OpSize::Dword))
            .expect("memory index must be a GPR");
        let scaled = if scale > 1 {
            let shift = scale.trailing_zeros();
            ctx.emit_shift(
                ShiftOp::Shl,
                index_temp,
                Operand::Literal(shift),
                OpSize::Dword,
            );
            index_temp
        } else {
            index_temp
        };
        match base_temp {
            Some(b) => ctx.emit_lea2(b, scaled, disp, OpSize::Dword),
            None => ctx.emit_lea1(Some(scaled), disp, OpSize::Dword),
        }
    } else {
        ctx.emit_lea1(base_temp, disp, OpSize::Dword)
    };

    let seg_prefix = ins.segment_prefix();
    if seg_prefix != Register::None {
        let seg_base = ctx.emit_getseg(segment_id(seg_prefix));
        ctx.emit_useseg(addr, seg_base);
    }
    addr
}

fn read_operand(ctx: &mut LowerCtx, ins: &Instruction, idx: u32, size: OpSize) -> (TempId, Option<TempId>) {
    match ins.op_kind(idx) {
        OpKind::Register => {
            let t = match arch_gpr_sized(ins.op_register(idx)) {
                Some((reg, width)) => ctx.emit_get_width(reg, width),
                // Segment/control/debug registers and anything else iced can
                // report in a `Register` operand slot but that this decoder
                // doesn't model as integer-GPR state: read as zero rather
                // than panic the whole framework over one operand.
                None => ctx.emit_mov_imm(0, size),
            };
            (t, None)
        }
        OpKind::Memory => {
            let addr = compute_address(ctx, ins);
            (ctx.emit_load(addr, size), Some(addr))
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => {
            let imm = ins.immediate(idx) as u32;
            (ctx.emit_mov_imm(imm, size), None)
        }
        _ => (ctx.emit_mov_imm(0, size), None),
    }
}

fn write_back(ctx: &mut LowerCtx, ins: &Instruction, idx: u32, addr: Option<TempId>, val: TempId, size: OpSize) {
    match ins.op_kind(idx) {
        OpKind::Register => match arch_gpr_sized(ins.op_register(idx)) {
            Some((reg, width)) => ctx.emit_put_width(reg, width, val),
            // Same unsupported-register case as `read_operand`: drop the
            // write instead of panicking.
            None => {}
        },
        OpKind::Memory => {
            let addr = addr.expect("memory operand must have a precomputed address");
            ctx.emit_store(addr, val, size);
        }
        _ => {}
    }
}

fn jcc_cond(mnemonic: Mnemonic) -> Option<CondCode> {
    use Mnemonic::*;
    Some(match mnemonic {
        Jo => CondCode::O,
        Jno => CondCode::No,
        Jb => CondCode::B,
        Jae => CondCode::Nb,
        Je => CondCode::Z,
        Jne => CondCode::Nz,
        Jbe => CondCode::Be,
        Ja => CondCode::Nbe,
        Js => CondCode::S,
        Jns => CondCode::Ns,
        Jp => CondCode::P,
        Jnp => CondCode::Np,
        Jl => CondCode::L,
        Jge => CondCode::Nl,
        Jle => CondCode::Le,
        Jg => CondCode::Nle,
        _ => return None,
    })
}

/// Lowers one instruction into zero or more UInstrs. Returns `true` when the
/// gBB ends here.
pub fn lower_one(ctx: &mut LowerCtx, ins: &Instruction) -> bool {
    let len = ins.len() as u32;

    if let Some(cond) = jcc_cond(ins.mnemonic()) {
        let taken = ins.near_branch_target() as u32;
        ctx.emit_inceip(len);
        let fallthrough = ctx.pc_after(len);
        ctx.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(taken), Operand::NoValue, Operand::NoValue])
                .with_cond(cond)
                .with_jump_kind(JumpKind::Boring),
        );
        ctx.emit_boring_jmp_to(fallthrough);
        return true;
    }

    match ins.mnemonic() {
        Mnemonic::Nop => {
            ctx.emit_inceip(len);
            false
        }
        Mnemonic::Mov => {
            ctx.emit_inceip(len);
            let (src, _) = read_operand(ctx, ins, 1, OpSize::Dword);
            match ins.op0_kind() {
                OpKind::Memory => {
                    let addr = compute_address(ctx, ins);
                    ctx.emit_store(addr, src, OpSize::Dword);
                }
                _ => write_back(ctx, ins, 0, None, src, OpSize::Dword),
            }
            false
        }
        Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor
        | Mnemonic::Adc | Mnemonic::Sbb => {
            ctx.emit_inceip(len);
            let op = match ins.mnemonic() {
                Mnemonic::Add => AluOp::Add,
                Mnemonic::Sub => AluOp::Sub,
                Mnemonic::And => AluOp::And,
                Mnemonic::Or => AluOp::Or,
                Mnemonic::Xor => AluOp::Xor,
                Mnemonic::Adc => AluOp::Adc,
                Mnemonic::Sbb => AluOp::Sbb,
                _ => unreachable!(),
            };
            let addr = if ins.op0_kind() == OpKind::Memory {
                Some(compute_address(ctx, ins))
            } else {
                None
            };
            let dst = match ins.op0_kind() {
                OpKind::Memory => ctx.emit_load(addr.unwrap(), OpSize::Dword),
                _ => read_operand(ctx, ins, 0, OpSize::Dword).0,
            };
            let (src, _) = read_operand(ctx, ins, 1, OpSize::Dword);
            ctx.emit_alu(op, dst, Operand::TempReg(src), OpSize::Dword);
            write_back(ctx, ins, 0, addr, dst, OpSize::Dword);
            false
        }
        Mnemonic::Cmp | Mnemonic::Test => {
            ctx.emit_inceip(len);
            let op = if ins.mnemonic() == Mnemonic::Cmp {
                AluOp::Cmp
            } else {
                AluOp::Test
            };
            let (dst, _) = read_operand(ctx, ins, 0, OpSize::Dword);
            let (src, _) = read_operand(ctx, ins, 1, OpSize::Dword);
            ctx.emit_alu(op, dst, Operand::TempReg(src), OpSize::Dword);
            false
        }
        Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Not | Mnemonic::Neg => {
            ctx.emit_inceip(len);
            let addr = if ins.op0_kind() == OpKind::Memory {
                Some(compute_address(ctx, ins))
            } else {
                None
            };
            let val = match ins.op0_kind() {
                OpKind::Memory => ctx.emit_load(addr.unwrap(), OpSize::Dword),
                _ => read_operand(ctx, ins, 0, OpSize::Dword).0,
            };
            let op = match ins.mnemonic() {
                Mnemonic::Inc => AluOp::Add,
                Mnemonic::Dec => AluOp::Sub,
                Mnemonic::Not => AluOp::Not,
                Mnemonic::Neg => AluOp::Neg,
                _ => unreachable!(),
            };
            let src = if matches!(op, AluOp::Add | AluOp::Sub) {
                Operand::Literal(1)
            } else {
                Operand::NoValue
            };
            ctx.emit_alu(op, val, src, OpSize::Dword);
            write_back(ctx, ins, 0, addr, val, OpSize::Dword);
            false
        }
        Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar | Mnemonic::Rol | Mnemonic::Ror => {
            ctx.emit_inceip(len);
            let op = match ins.mnemonic() {
                Mnemonic::Shl => ShiftOp::Shl,
                Mnemonic::Shr => ShiftOp::Shr,
                Mnemonic::Sar => ShiftOp::Sar,
                Mnemonic::Rol => ShiftOp::Rol,
                Mnemonic::Ror => ShiftOp::Ror,
                _ => unreachable!(),
            };
            let addr = if ins.op0_kind() == OpKind::Memory {
                Some(compute_address(ctx, ins))
            } else {
                None
            };
            let val = match ins.op0_kind() {
                OpKind::Memory => ctx.emit_load(addr.unwrap(), OpSize::Dword),
                _ => read_operand(ctx, ins, 0, OpSize::Dword).0,
            };
            let count = match ins.op1_kind() {
                OpKind::Immediate8 => Operand::Literal(ins.immediate(1) as u32),
                OpKind::Register if ins.op1_register() == Register::CL => {
                    let (t, _) = read_operand(ctx, ins, 1, OpSize::Byte);
                    Operand::TempReg(t)
                }
                _ => Operand::Literal(1),
            };
            ctx.emit_shift(op, val, count, OpSize::Dword);
            write_back(ctx, ins, 0, addr, val, OpSize::Dword);
            false
        }
        Mnemonic::Lea => {
            ctx.emit_inceip(len);
            let addr = compute_address(ctx, ins);
            write_back(ctx, ins, 0, None, addr, OpSize::Dword);
            false
        }
        Mnemonic::Push => {
            ctx.emit_inceip(len);
            let (val, _) = read_operand(ctx, ins, 0, OpSize::Dword);
            let esp = ctx.emit_get(ArchReg::Esp, OpSize::Dword);
            ctx.emit_alu(AluOp::Sub, esp, Operand::Literal(4), OpSize::Dword);
            ctx.emit_put(ArchReg::Esp, esp, OpSize::Dword);
            ctx.emit_store(esp, val, OpSize::Dword);
            false
        }
        Mnemonic::Pop => {
            ctx.emit_inceip(len);
            let esp = ctx.emit_get(ArchReg::Esp, OpSize::Dword);
            let val = ctx.emit_load(esp, OpSize::Dword);
            ctx.emit_alu(AluOp::Add, esp, Operand::Literal(4), OpSize::Dword);
            ctx.emit_put(ArchReg::Esp, esp, OpSize::Dword);
            write_back(ctx, ins, 0, None, val, OpSize::Dword);
            false
        }
        Mnemonic::Jmp => {
            ctx.emit_inceip(len);
            match ins.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    ctx.emit_boring_jmp_to(ins.near_branch_target() as u32);
                }
                _ => {
                    let (target, _) = read_operand(ctx, ins, 0, OpSize::Dword);
                    ctx.push(
                        UInstr::new(UOpcode::Jmp, OpSize::Dword)
                            .with_operands([Operand::TempReg(target), Operand::NoValue, Operand::NoValue])
                            .with_jump_kind(JumpKind::Boring),
                    );
                }
            }
            true
        }
        Mnemonic::Call => {
            ctx.emit_inceip(len);
            let ret_addr = ctx.pc_after(0);
            let ret_temp = ctx.emit_mov_imm(ret_addr, OpSize::Dword);
            let esp = ctx.emit_get(ArchReg::Esp, OpSize::Dword);
            ctx.emit_alu(AluOp::Sub, esp, Operand::Literal(4), OpSize::Dword);
            ctx.emit_put(ArchReg::Esp, esp, OpSize::Dword);
            ctx.emit_store(esp, ret_temp, OpSize::Dword);
            match ins.op0_kind() {
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    ctx.push(
                        UInstr::new(UOpcode::Jmp, OpSize::Dword)
                            .with_operands([
                                Operand::Literal(ins.near_branch_target() as u32),
                                Operand::NoValue,
                                Operand::NoValue,
                            ])
                            .with_jump_kind(JumpKind::Call),
                    );
                }
                _ => {
                    let (target, _) = read_operand(ctx, ins, 0, OpSize::Dword);
                    ctx.push(
                        UInstr::new(UOpcode::Jmp, OpSize::Dword)
                            .with_operands([Operand::TempReg(target), Operand::NoValue, Operand::NoValue])
                            .with_jump_kind(JumpKind::Call),
                    );
                }
            }
            true
        }
        Mnemonic::Ret | Mnemonic::Retf => {
            ctx.emit_inceip(len);
            let esp = ctx.emit_get(ArchReg::Esp, OpSize::Dword);
            let target = ctx.emit_load(esp, OpSize::Dword);
            ctx.emit_alu(AluOp::Add, esp, Operand::Literal(4), OpSize::Dword);
            ctx.emit_put(ArchReg::Esp, esp, OpSize::Dword);
            ctx.push(
                UInstr::new(UOpcode::Jmp, OpSize::Dword)
                    .with_operands([Operand::TempReg(target), Operand::NoValue, Operand::NoValue])
                    .with_jump_kind(JumpKind::Return),
            );
            true
        }
        Mnemonic::Int => {
            ctx.emit_inceip(len);
            ctx.emit_boring_jmp_to_syscall();
            true
        }
        Mnemonic::Cld => {
            ctx.emit_inceip(len);
            ctx.push(
                UInstr::new(UOpcode::PutF, OpSize::Dword).with_operands([
                    Operand::Literal(EflagBits::DF.bits()),
                    Operand::Literal(0),
                    Operand::NoValue,
                ]),
            );
            false
        }
        Mnemonic::Std => {
            ctx.emit_inceip(len);
            ctx.push(
                UInstr::new(UOpcode::PutF, OpSize::Dword).with_operands([
                    Operand::Literal(EflagBits::DF.bits()),
                    Operand::Literal(EflagBits::DF.bits()),
                    Operand::NoValue,
                ]),
            );
            false
        }
        Mnemonic::Cpuid => {
            ctx.emit_inceip(len);
            ctx.emit_ccall0(HelperId::Cpuid);
            false
        }
        Mnemonic::Rdtsc => {
            ctx.emit_inceip(len);
            ctx.emit_ccall0(HelperId::Rdtsc);
            false
        }
        Mnemonic::Mul | Mnemonic::Imul | Mnemonic::Div | Mnemonic::Idiv => {
            ctx.emit_inceip(len);
            let helper = match ins.mnemonic() {
                Mnemonic::Mul => HelperId::MulWideU32,
                Mnemonic::Imul => HelperId::MulWideS32,
                Mnemonic::Div => HelperId::DivU32,
                Mnemonic::Idiv => HelperId::DivS32,
                _ => unreachable!(),
            };
            let (arg, _) = read_operand(ctx, ins, 0, OpSize::Dword);
            ctx.emit_ccall1(helper, arg);
            false
        }
        Mnemonic::Movsb | Mnemonic::Movsd if ins.has_rep_prefix() => {
            ctx.emit_inceip(len);
            let ecx = ctx.emit_get(ArchReg::Ecx, OpSize::Dword);
            ctx.emit_ccall1(HelperId::StringRepMovs, ecx);
            false
        }
        Mnemonic::Stosb | Mnemonic::Stosd if ins.has_rep_prefix() => {
            ctx.emit_inceip(len);
            let ecx = ctx.emit_get(ArchReg::Ecx, OpSize::Dword);
            ctx.emit_ccall1(HelperId::StringRepStos, ecx);
            false
        }
        _ => {
            // Recognized by iced but not translated yet: treat as an
            // unrecognized opcode.
            ctx.emit_undefined_instruction(len);
            true
        }
    }
}

impl LowerCtx {
    fn pc_after(&self, extra: u32) -> GuestAddr {
        self.pc.wrapping_add(self.consumed).wrapping_add(extra)
    }

    fn emit_boring_jmp_to_syscall(&mut self) {
        let target = self.pc_after(0);
        self.push(
            UInstr::new(UOpcode::Jmp, OpSize::Dword)
                .with_operands([Operand::Literal(target), Operand::NoValue, Operand::NoValue])
                .with_jump_kind(JumpKind::Syscall),
        );
    }
}
