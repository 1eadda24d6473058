//! x86 (32-bit) → UCode front-end decoder.
//!
//! Byte-level opcode/ModR/M/SIB recognition is delegated to `iced-x86`;
//! this crate's job is translating each recognized `iced_x86::Instruction`
//! into UCode ops with correct flag read/write/undef annotations, and
//! deciding where one guest basic block ends.

mod client_request;
mod lower;

use dynamo_types::GuestAddr;
use dynamo_ucode::{regalloc, UCodeBlock};
use iced_x86::{Decoder, DecoderOptions};
use thiserror::Error;

pub use client_request::is_client_request_prologue;

/// Upper bound on guest bytes translated into one gBB before the decoder
/// synthesizes a bounding `JMP`.
pub const MAX_GBB_BYTES: usize = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no bytes available to decode at guest pc {0:#x}")]
    EmptyInput(GuestAddr),
    #[error("internal: {0}")]
    Internal(&'static str),
}

/// Result of translating one guest basic block.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub ucode: UCodeBlock,
    /// Total guest bytes consumed by this gBB.
    pub orig_size: u32,
    pub spill_slots_used: u16,
}

/// Decodes and lowers one guest basic block starting at `pc`, then runs the
/// register allocator over the resulting `UCodeBlock`.
///
/// `bytes` must contain at least the gBB's worth of guest code (the caller
/// — normally the scheduler's `create_translation_for` — is responsible for
/// mapping enough guest memory that a short read never occurs mid-decode).
pub fn decode_block(pc: GuestAddr, bytes: &[u8]) -> Result<DecodedBlock, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput(pc));
    }

    let mut ctx = lower::LowerCtx::new(pc);

    if let Some(consumed) = client_request::is_client_request_prologue(bytes) {
        ctx.emit_inceip(consumed as u32);
        ctx.emit_client_request_jump(pc.wrapping_add(consumed as u32));
        let mut block = ctx.finish();
        let alloc = regalloc::allocate(&mut block);
        block.sanity_check().map_err(|_| DecodeError::Internal("client-request block"))?;
        return Ok(DecodedBlock {
            ucode: block,
            orig_size: consumed as u32,
            spill_slots_used: alloc.spill_slots_used,
        });
    }

    let window = &bytes[..bytes.len().min(MAX_GBB_BYTES + 32)];
    let mut decoder = Decoder::with_ip(32, window, pc as u64, DecoderOptions::NONE);
    let mut instruction = iced_x86::Instruction::default();

    loop {
        if !decoder.can_decode() {
            break;
        }
        if ctx.bytes_consumed() as usize >= MAX_GBB_BYTES {
            ctx.emit_boring_jmp_to(decoder.ip() as u32);
            break;
        }

        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            ctx.emit_undefined_instruction(instruction.len() as u32);
            break;
        }

        let ends_block = lower::lower_one(&mut ctx, &instruction);
        if ends_block {
            break;
        }
    }

    if !ctx.block_ends_in_jmp() {
        // Size threshold / ran out of input without a natural terminator:
        // synthesize the bounding unconditional JMP.
        ctx.emit_boring_jmp_to(pc.wrapping_add(ctx.bytes_consumed()));
    }

    let orig_size = ctx.bytes_consumed();
    let mut block = ctx.finish();
    let alloc = regalloc::allocate(&mut block);
    block
        .sanity_check()
        .map_err(|_| DecodeError::Internal("decoded block failed sanity check"))?;

    Ok(DecodedBlock {
        ucode: block,
        orig_size,
        spill_slots_used: alloc.spill_slots_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(decode_block(0x1000, &[]), Err(DecodeError::EmptyInput(0x1000)));
    }

    #[test]
    fn single_ret_decodes_to_one_block() {
        // C3 = ret
        let decoded = decode_block(0x1000, &[0xC3]).expect("decode");
        assert_eq!(decoded.orig_size, 1);
        assert!(decoded.ucode.sanity_check().is_ok());
        assert_eq!(
            decoded.ucode.instrs.last().unwrap().jump_kind,
            Some(dynamo_ucode::JumpKind::Return)
        );
    }

    #[test]
    fn mov_eax_imm32_then_ret() {
        // B8 78 56 34 12 = mov eax, 0x12345678 ; C3 = ret
        let bytes = [0xB8, 0x78, 0x56, 0x34, 0x12, 0xC3];
        let decoded = decode_block(0x1000, &bytes).expect("decode");
        assert_eq!(decoded.orig_size, 6);
        assert!(decoded.ucode.sanity_check().is_ok());
    }

    #[test]
    fn add_eax_ebx_sets_flags_and_ret() {
        // 01 D8 = add eax, ebx ; C3 = ret
        let bytes = [0x01, 0xD8, 0xC3];
        let decoded = decode_block(0x1000, &bytes).expect("decode");
        assert_eq!(decoded.orig_size, 3);
        let alu = decoded
            .ucode
            .instrs
            .iter()
            .find(|i| matches!(i.op, dynamo_ucode::UOpcode::Alu(dynamo_ucode::AluOp::Add)))
            .expect("add op present");
        assert!(!alu.flags.writes.is_empty());
    }

    #[test]
    fn unconditional_jmp_to_literal_ends_block() {
        // E9 00 00 00 00 = jmp rel32 (to next byte, i.e. pc+5+0)
        let bytes = [0xE9, 0x00, 0x00, 0x00, 0x00];
        let decoded = decode_block(0x2000, &bytes).expect("decode");
        assert_eq!(decoded.orig_size, 5);
        assert_eq!(
            decoded.ucode.instrs.last().unwrap().jump_kind,
            Some(dynamo_ucode::JumpKind::Boring)
        );
    }

    #[test]
    fn jcc_produces_two_exit_jmps() {
        // 74 02 = jz +2 ; then two NOPs as fallthrough filler, so decoding
        // has bytes to consume on the not-taken edge too.
        let bytes = [0x74, 0x02, 0x90, 0x90];
        let decoded = decode_block(0x3000, &bytes).expect("decode");
        let jmp_count = decoded
            .ucode
            .instrs
            .iter()
            .filter(|i| i.op == dynamo_ucode::UOpcode::Jmp)
            .count();
        assert_eq!(jmp_count, 2, "conditional + fallthrough unconditional jmp");
        assert!(decoded.ucode.sanity_check().is_ok());
    }

    #[test]
    fn int80_emits_syscall_jumpkind() {
        // CD 80 = int 0x80
        let bytes = [0xCD, 0x80];
        let decoded = decode_block(0x4000, &bytes).expect("decode");
        assert_eq!(
            decoded.ucode.instrs.last().unwrap().jump_kind,
            Some(dynamo_ucode::JumpKind::Syscall)
        );
    }

    #[test]
    fn unrecognized_opcode_synthesizes_undefined_instruction_helper() {
        // 0F 0B = UD2, always invalid-for-user-mode in our decoder's sense
        // here we just confirm a byte stream iced can't decode at all is
        // handled via the undefined-instruction path rather than a panic.
        let bytes = [0x0F, 0xFF, 0xFF];
        let decoded = decode_block(0x5000, &bytes).expect("decode");
        assert!(decoded.ucode.sanity_check().is_ok());
    }

    #[test]
    fn oversized_block_is_bounded() {
        let mut bytes = Vec::new();
        for _ in 0..(MAX_GBB_BYTES + 100) {
            bytes.push(0x90); // nop
        }
        let decoded = decode_block(0x6000, &bytes).expect("decode");
        assert!(decoded.orig_size as usize <= MAX_GBB_BYTES + 8);
    }
}
