//! Instruction relocation into trampoline chunks
//!
//! Copies the prologue of a hooked function into a chunk's code buffer,
//! rewriting every instruction that references an address relative to its
//! own location:
//! - relative branches and calls are re-biased for the new location
//! - short forms that can no longer reach are widened to near-32-bit forms
//! - `JCXZ`/`JECXZ`/`JRCXZ` and `LOOP`-family branches, which only exist as
//!   short forms, become a three-instruction hop sequence
//! - RIP-relative memory operands get their displacement re-encoded
//! - targets beyond rel32 reach fall back to an indirect absolute branch
//!   through the chunk's literal slot

use crate::arch::{self, MAX_CODE_SIZE, SIZEOF_RELATIVE_JUMP};
#[cfg(target_arch = "x86_64")]
use crate::arch::SIZEOF_ABSOLUTE_JUMP;
use crate::asm::decoder::{DecodedInstruction, InstructionDecoder, MnemonicClass};
use crate::error::{Error, Result};
use crate::trampoline::chunk::TrampolineChunk;
use crate::trampoline::TrampolineFlags;

/// how much of the original function a relocation pass consumed and produced
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelocatedPrologue {
    /// bytes consumed from the original function
    pub bytes_read: usize,
    /// bytes emitted into the chunk's code buffer
    pub bytes_written: usize,
}

/// relocate at least `min_bytes` of the function at `target` into the
/// chunk's code buffer, recording every instruction in the translation map
///
/// stops early after an unconditional jump: control flow never returns, so
/// the bytes behind it may not be code at all
pub(crate) fn relocate_prologue(
    chunk: &mut TrampolineChunk,
    target: usize,
    min_bytes: usize,
    max_read: usize,
    flags: TrampolineFlags,
) -> Result<RelocatedPrologue> {
    debug_assert!(min_bytes >= 1);
    debug_assert!(min_bytes <= max_read);

    // SAFETY: the caller probed [target, target + max_read) as readable
    let source = unsafe { core::slice::from_raw_parts(target as *const u8, max_read) };

    let decoder = InstructionDecoder::native();
    let mut bytes_read = 0;
    let mut bytes_written = 0;

    while bytes_read < min_bytes {
        // room for one more maximum-length instruction and one more map item
        debug_assert!(bytes_written < MAX_CODE_SIZE);
        debug_assert!(!chunk.translation_map.is_full());

        let instruction = decoder.decode_at(target + bytes_read, &source[bytes_read..])?;
        let original = &source[bytes_read..bytes_read + instruction.length];

        let emitted = if instruction.is_relative {
            rewrite_relative(chunk, &instruction, original, bytes_written, flags)?
        } else {
            chunk.code_buffer[bytes_written..bytes_written + instruction.length]
                .copy_from_slice(original);
            instruction.length
        };

        chunk
            .translation_map
            .push(bytes_read as u8, bytes_written as u8);
        bytes_read += instruction.length;
        bytes_written += emitted;

        if instruction.class == MnemonicClass::Jmp {
            break;
        }
    }

    Ok(RelocatedPrologue {
        bytes_read,
        bytes_written,
    })
}

fn rewrite_relative(
    chunk: &mut TrampolineChunk,
    instruction: &DecodedInstruction,
    original: &[u8],
    offset: usize,
    flags: TrampolineFlags,
) -> Result<usize> {
    match instruction.class {
        MnemonicClass::Call => {
            if !flags.contains(TrampolineFlags::REWRITE_CALL) {
                return Err(Error::RewriteDisabled { mnemonic: "call" });
            }
            if instruction.is_rip_relative {
                // indirect call reading its pointer RIP-relative; keep it
                // reading the same pointer from the new location
                rewrite_rip_relative(chunk, instruction, original, offset)
            } else {
                emit_call(chunk, offset, instruction.absolute_target()?)
            }
        }
        MnemonicClass::Jcxz => {
            if !flags.contains(TrampolineFlags::REWRITE_JCXZ) {
                return Err(Error::RewriteDisabled { mnemonic: "jcxz" });
            }
            rewrite_hop_branch(chunk, instruction, original, offset)
        }
        MnemonicClass::Loop => {
            if !flags.contains(TrampolineFlags::REWRITE_LOOP) {
                return Err(Error::RewriteDisabled { mnemonic: "loop" });
            }
            rewrite_hop_branch(chunk, instruction, original, offset)
        }
        MnemonicClass::Jmp => {
            if instruction.is_rip_relative {
                rewrite_rip_relative(chunk, instruction, original, offset)
            } else {
                emit_jump(chunk, offset, instruction.absolute_target()?)
            }
        }
        MnemonicClass::Jcc => rewrite_conditional(chunk, instruction, offset),
        MnemonicClass::Other => {
            if instruction.is_rip_relative {
                rewrite_rip_relative(chunk, instruction, original, offset)
            } else {
                // a relative form the relocation contract does not know
                Err(Error::DecodeFailed {
                    address: instruction.inner.ip() as usize,
                })
            }
        }
    }
}

/// re-encode a RIP-relative displacement against the new instruction address
///
/// region selection keeps every referenced address within rel32 reach of the
/// chunk; a miss here means the placement invariant was violated
fn rewrite_rip_relative(
    chunk: &mut TrampolineChunk,
    instruction: &DecodedInstruction,
    original: &[u8],
    offset: usize,
) -> Result<usize> {
    let length = instruction.length;
    let target = instruction.absolute_target()?;
    let disp_offset = instruction
        .rip_disp_offset
        .ok_or(Error::DecodeFailed {
            address: instruction.inner.ip() as usize,
        })?;

    let new_address = chunk.code_address() + offset;
    let Some(displacement) = arch::relative_displacement(new_address + length, target) else {
        return Err(Error::OutOfRange);
    };

    let code = &mut chunk.code_buffer[offset..offset + length];
    code.copy_from_slice(original);
    code[disp_offset..disp_offset + 4].copy_from_slice(&displacement.to_le_bytes());
    Ok(length)
}

/// emit a jump to `target`: re-biased rel32 when it reaches, otherwise an
/// absolute jump through the chunk's literal slot
fn emit_jump(chunk: &mut TrampolineChunk, offset: usize, target: usize) -> Result<usize> {
    let branch_address = chunk.code_address() + offset;
    if arch::write_relative_jump(&mut chunk.code_buffer[offset..], branch_address, target) {
        return Ok(SIZEOF_RELATIVE_JUMP);
    }
    far_jump(chunk, offset, target)
}

/// emit a call to `target`: re-biased rel32 when it reaches, otherwise an
/// absolute call through the chunk's literal slot
fn emit_call(chunk: &mut TrampolineChunk, offset: usize, target: usize) -> Result<usize> {
    let branch_address = chunk.code_address() + offset;
    if arch::write_relative_call(&mut chunk.code_buffer[offset..], branch_address, target) {
        return Ok(SIZEOF_RELATIVE_JUMP);
    }
    far_call(chunk, offset, target)
}

#[cfg(target_arch = "x86_64")]
fn far_jump(chunk: &mut TrampolineChunk, offset: usize, target: usize) -> Result<usize> {
    let branch_address = chunk.code_address() + offset;
    let pointer_address = chunk.claim_scratch(target)?;
    arch::write_absolute_jump(&mut chunk.code_buffer[offset..], branch_address, pointer_address);
    Ok(SIZEOF_ABSOLUTE_JUMP)
}

#[cfg(target_arch = "x86_64")]
fn far_call(chunk: &mut TrampolineChunk, offset: usize, target: usize) -> Result<usize> {
    let branch_address = chunk.code_address() + offset;
    let pointer_address = chunk.claim_scratch(target)?;
    arch::write_absolute_call(&mut chunk.code_buffer[offset..], branch_address, pointer_address);
    Ok(SIZEOF_ABSOLUTE_JUMP)
}

// on x86 a rel32 displacement reaches the whole address space
#[cfg(target_arch = "x86")]
fn far_jump(_chunk: &mut TrampolineChunk, _offset: usize, _target: usize) -> Result<usize> {
    Err(Error::OutOfRange)
}

#[cfg(target_arch = "x86")]
fn far_call(_chunk: &mut TrampolineChunk, _offset: usize, _target: usize) -> Result<usize> {
    Err(Error::OutOfRange)
}

/// rewrite `JCXZ`-family and `LOOP`-family branches
///
/// These only exist with a rel8 displacement, so the branch itself cannot be
/// widened. Instead its register/flag semantics are kept and only the hop
/// distances change:
///
/// ```text
/// jcxz  +2        ; original prefixes and opcode, taken path enters the tail
/// jmp   short +n  ; fall-through path hops over the tail
/// jmp   <target>  ; tail: near jump to the re-biased destination
/// ```
fn rewrite_hop_branch(
    chunk: &mut TrampolineChunk,
    instruction: &DecodedInstruction,
    original: &[u8],
    offset: usize,
) -> Result<usize> {
    let length = instruction.length;
    let target = instruction.absolute_target()?;

    let tail = offset + length + 2;
    let tail_length = emit_jump(chunk, tail, target)?;

    let code = &mut chunk.code_buffer[offset..];
    code[..length].copy_from_slice(original);
    code[length - 1] = 0x02;
    code[length] = 0xEB;
    code[length + 1] = tail_length as u8;

    Ok(length + 2 + tail_length)
}

/// rewrite a conditional near branch: widen to `0F 8x rel32`, or hop over an
/// absolute jump with the inverted condition when the target is out of reach
fn rewrite_conditional(
    chunk: &mut TrampolineChunk,
    instruction: &DecodedInstruction,
    offset: usize,
) -> Result<usize> {
    let target = instruction.absolute_target()?;
    let condition = condition_bits(instruction)?;
    let branch_address = chunk.code_address() + offset;

    if let Some(displacement) =
        arch::relative_displacement(branch_address + 6, target)
    {
        let code = &mut chunk.code_buffer[offset..];
        code[0] = 0x0F;
        code[1] = 0x80 + condition;
        code[2..6].copy_from_slice(&displacement.to_le_bytes());
        return Ok(6);
    }

    let tail_length = far_jump(chunk, offset + 2, target)?;
    let code = &mut chunk.code_buffer[offset..];
    code[0] = 0x70 + (condition ^ 1);
    code[1] = tail_length as u8;
    Ok(2 + tail_length)
}

/// condition bits of a `Jcc`, as encoded in the opcode
fn condition_bits(instruction: &DecodedInstruction) -> Result<u8> {
    use iced_x86::ConditionCode;

    let bits = match instruction.inner.condition_code() {
        ConditionCode::o => 0x0,
        ConditionCode::no => 0x1,
        ConditionCode::b => 0x2,
        ConditionCode::ae => 0x3,
        ConditionCode::e => 0x4,
        ConditionCode::ne => 0x5,
        ConditionCode::be => 0x6,
        ConditionCode::a => 0x7,
        ConditionCode::s => 0x8,
        ConditionCode::ns => 0x9,
        ConditionCode::p => 0xA,
        ConditionCode::np => 0xB,
        ConditionCode::l => 0xC,
        ConditionCode::ge => 0xD,
        ConditionCode::le => 0xE,
        ConditionCode::g => 0xF,
        ConditionCode::None => {
            return Err(Error::DecodeFailed {
                address: instruction.inner.ip() as usize,
            })
        }
    };
    Ok(bits)
}
