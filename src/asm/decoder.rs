//! Instruction decoding façade over iced-x86
//!
//! The engine never touches raw iced types outside this module. Every
//! instruction is decoded at its real runtime address so branch targets and
//! RIP-relative addresses come out absolute, ready for range analysis and
//! relocation.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};

use crate::arch::BITNESS;
use crate::error::{Error, Result};

/// coarse mnemonic class driving the relocation dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MnemonicClass {
    /// near relative or RIP-relative indirect `CALL`
    Call,
    /// `JCXZ`/`JECXZ`/`JRCXZ`
    Jcxz,
    /// `LOOP`/`LOOPE`/`LOOPNE`
    Loop,
    /// unconditional `JMP` (relative or RIP-relative indirect)
    Jmp,
    /// conditional near branch
    Jcc,
    /// everything else
    Other,
}

/// one decoded instruction with the metadata the engine needs
#[derive(Debug, Clone)]
pub(crate) struct DecodedInstruction {
    /// the raw iced-x86 instruction
    pub inner: Instruction,
    /// instruction length in bytes
    pub length: usize,
    /// mnemonic class for relocation dispatch
    pub class: MnemonicClass,
    /// whether the instruction references an address relative to its own
    /// location (relative branch or RIP-relative memory operand)
    pub is_relative: bool,
    /// absolute target of a relative branch
    pub branch_target: Option<usize>,
    /// whether the instruction has a RIP-relative memory operand
    pub is_rip_relative: bool,
    /// absolute address a RIP-relative memory operand resolves to
    pub rip_target: Option<usize>,
    /// byte offset of the 32-bit displacement within the instruction
    pub rip_disp_offset: Option<usize>,
}

impl DecodedInstruction {
    /// absolute address referenced by this instruction
    ///
    /// valid only for relative instructions; anything else violates the
    /// decode contract
    pub fn absolute_target(&self) -> Result<usize> {
        debug_assert!(self.is_relative);
        self.branch_target
            .or(self.rip_target)
            .ok_or(Error::DecodeFailed {
                address: self.inner.ip() as usize,
            })
    }
}

/// instruction decoder fixed to the compile-time architecture
pub(crate) struct InstructionDecoder {
    bitness: u32,
}

impl InstructionDecoder {
    /// create decoder for the current architecture
    pub fn native() -> Self {
        Self { bitness: BITNESS }
    }

    /// decode a single instruction located at `runtime_address`
    ///
    /// `bytes` must view the memory at `runtime_address`; targets are
    /// computed against that address
    pub fn decode_at(&self, runtime_address: usize, bytes: &[u8]) -> Result<DecodedInstruction> {
        let mut decoder = Decoder::with_ip(
            self.bitness,
            bytes,
            runtime_address as u64,
            DecoderOptions::NONE,
        );

        if !decoder.can_decode() {
            return Err(Error::DecodeFailed {
                address: runtime_address,
            });
        }

        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(Error::DecodeFailed {
                address: runtime_address,
            });
        }

        Ok(self.analyze(instruction))
    }

    fn analyze(&self, instruction: Instruction) -> DecodedInstruction {
        let length = instruction.len();
        let flow = instruction.flow_control();

        let class = match instruction.mnemonic() {
            Mnemonic::Call => MnemonicClass::Call,
            Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz => MnemonicClass::Jcxz,
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => MnemonicClass::Loop,
            Mnemonic::Jmp => MnemonicClass::Jmp,
            _ if flow == FlowControl::ConditionalBranch => MnemonicClass::Jcc,
            _ => MnemonicClass::Other,
        };

        // near relative branch target; iced masks NearBranch16 targets the
        // way a 16-bit operand-size branch wraps outside long mode
        let mut is_relative = false;
        let mut branch_target = None;
        match flow {
            FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch
            | FlowControl::Call
            | FlowControl::XbeginXabortXend => {
                if matches!(
                    instruction.op0_kind(),
                    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                ) {
                    is_relative = true;
                    branch_target = Some(instruction.near_branch_target() as usize);
                }
            }
            _ => {}
        }

        // RIP-relative memory operand (mod == 0, rm == 5 in long mode);
        // the decoder resolves EIP-relative forms under a 67 prefix as well
        let mut is_rip_relative = false;
        let mut rip_target = None;
        let mut rip_disp_offset = None;
        if instruction.is_ip_rel_memory_operand() {
            is_rip_relative = true;
            is_relative = true;
            rip_target = Some(instruction.ip_rel_memory_address() as usize);

            // the disp32 sits at the end of the instruction, before any
            // immediate operand
            let immediate = immediate_size(&instruction);
            if length >= 4 + immediate {
                rip_disp_offset = Some(length - 4 - immediate);
            }
        }

        DecodedInstruction {
            inner: instruction,
            length,
            class,
            is_relative,
            branch_target,
            is_rip_relative,
            rip_target,
            rip_disp_offset,
        }
    }
}

fn immediate_size(instruction: &Instruction) -> usize {
    for i in 0..instruction.op_count() {
        match instruction.op_kind(i) {
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64 => return 1,
            OpKind::Immediate16 => return 2,
            OpKind::Immediate32 | OpKind::Immediate32to64 => return 4,
            OpKind::Immediate64 => return 8,
            _ => {}
        }
    }
    0
}

/// absolute-address bounds referenced by a prologue
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddressRange {
    /// lowest absolute target of any relative instruction
    pub lo: usize,
    /// highest absolute target of any relative instruction
    pub hi: usize,
    /// false iff no relative instruction was seen
    pub any_relative: bool,
}

/// decode forward from `address` until at least `min_bytes` are consumed and
/// fold every relative instruction's absolute target into a `[lo, hi]` range
///
/// on x86-32 this analysis is omitted entirely: a rel32 jump reaches the
/// whole address space
#[cfg(target_arch = "x86_64")]
pub(crate) fn prologue_range(address: usize, size: usize, min_bytes: usize) -> Result<AddressRange> {
    debug_assert!(min_bytes <= size);

    // SAFETY: the caller probed [address, address + size) as readable
    let bytes = unsafe { core::slice::from_raw_parts(address as *const u8, size) };

    let decoder = InstructionDecoder::native();
    let mut range = AddressRange {
        lo: usize::MAX,
        hi: 0,
        any_relative: false,
    };

    let mut offset = 0;
    while offset < min_bytes {
        let instruction = decoder.decode_at(address + offset, &bytes[offset..])?;
        if instruction.is_relative {
            let target = instruction.absolute_target()?;
            range.lo = range.lo.min(target);
            range.hi = range.hi.max(target);
            range.any_relative = true;
        }
        offset += instruction.length;
    }

    Ok(range)
}
