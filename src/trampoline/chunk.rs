//! Fixed-size trampoline chunks
//!
//! A chunk is one slot of a trampoline region. It carries the relocated
//! prologue, the literal pointer slots the indirect jumps read through, the
//! instruction translation map and a copy of the consumed original bytes.

use crate::arch::{
    self, CODE_BUFFER_BONUS, INSTRUCTION_COUNT_BONUS, MAX_CODE_SIZE, MAX_CODE_SIZE_WITH_BACKJUMP,
    MAX_INSTRUCTION_COUNT, SIZEOF_ABSOLUTE_JUMP,
};
use crate::asm::relocator;
use crate::error::Result;
use crate::trampoline::TrampolineFlags;

/// chunk size in bytes; a power of two so chunks tile the allocation granule
pub(crate) const CHUNK_SIZE: usize = 128;

/// capacity of the trampoline code buffer
pub(crate) const CODE_BUFFER_CAPACITY: usize = MAX_CODE_SIZE_WITH_BACKJUMP + CODE_BUFFER_BONUS;

/// capacity of the instruction translation map
pub(crate) const TRANSLATION_MAP_CAPACITY: usize = MAX_INSTRUCTION_COUNT + INSTRUCTION_COUNT_BONUS;

/// trap opcode used to fill unused code bytes (`INT 3`)
pub(crate) const TRAP_OPCODE: u8 = 0xCC;

/// maps one instruction of the original prologue to its relocated position
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationItem {
    /// offset of the instruction relative to the original function entry
    pub offset_source: u8,
    /// offset of the relocated instruction relative to the trampoline code
    pub offset_destination: u8,
}

/// source ↔ destination offset correspondence of the relocated prologue
#[repr(C)]
#[derive(Debug)]
pub(crate) struct TranslationMap {
    count: u8,
    items: [TranslationItem; TRANSLATION_MAP_CAPACITY],
}

impl TranslationMap {
    pub fn is_full(&self) -> bool {
        self.count as usize == TRANSLATION_MAP_CAPACITY
    }

    /// append an item; instruction order is append order
    pub fn push(&mut self, offset_source: u8, offset_destination: u8) {
        debug_assert!(!self.is_full());
        self.items[self.count as usize] = TranslationItem {
            offset_source,
            offset_destination,
        };
        self.count += 1;
    }

    pub fn items(&self) -> &[TranslationItem] {
        &self.items[..self.count as usize]
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

/// one trampoline slot
///
/// The layout keeps every literal pointer slot at a fixed displacement from
/// the jump that dereferences it, so the `FF 25`/`FF 15` encodings can be
/// emitted without extra fixups.
#[repr(C, align(128))]
pub(crate) struct TrampolineChunk {
    /// signals if the chunk is currently in use
    pub is_used: bool,

    /// the address of the callback function the hook redirects to
    #[cfg(target_arch = "x86_64")]
    pub callback_address: usize,
    /// absolute jump through `callback_address`; the outer patch layer can
    /// always reach this stub with a 5-byte relative jump
    #[cfg(target_arch = "x86_64")]
    pub callback_jump: [u8; SIZEOF_ABSOLUTE_JUMP],
    /// literal slot for a rewritten far branch or call target
    #[cfg(target_arch = "x86_64")]
    pub scratch_address: usize,

    /// target of the backjump at the end of the trampoline code
    pub backjump_address: usize,
    /// relocated prologue followed by the backjump, trap-padded
    pub code_buffer: [u8; CODE_BUFFER_CAPACITY],
    /// relocated prologue length, excluding the backjump
    pub code_buffer_size: u8,
    /// the instruction translation map
    pub translation_map: TranslationMap,
    /// raw copy of the consumed original bytes
    pub original_code: [u8; MAX_CODE_SIZE],
    /// number of bytes saved from the original function
    pub original_code_size: u8,
}

const _: () = assert!(core::mem::size_of::<TrampolineChunk>() == CHUNK_SIZE);
const _: () = assert!(MAX_CODE_SIZE <= u8::MAX as usize);

impl TrampolineChunk {
    /// runtime address of the trampoline code
    pub fn code_address(&self) -> usize {
        self.code_buffer.as_ptr() as usize
    }

    /// initialize the chunk for `target`, relocating at least `min_bytes`
    /// original bytes into the code buffer
    ///
    /// on failure the chunk contents are unspecified; the caller clears or
    /// discards it
    pub fn init(
        &mut self,
        target: usize,
        callback: usize,
        min_bytes: usize,
        max_read: usize,
        flags: TrampolineFlags,
    ) -> Result<()> {
        self.is_used = true;

        #[cfg(target_arch = "x86_64")]
        {
            self.callback_address = callback;
            self.scratch_address = 0;
            let branch_address = self.callback_jump.as_ptr() as usize;
            let pointer_address = core::ptr::addr_of!(self.callback_address) as usize;
            arch::write_absolute_jump(&mut self.callback_jump, branch_address, pointer_address);
        }
        #[cfg(target_arch = "x86")]
        let _ = callback;

        let relocated = relocator::relocate_prologue(self, target, min_bytes, max_read, flags)?;
        self.code_buffer_size = relocated.bytes_written as u8;

        // backjump to the first instruction that was not relocated
        let branch_address = self.code_address() + relocated.bytes_written;
        let pointer_address = core::ptr::addr_of!(self.backjump_address) as usize;
        arch::write_absolute_jump(
            &mut self.code_buffer[relocated.bytes_written..],
            branch_address,
            pointer_address,
        );
        self.backjump_address = target + relocated.bytes_read;

        // fill the remaining buffer with trap bytes
        let code_end = relocated.bytes_written + SIZEOF_ABSOLUTE_JUMP;
        self.code_buffer[code_end..].fill(TRAP_OPCODE);

        // SAFETY: the caller probed [target, target + max_read) as readable
        // and the relocation loop consumed at most max_read bytes
        let original = unsafe {
            core::slice::from_raw_parts(target as *const u8, relocated.bytes_read)
        };
        self.original_code[..relocated.bytes_read].copy_from_slice(original);
        self.original_code_size = relocated.bytes_read as u8;

        Ok(())
    }

    /// return the chunk to its free state, overwriting the code with traps
    pub fn clear(&mut self) {
        self.is_used = false;
        #[cfg(target_arch = "x86_64")]
        {
            self.callback_address = 0;
            self.callback_jump.fill(TRAP_OPCODE);
            self.scratch_address = 0;
        }
        self.backjump_address = 0;
        self.code_buffer.fill(TRAP_OPCODE);
        self.code_buffer_size = 0;
        self.translation_map.clear();
        self.original_code.fill(0);
        self.original_code_size = 0;
    }

    /// claim the far-branch literal slot for `target`
    ///
    /// a chunk carries a single slot; a second far rewrite with a different
    /// target cannot be expressed
    #[cfg(target_arch = "x86_64")]
    pub fn claim_scratch(&mut self, target: usize) -> Result<usize> {
        if self.scratch_address != 0 && self.scratch_address != target {
            return Err(crate::error::Error::OutOfRange);
        }
        self.scratch_address = target;
        Ok(core::ptr::addr_of!(self.scratch_address) as usize)
    }

    #[cfg(test)]
    pub fn blank() -> Self {
        // SAFETY: the chunk is plain old data; all-zero is a valid free state
        unsafe { core::mem::zeroed() }
    }
}
