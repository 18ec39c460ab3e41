//! Trampoline creation and teardown
//!
//! A trampoline is an executable buffer holding a relocated copy of the
//! first instructions of a hooked function, terminated by an indirect
//! absolute jump back to the first byte that was not relocated. Calling the
//! trampoline therefore runs the original function as if its entry had
//! never been patched; patching the entry itself is the job of an outer
//! hook layer.
//!
//! Chunks come from a pool of granule-sized executable regions. Placement
//! keeps every chunk within rel32 reach of the hook site and of every
//! address the relocated prologue references, so re-biased displacements
//! always fit. Thread-safety is provided by serialising all engine
//! mutations behind one lock; the engine state itself is created lazily on
//! the first `trampoline_create` and torn down by the `trampoline_free`
//! that empties the region directory.

pub(crate) mod chunk;
pub(crate) mod directory;
pub(crate) mod region;

use core::ffi::c_void;
use std::sync::{Mutex, PoisonError};

use bitflags::bitflags;

use crate::arch::MAX_CODE_SIZE;
use crate::error::{Error, Result};
use crate::mem::probe::{self, HostMemoryInfo};
use chunk::{TrampolineChunk, CHUNK_SIZE};
use directory::RegionDirectory;
use region::TrampolineRegion;

pub use chunk::TranslationItem;

bitflags! {
    /// selects which relative instruction classes may be rewritten into a
    /// larger equivalent instead of failing the relocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrampolineFlags: u32 {
        /// rewrite relative `CALL` instructions
        const REWRITE_CALL = 1 << 0;
        /// rewrite `JCXZ`/`JECXZ`/`JRCXZ` instructions
        const REWRITE_JCXZ = 1 << 1;
        /// rewrite `LOOP`/`LOOPE`/`LOOPNE` instructions
        const REWRITE_LOOP = 1 << 2;
    }
}

/// engine parameters derived from the host at first use
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineConfig {
    /// size of one trampoline region (the host allocation granularity)
    pub region_size: usize,
    /// chunks per region, header slot included
    pub chunks_per_region: usize,
}

struct EngineState {
    config: EngineConfig,
    host: HostMemoryInfo,
    directory: RegionDirectory,
}

/// process-wide engine state; the lock serialises create/free as the outer
/// transaction layer expects
static ENGINE: Mutex<Option<EngineState>> = Mutex::new(None);

fn engine() -> std::sync::MutexGuard<'static, Option<EngineState>> {
    ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// a live trampoline handle
///
/// The handle stays valid until it is passed to [`trampoline_free`].
#[derive(Debug)]
pub struct Trampoline {
    target: *const c_void,
    callback: *const c_void,
    chunk: *mut TrampolineChunk,
}

// SAFETY: the chunk behind the handle lives in the process-wide pool and is
// only mutated under the engine lock
unsafe impl Send for Trampoline {}

impl Trampoline {
    /// address of the relocated prologue; jumping here executes the original
    /// function as if it had never been patched
    pub fn address_of_trampoline_code(&self) -> *const c_void {
        // SAFETY: the chunk outlives the handle
        unsafe { (*self.chunk).code_buffer.as_ptr() as *const c_void }
    }

    /// address of the absolute-jump stub that forwards to the callback
    ///
    /// the stub is always within rel32 reach of the hooked function, so the
    /// outer patch layer can reach the callback with a 5-byte relative jump
    /// no matter where the callback itself lives
    #[cfg(target_arch = "x86_64")]
    pub fn address_of_callback_jump(&self) -> *const c_void {
        // SAFETY: the chunk outlives the handle
        unsafe { (*self.chunk).callback_jump.as_ptr() as *const c_void }
    }

    /// the hooked function this trampoline continues
    pub fn target(&self) -> *const c_void {
        self.target
    }

    /// the callback the hook redirects to
    pub fn callback(&self) -> *const c_void {
        self.callback
    }

    /// the original prologue bytes consumed by the relocation
    pub fn original_code(&self) -> &[u8] {
        // SAFETY: the chunk outlives the handle
        unsafe {
            let chunk = &*self.chunk;
            &chunk.original_code[..chunk.original_code_size as usize]
        }
    }

    /// source ↔ destination offsets of every relocated instruction
    pub fn translation(&self) -> &[TranslationItem] {
        // SAFETY: the chunk outlives the handle
        unsafe { (*self.chunk).translation_map.items() }
    }
}

/// create a trampoline for the function at `target`, with every rewrite
/// class enabled
pub fn trampoline_create(
    target: *const c_void,
    callback: *const c_void,
    min_bytes_to_reloc: usize,
) -> Result<Trampoline> {
    trampoline_create_ex(target, callback, min_bytes_to_reloc, TrampolineFlags::all())
}

/// create a trampoline for the function at `target`
///
/// at least `min_bytes_to_reloc` bytes of the target are relocated into the
/// trampoline; more are consumed when needed to keep the last instruction
/// intact. On failure every data structure is left in its pre-call state.
pub fn trampoline_create_ex(
    target: *const c_void,
    callback: *const c_void,
    min_bytes_to_reloc: usize,
    flags: TrampolineFlags,
) -> Result<Trampoline> {
    if target.is_null() {
        return Err(Error::InvalidArgument { context: "target" });
    }
    if callback.is_null() {
        return Err(Error::InvalidArgument { context: "callback" });
    }
    if min_bytes_to_reloc < 1 || min_bytes_to_reloc > MAX_CODE_SIZE {
        return Err(Error::InvalidArgument {
            context: "min_bytes_to_reloc",
        });
    }

    let mut guard = engine();

    // the readable window bounds both decoding passes
    let readable = probe::probe_readable(target as usize, MAX_CODE_SIZE)?;
    if readable < min_bytes_to_reloc {
        return Err(Error::InvalidOperation {
            reason: "target memory region too short",
        });
    }

    let state = guard.get_or_insert_with(|| {
        let host = probe::host_memory_info();
        let config = EngineConfig {
            region_size: host.allocation_granularity,
            chunks_per_region: host.allocation_granularity / CHUNK_SIZE,
        };
        log::debug!(
            "trampoline engine initialised: region size {:#x}, {} chunks per region",
            config.region_size,
            config.chunks_per_region
        );
        EngineState {
            config,
            host,
            directory: RegionDirectory::new(),
        }
    });
    let config = state.config;

    // bounds of every address the relocated code will reference, the hook
    // site included; chunk placement must reach them all
    let (lo, hi) = address_window(target as usize, readable, min_bytes_to_reloc)?;

    let (found, is_new_region) = match state.directory.find_chunk(lo, hi, &config) {
        Some((region, index)) => {
            region.unprotect(&config)?;
            ((region, index), false)
        }
        None => {
            let region = TrampolineRegion::allocate(lo, hi, &config, &state.host)?;
            match region.find_free_chunk(lo, hi, &config) {
                Some(index) => ((region, index), true),
                None => {
                    let _ = region.release(&config);
                    return Err(Error::OutOfRange);
                }
            }
        }
    };
    let (region, chunk_index) = found;
    debug_assert!(region.header().unused_chunks > 0);

    // SAFETY: the region was flipped to RWX above (or is freshly allocated)
    let chunk = unsafe { region.chunk_mut(chunk_index, &config) };
    if let Err(error) = chunk.init(
        target as usize,
        callback as usize,
        min_bytes_to_reloc,
        readable,
        flags,
    ) {
        // roll back: a fresh region vanishes, an existing one is re-sealed
        if is_new_region {
            let _ = region.release(&config);
        } else {
            chunk.clear();
            let _ = region.protect(&config);
        }
        return Err(error);
    }

    let trampoline = Trampoline {
        target,
        callback,
        chunk: chunk as *mut TrampolineChunk,
    };

    // SAFETY: still RWX until the protect below
    unsafe { region.header_mut() }.unused_chunks -= 1;
    let _ = region.flush_icache(&config);
    // a failed re-seal leaves the region writable but fully functional
    let _ = region.protect(&config);

    if is_new_region {
        state.directory.insert(region);
    }

    log::trace!(
        "created trampoline for {:p} in chunk {} of region {:#x}",
        target,
        chunk_index,
        region.base()
    );
    Ok(trampoline)
}

/// destroy a trampoline and return its chunk to the pool
///
/// the chunk is trap-filled and marked unused; a region whose chunks are
/// all unused again is released, and the engine itself is torn down once
/// the last region is gone
pub fn trampoline_free(trampoline: Trampoline) -> Result<()> {
    let mut guard = engine();
    let state = guard.as_mut().ok_or(Error::InvalidOperation {
        reason: "trampoline engine not initialised",
    })?;
    let config = state.config;

    let chunk_address = trampoline.chunk as usize;
    let region = TrampolineRegion::from_base(crate::arch::align_down(
        chunk_address,
        config.region_size,
    ));
    if !state.directory.contains(&region)
        || region.header().signature != region::REGION_SIGNATURE
    {
        return Err(Error::InvalidArgument { context: "trampoline" });
    }

    region.unprotect(&config)?;
    // SAFETY: the region is RWX and the lock is held
    let chunk = unsafe { &mut *trampoline.chunk };
    chunk.clear();
    // SAFETY: as above
    unsafe { region.header_mut() }.unused_chunks += 1;

    if region.header().unused_chunks == config.chunks_per_region - 1 {
        state.directory.remove(&region);
        region.release(&config)?;
    } else {
        let _ = region.protect(&config);
    }

    log::trace!("freed trampoline for {:p}", trampoline.target);

    if state.directory.is_empty() {
        *guard = None;
        log::debug!("trampoline engine torn down");
    }
    Ok(())
}

/// `[lo, hi]` window of every absolute address the relocated prologue will
/// reference, the target itself included
#[cfg(target_arch = "x86_64")]
fn address_window(target: usize, readable: usize, min_bytes: usize) -> Result<(usize, usize)> {
    use crate::arch::RANGE_OF_RELATIVE_JUMP;
    use crate::asm::decoder::prologue_range;

    let range = prologue_range(target, readable, min_bytes)?;
    let mut lo = target;
    let mut hi = target;
    if range.any_relative {
        lo = lo.min(range.lo);
        hi = hi.max(range.hi);
    }
    if hi - lo > RANGE_OF_RELATIVE_JUMP {
        // no single placement can reach both ends of the window
        return Err(Error::OutOfRange);
    }
    Ok((lo, hi))
}

/// rel32 reaches the whole 32-bit address space, so placement is
/// unconstrained
#[cfg(target_arch = "x86")]
fn address_window(target: usize, _readable: usize, _min_bytes: usize) -> Result<(usize, usize)> {
    Ok((target, target))
}
