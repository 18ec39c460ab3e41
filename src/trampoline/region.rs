//! Trampoline regions
//!
//! A region is one allocation granule of executable memory, carved into
//! fixed-size chunks. The first chunk slot is never handed out; its storage
//! holds the region header. Regions are born `RWX`, live `RX`, and flip back
//! to `RWX` only while a chunk inside them is mutated.

use core::ffi::c_void;

use crate::arch::{align_down, align_up};
#[cfg(target_arch = "x86_64")]
use crate::arch::RANGE_OF_RELATIVE_JUMP;
use crate::error::{Error, Result};
use crate::mem::probe::{
    self, HostMemoryInfo, MEM_FREE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
};
use crate::trampoline::chunk::{TrampolineChunk, CHUNK_SIZE};
use crate::trampoline::EngineConfig;

/// region signature, `'zrex'`
pub(crate) const REGION_SIGNATURE: u32 = 0x7A72_6578;

const MEM_RESERVE_COMMIT: u32 = 0x1000 | 0x2000;
const MEM_RELEASE: u32 = 0x8000;

/// lives in the storage of the first chunk slot
#[repr(C)]
pub(crate) struct RegionHeader {
    /// always `REGION_SIGNATURE` for a live region
    pub signature: u32,
    /// number of chunks in `1..N` with `is_used == false`
    pub unused_chunks: usize,
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() <= core::mem::size_of::<TrampolineChunk>());

/// a live trampoline region, identified by its granule-aligned base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrampolineRegion {
    base: usize,
}

/// true if a branch from anywhere in `[area, area + area_size)` reaches
/// `address` with a rel32 displacement
#[cfg(target_arch = "x86_64")]
pub(crate) fn reaches(area: usize, area_size: usize, address: usize) -> bool {
    let distance = if address < area {
        (area + area_size) - address
    } else {
        address - area
    };
    distance <= RANGE_OF_RELATIVE_JUMP
}

/// on x86 a rel32 displacement wraps around the whole address space
#[cfg(target_arch = "x86")]
pub(crate) fn reaches(_area: usize, _area_size: usize, _address: usize) -> bool {
    true
}

impl TrampolineRegion {
    pub fn from_base(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// true if every chunk of a region based at `base` would be within
    /// rel32 reach of both `lo` and `hi`
    pub fn in_range(base: usize, lo: usize, hi: usize, config: &EngineConfig) -> bool {
        // the first chunk slot holds the header and is never branched from
        let area = base + CHUNK_SIZE;
        let area_size = CHUNK_SIZE * (config.chunks_per_region - 1);
        reaches(area, area_size, lo) && reaches(area, area_size, hi)
    }

    pub fn header(&self) -> &RegionHeader {
        // SAFETY: a live region always starts with an initialised header
        unsafe { &*(self.base as *const RegionHeader) }
    }

    /// mutable access to the header; the region must be unprotected
    ///
    /// # Safety
    /// the caller holds the engine lock and has flipped the region to `RWX`
    pub unsafe fn header_mut(&self) -> &mut RegionHeader {
        // SAFETY: per the function contract
        unsafe { &mut *(self.base as *mut RegionHeader) }
    }

    pub fn chunk_ptr(&self, index: usize, config: &EngineConfig) -> *mut TrampolineChunk {
        debug_assert!(index >= 1 && index < config.chunks_per_region);
        (self.base + index * CHUNK_SIZE) as *mut TrampolineChunk
    }

    /// mutable access to a chunk; the region must be unprotected
    ///
    /// # Safety
    /// the caller holds the engine lock and has flipped the region to `RWX`
    pub unsafe fn chunk_mut<'a>(&self, index: usize, config: &EngineConfig) -> &'a mut TrampolineChunk {
        // SAFETY: per the function contract; chunk slots never overlap
        unsafe { &mut *self.chunk_ptr(index, config) }
    }

    /// find the first unused chunk whose base is within rel32 reach of both
    /// `lo` and `hi`, skipping the header slot
    pub fn find_free_chunk(&self, lo: usize, hi: usize, config: &EngineConfig) -> Option<usize> {
        if self.header().unused_chunks == 0 {
            return None;
        }
        if !Self::in_range(self.base, lo, hi, config) {
            return None;
        }

        for index in 1..config.chunks_per_region {
            let chunk_base = self.base + index * CHUNK_SIZE;
            if !reaches(chunk_base, CHUNK_SIZE, lo) || !reaches(chunk_base, CHUNK_SIZE, hi) {
                continue;
            }
            // SAFETY: is_used is readable under both RX and RWX protection
            if !unsafe { (*self.chunk_ptr(index, config)).is_used } {
                return Some(index);
            }
        }
        None
    }

    /// allocate and initialise a new region within rel32 reach of both `lo`
    /// and `hi`
    ///
    /// walks host memory descriptors outward from the midpoint of the
    /// requested window, below and above alternately, and commits the first
    /// free granule it finds; the new region is `RWX`
    pub fn allocate(
        lo: usize,
        hi: usize,
        config: &EngineConfig,
        host: &HostMemoryInfo,
    ) -> Result<Self> {
        let granule = config.region_size;
        let minimum = align_up(host.minimum_application_address, granule);
        let maximum = align_down(
            host.maximum_application_address.saturating_sub(granule - 1),
            granule,
        );
        if minimum > maximum {
            return Err(Error::OutOfRange);
        }

        let mid = lo + (hi - lo) / 2;
        let mut below = Some(align_down(mid, granule).clamp(minimum, maximum));
        let mut above = Some(align_up(mid, granule).clamp(minimum, maximum));

        loop {
            let mut exhausted = true;

            if let Some(candidate) = below {
                below = match Self::try_commit(candidate, lo, hi, config)? {
                    Committed::Region(region) => return Ok(region),
                    Committed::Skip { base, .. } => {
                        exhausted = false;
                        align_down(base, granule)
                            .checked_sub(granule)
                            .filter(|&next| next >= minimum)
                    }
                    Committed::OutOfReach => None,
                };
            }

            if let Some(candidate) = above {
                above = match Self::try_commit(candidate, lo, hi, config)? {
                    Committed::Region(region) => return Ok(region),
                    Committed::Skip { base, size } => {
                        exhausted = false;
                        Some(align_up(base + size, granule)).filter(|&next| next <= maximum)
                    }
                    Committed::OutOfReach => None,
                };
            }

            if exhausted {
                return Err(Error::OutOfRange);
            }
        }
    }

    fn try_commit(
        candidate: usize,
        lo: usize,
        hi: usize,
        config: &EngineConfig,
    ) -> Result<Committed> {
        if !Self::in_range(candidate, lo, hi, config) {
            return Ok(Committed::OutOfReach);
        }

        let granule = config.region_size;
        let info = probe::query(candidate)?;
        if info.state == MEM_FREE && info.region_size >= granule {
            // SAFETY: committing a free descriptor at a granule-aligned base
            let base = unsafe {
                VirtualAlloc(
                    candidate as *mut c_void,
                    granule,
                    MEM_RESERVE_COMMIT,
                    PAGE_EXECUTE_READWRITE,
                )
            };
            if !base.is_null() {
                let region = Self::from_base(base as usize);
                // SAFETY: the fresh region is RWX
                let header = unsafe { region.header_mut() };
                header.signature = REGION_SIGNATURE;
                header.unused_chunks = config.chunks_per_region - 1;
                log::debug!(
                    "allocated trampoline region at {:#x} ({} chunks)",
                    region.base,
                    config.chunks_per_region - 1
                );
                return Ok(Committed::Region(region));
            }
        }
        Ok(Committed::Skip {
            base: info.base_address as usize,
            size: info.region_size,
        })
    }

    /// release the region's memory
    pub fn release(self, config: &EngineConfig) -> Result<()> {
        debug_assert_eq!(self.base, align_down(self.base, config.region_size));
        log::debug!("releasing trampoline region at {:#x}", self.base);
        // SAFETY: the base was returned by VirtualAlloc
        if unsafe { VirtualFree(self.base as *mut c_void, 0, MEM_RELEASE) } == 0 {
            return Err(Error::from_last_error("VirtualFree"));
        }
        Ok(())
    }

    /// flip the region to `RX` after mutation
    pub fn protect(&self, config: &EngineConfig) -> Result<()> {
        self.set_protection(config, PAGE_EXECUTE_READ)
    }

    /// flip the region to `RWX` for mutation
    pub fn unprotect(&self, config: &EngineConfig) -> Result<()> {
        self.set_protection(config, PAGE_EXECUTE_READWRITE)
    }

    fn set_protection(&self, config: &EngineConfig, protection: u32) -> Result<()> {
        let mut old = 0u32;
        // SAFETY: the region memory is owned by the engine
        let ok = unsafe {
            VirtualProtect(
                self.base as *mut c_void,
                config.region_size,
                protection,
                &mut old,
            )
        };
        if ok == 0 {
            return Err(Error::from_last_error("VirtualProtect"));
        }
        Ok(())
    }

    /// discard stale instruction cache lines for the whole region
    pub fn flush_icache(&self, config: &EngineConfig) -> Result<()> {
        // SAFETY: flushing our own committed memory
        let ok = unsafe {
            FlushInstructionCache(
                GetCurrentProcess(),
                self.base as *const c_void,
                config.region_size,
            )
        };
        if ok == 0 {
            return Err(Error::from_last_error("FlushInstructionCache"));
        }
        Ok(())
    }
}

enum Committed {
    /// a region was committed and initialised at the candidate
    Region(TrampolineRegion),
    /// the candidate was occupied; step past this descriptor
    Skip { base: usize, size: usize },
    /// the candidate left the rel32 window; this direction is exhausted
    OutOfReach,
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAlloc(
        lpAddress: *mut c_void,
        dwSize: usize,
        flAllocationType: u32,
        flProtect: u32,
    ) -> *mut c_void;

    fn VirtualFree(lpAddress: *mut c_void, dwSize: usize, dwFreeType: u32) -> i32;

    fn VirtualProtect(
        lpAddress: *mut c_void,
        dwSize: usize,
        flNewProtect: u32,
        lpflOldProtect: *mut u32,
    ) -> i32;

    fn FlushInstructionCache(
        hProcess: *mut c_void,
        lpBaseAddress: *const c_void,
        dwSize: usize,
    ) -> i32;

    fn GetCurrentProcess() -> *mut c_void;
}
