//! Readable-memory probing and host memory parameters
//!
//! The engine reads instruction bytes out of foreign functions; before it
//! does, it asks the host how many bytes at the target are actually
//! committed and readable. With concurrent mutators the answer is advisory,
//! so a decode-buffer overrun downstream is still treated as a decode error.

use core::ffi::c_void;
use core::mem::MaybeUninit;

use crate::error::{Error, Result};

pub(crate) const MEM_COMMIT: u32 = 0x1000;
pub(crate) const MEM_FREE: u32 = 0x10000;

pub(crate) const PAGE_READONLY: u32 = 0x02;
pub(crate) const PAGE_READWRITE: u32 = 0x04;
pub(crate) const PAGE_WRITECOPY: u32 = 0x08;
pub(crate) const PAGE_EXECUTE_READ: u32 = 0x20;
pub(crate) const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub(crate) const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

/// any protection that allows reading
const READ_MASK: u32 = PAGE_READONLY
    | PAGE_READWRITE
    | PAGE_WRITECOPY
    | PAGE_EXECUTE_READ
    | PAGE_EXECUTE_READWRITE
    | PAGE_EXECUTE_WRITECOPY;

/// one host virtual-memory descriptor
#[repr(C)]
#[allow(dead_code)] // mirrors the full Win32 layout
pub(crate) struct MemoryBasicInformation {
    pub base_address: *mut c_void,
    pub allocation_base: *mut c_void,
    pub allocation_protect: u32,
    #[cfg(target_arch = "x86_64")]
    pub partition_id: u16,
    pub region_size: usize,
    pub state: u32,
    pub protect: u32,
    pub type_: u32,
}

/// query the descriptor covering `address`
pub(crate) fn query(address: usize) -> Result<MemoryBasicInformation> {
    let mut info = MaybeUninit::<MemoryBasicInformation>::uninit();
    // SAFETY: VirtualQuery writes at most size_of::<MemoryBasicInformation>
    // bytes into the provided buffer
    let written = unsafe {
        VirtualQuery(
            address as *const c_void,
            info.as_mut_ptr(),
            core::mem::size_of::<MemoryBasicInformation>(),
        )
    };
    if written == 0 {
        return Err(Error::from_last_error("VirtualQuery"));
    }
    // SAFETY: a non-zero return means the descriptor was filled in
    Ok(unsafe { info.assume_init() })
}

/// greatest `k <= limit` such that `[address, address + k)` is committed and
/// readable according to the host
pub(crate) fn probe_readable(address: usize, limit: usize) -> Result<usize> {
    let mut readable = 0;
    while readable < limit {
        let info = query(address + readable)?;
        if info.state != MEM_COMMIT || info.protect & READ_MASK == 0 {
            break;
        }
        // count from the probe point to the end of this descriptor
        let descriptor_end = info.base_address as usize + info.region_size;
        readable = descriptor_end - address;
    }
    Ok(readable.min(limit))
}

/// host memory parameters the region allocator works against
#[derive(Debug, Clone, Copy)]
pub(crate) struct HostMemoryInfo {
    /// allocation granularity; every region base is aligned to it
    pub allocation_granularity: usize,
    /// lowest address applications may allocate at
    pub minimum_application_address: usize,
    /// highest address applications may allocate at
    pub maximum_application_address: usize,
}

pub(crate) fn host_memory_info() -> HostMemoryInfo {
    // SAFETY: GetSystemInfo fills the whole struct and cannot fail
    let info = unsafe {
        let mut info = MaybeUninit::<SystemInfo>::uninit();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    };
    HostMemoryInfo {
        allocation_granularity: info.allocation_granularity as usize,
        minimum_application_address: info.minimum_application_address as usize,
        maximum_application_address: info.maximum_application_address as usize,
    }
}

#[repr(C)]
#[allow(dead_code)] // mirrors the full Win32 layout
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: *mut c_void,
    maximum_application_address: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualQuery(
        lpAddress: *const c_void,
        lpBuffer: *mut MemoryBasicInformation,
        dwLength: usize,
    ) -> usize;

    fn GetSystemInfo(lpSystemInfo: *mut SystemInfo);
}
