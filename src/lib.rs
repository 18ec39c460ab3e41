#![cfg(windows)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)] // we document safety in SAFETY comments

//! revenant: trampoline engine for inline function hooking
//!
//! Given a function to intercept, this library builds a *trampoline*: an
//! executable buffer holding a faithful relocated copy of the function's
//! first instructions, terminated by a jump back to the first untouched
//! byte. Callers invoke the trampoline to run the original function while
//! its entry is patched to redirect elsewhere; the patching itself belongs
//! to an outer hook layer.
//!
//! The engine does the hard parts behind that contract:
//!
//! - finds or allocates executable memory within ±2 GiB of the hook site
//!   *and* of every address the prologue references, so re-biased rel32
//!   displacements always fit
//! - pools fixed-size trampoline chunks across granule-sized regions
//! - probes host memory before reading foreign instruction bytes
//! - relocates relative branches, `JCXZ`/`LOOP`-family branches and
//!   RIP-relative operands (decoding is delegated to iced-x86)
//! - keeps regions executable-read except while a chunk is mutated
//!
//! Supported targets are x86 and x86-64 Windows.

pub mod arch;
mod asm;
pub mod error;
mod mem;
mod trampoline;

// re-exports for convenience
pub use error::{Error, Result};
pub use trampoline::{
    trampoline_create, trampoline_create_ex, trampoline_free, Trampoline, TrampolineFlags,
    TranslationItem,
};

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
