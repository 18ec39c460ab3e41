//! Unified error types for revenant

use core::fmt;

/// all errors that can occur in revenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// a null pointer or out-of-bounds value was passed to a public API
    InvalidArgument { context: &'static str },

    /// the engine or the target function is not in a usable state
    InvalidOperation { reason: &'static str },

    /// no executable memory could be placed within ±2 GiB of the hook site
    /// and every address its prologue references, or a relocated operand
    /// cannot reach its target from the new location
    OutOfRange,

    /// the decoder rejected the bytes at the given address
    DecodeFailed { address: usize },

    /// the prologue contains an instruction that requires rewriting, but the
    /// corresponding rewrite flag is disabled
    RewriteDisabled { mnemonic: &'static str },

    /// underlying Win32 API returned an error
    BadSyscall { code: u32, context: &'static str },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { context } => {
                write!(f, "invalid argument: {context}")
            }
            Self::InvalidOperation { reason } => {
                write!(f, "invalid operation: {reason}")
            }
            Self::OutOfRange => {
                write!(f, "no reachable trampoline placement within ±2 GiB")
            }
            Self::DecodeFailed { address } => {
                write!(f, "failed to decode instruction at {address:#x}")
            }
            Self::RewriteDisabled { mnemonic } => {
                write!(
                    f,
                    "prologue contains `{mnemonic}` but its rewrite flag is disabled"
                )
            }
            Self::BadSyscall { code, context } => {
                write!(f, "Win32 error {code:#x} in {context}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// result type alias using Error
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// create BadSyscall from GetLastError
    pub(crate) fn from_last_error(context: &'static str) -> Self {
        // SAFETY: GetLastError is always safe to call
        let code = unsafe { GetLastError() };
        Self::BadSyscall { code, context }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
}
