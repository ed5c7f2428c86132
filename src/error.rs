//! Error taxonomy and native status codes
//!
//! Every failure inside decoding or execution is one of these kinds. They are
//! caught once, at the control device, and turned into a status plus a short
//! diagnostic.

use std::fmt;

use crate::ffi::ScalarType;

/// Native status code (NT-compatible values)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const INFO_LENGTH_MISMATCH: Status = Status(0xC000_0004);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const INVALID_DEVICE_REQUEST: Status = Status(0xC000_0010);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const NOT_FOUND: Status = Status(0xC000_0225);

    /// Success and informational codes have the top bit clear
    #[inline(always)]
    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    /// Turns a failing status into `Error::Native`
    #[inline]
    pub fn verify(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Native(self))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Why the call-preparation step rejected a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFault {
    /// A type descriptor is malformed
    BadTypedef,
    /// The calling convention is not supported
    BadAbi,
}

impl fmt::Display for SignatureFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureFault::BadTypedef => f.write_str("Bad type definition"),
            SignatureFault::BadAbi => f.write_str("Bad ABI"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Request buffer too short")]
    DecodeOverrun,

    #[error("Unknown request type {0:02X}")]
    UnknownOperation(u8),

    #[error("Unknown FFI type {0:02X}")]
    UnknownType(u8),

    #[error("Unsupported FFI type {0:?}")]
    UnsupportedType(ScalarType),

    #[error("FFI exception: {0}")]
    BadCallSignature(SignatureFault),

    #[error("Argument count mismatch: {types} types, {addresses} addresses")]
    ArgumentCountMismatch { types: usize, addresses: usize },

    #[error("Module {0} was not found")]
    ModuleNotFound(String),

    #[error("Routine {0} was not found")]
    SymbolNotFound(String),

    #[error("Allocation of {0} bytes failed")]
    AllocationFailure(u32),

    #[error("NT error {0}")]
    Native(Status),

    #[error("Not enough memory")]
    OutOfMemory,
}

impl Error {
    /// Status reported to the caller for this failure
    pub fn status(&self) -> Status {
        match self {
            Error::UnknownOperation(_) => Status::INVALID_DEVICE_REQUEST,
            Error::OutOfMemory => Status::NO_MEMORY,
            _ => Status::UNSUCCESSFUL,
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
