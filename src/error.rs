//! tacore error types
//!
//! [`Error`] carries the GlobalPlatform result code of a failure. Public
//! session entry points wrap it in [`TeeError`] so the non-secure caller
//! can tell infrastructure failures from application-level ones.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TEE_SUCCESS: u32 = 0x0000_0000;
pub const TEE_ERROR_GENERIC: u32 = 0xFFFF_0000;
pub const TEE_ERROR_ACCESS_DENIED: u32 = 0xFFFF_0001;
pub const TEE_ERROR_CANCEL: u32 = 0xFFFF_0002;
pub const TEE_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEE_ERROR_BAD_STATE: u32 = 0xFFFF_0007;
pub const TEE_ERROR_ITEM_NOT_FOUND: u32 = 0xFFFF_0008;
pub const TEE_ERROR_NOT_IMPLEMENTED: u32 = 0xFFFF_0009;
pub const TEE_ERROR_NOT_SUPPORTED: u32 = 0xFFFF_000A;
pub const TEE_ERROR_OUT_OF_MEMORY: u32 = 0xFFFF_000C;
pub const TEE_ERROR_BUSY: u32 = 0xFFFF_000D;
pub const TEE_ERROR_COMMUNICATION: u32 = 0xFFFF_000E;
pub const TEE_ERROR_SHORT_BUFFER: u32 = 0xFFFF_0010;
pub const TEE_ERROR_OVERFLOW: u32 = 0xFFFF_300F;
pub const TEE_ERROR_TARGET_DEAD: u32 = 0xFFFF_3024;

/// tacore error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unspecified failure
    #[error("Generic error")]
    Generic,

    /// Client identity spoofing a trusted-app session
    #[error("Access denied")]
    AccessDenied,

    /// Operation cancelled by the client
    #[error("Operation cancelled")]
    Cancel,

    /// Identity mismatch, illegal memory reference class or misaligned buffer
    #[error("Bad parameters: {0}")]
    BadParameters(String),

    /// Object is not in a state that allows the operation
    #[error("Bad state: {0}")]
    BadState(String),

    /// Unresolvable UUID or session id
    #[error("Item not found")]
    ItemNotFound,

    #[error("Not implemented")]
    NotImplemented,

    #[error("Not supported")]
    NotSupported,

    #[error("Out of memory")]
    OutOfMemory,

    /// Deadlock-avoided contention on a busy context
    #[error("Busy")]
    Busy,

    #[error("Communication error")]
    Communication,

    /// Caller's output buffer is too small; `required` is the size needed
    #[error("Short buffer: {required} bytes required")]
    ShortBuffer { required: usize },

    /// Id space or arithmetic exhaustion
    #[error("Overflow")]
    Overflow,

    /// The context panicked during the call
    #[error("Target dead")]
    TargetDead,

    /// Application-defined result code returned by a TA
    #[error("TA error code {0:#010x}")]
    TaDefined(u32),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mailbox transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML decoding error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// GlobalPlatform result code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Generic => TEE_ERROR_GENERIC,
            Error::AccessDenied => TEE_ERROR_ACCESS_DENIED,
            Error::Cancel => TEE_ERROR_CANCEL,
            Error::BadParameters(_) => TEE_ERROR_BAD_PARAMETERS,
            Error::BadState(_) => TEE_ERROR_BAD_STATE,
            Error::ItemNotFound => TEE_ERROR_ITEM_NOT_FOUND,
            Error::NotImplemented => TEE_ERROR_NOT_IMPLEMENTED,
            Error::NotSupported => TEE_ERROR_NOT_SUPPORTED,
            Error::OutOfMemory => TEE_ERROR_OUT_OF_MEMORY,
            Error::Busy => TEE_ERROR_BUSY,
            Error::Communication | Error::Transport(_) => TEE_ERROR_COMMUNICATION,
            Error::ShortBuffer { .. } => TEE_ERROR_SHORT_BUFFER,
            Error::Overflow => TEE_ERROR_OVERFLOW,
            Error::TargetDead => TEE_ERROR_TARGET_DEAD,
            Error::TaDefined(code) => *code,
            Error::Config(_)
            | Error::Io(_)
            | Error::Toml(_)
            | Error::Serialization(_) => TEE_ERROR_GENERIC,
        }
    }

    /// Build an error from a result code returned by a TA.
    ///
    /// Returns `None` for `TEE_SUCCESS`.
    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            TEE_SUCCESS => return None,
            TEE_ERROR_GENERIC => Error::Generic,
            TEE_ERROR_ACCESS_DENIED => Error::AccessDenied,
            TEE_ERROR_CANCEL => Error::Cancel,
            TEE_ERROR_BAD_PARAMETERS => Error::BadParameters("reported by TA".to_string()),
            TEE_ERROR_BAD_STATE => Error::BadState("reported by TA".to_string()),
            TEE_ERROR_ITEM_NOT_FOUND => Error::ItemNotFound,
            TEE_ERROR_NOT_IMPLEMENTED => Error::NotImplemented,
            TEE_ERROR_NOT_SUPPORTED => Error::NotSupported,
            TEE_ERROR_OUT_OF_MEMORY => Error::OutOfMemory,
            TEE_ERROR_BUSY => Error::Busy,
            TEE_ERROR_COMMUNICATION => Error::Communication,
            TEE_ERROR_SHORT_BUFFER => Error::ShortBuffer { required: 0 },
            TEE_ERROR_OVERFLOW => Error::Overflow,
            TEE_ERROR_TARGET_DEAD => Error::TargetDead,
            other => Error::TaDefined(other),
        };
        Some(err)
    }

    /// Short buffer is informational: the caller retries with a larger buffer.
    pub fn is_short_buffer(&self) -> bool {
        matches!(self, Error::ShortBuffer { .. })
    }
}

/// Where a failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ErrorOrigin {
    /// Client API
    Api = 1,
    /// Communication stack between the worlds
    Comms = 2,
    /// TEE kernel (this core)
    Tee = 3,
    /// Inside the Trusted Application
    TrustedApp = 4,
}

/// Error returned from a public session entry point: result code plus origin.
#[derive(Error, Debug)]
#[error("{error} (origin: {origin:?})")]
pub struct TeeError {
    #[source]
    pub error: Error,
    pub origin: ErrorOrigin,
}

impl TeeError {
    pub fn new(error: Error, origin: ErrorOrigin) -> Self {
        Self { error, origin }
    }

    /// Failure raised by the kernel layer
    pub fn tee(error: Error) -> Self {
        Self::new(error, ErrorOrigin::Tee)
    }

    pub fn code(&self) -> u32 {
        self.error.code()
    }
}

/// Result type alias for tacore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for public session entry points
pub type TeeResult<T> = std::result::Result<T, TeeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(Error::ItemNotFound.code(), 0xFFFF_0008);
        assert_eq!(Error::TargetDead.code(), 0xFFFF_3024);
        assert_eq!(Error::ShortBuffer { required: 40 }.code(), 0xFFFF_0010);
        assert_eq!(Error::TaDefined(0x1234).code(), 0x1234);
    }

    #[test]
    fn test_from_code() {
        assert!(Error::from_code(TEE_SUCCESS).is_none());
        assert!(matches!(
            Error::from_code(TEE_ERROR_BUSY),
            Some(Error::Busy)
        ));
        assert!(matches!(
            Error::from_code(0x8000_0001),
            Some(Error::TaDefined(0x8000_0001))
        ));
    }

    #[test]
    fn test_tee_error_display() {
        let err = TeeError::tee(Error::Busy);
        assert_eq!(err.code(), TEE_ERROR_BUSY);
        assert!(err.to_string().contains("Tee"));
    }
}
