//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Structurally invalid bytes (short header, bad version, unknown tag,
    /// length mismatch, trailing data)
    #[error("malformed: {0}")]
    Malformed(&'static str),

    /// Type tag outside the known core tags and the extension range
    #[error("unknown type {0:#04x}")]
    Type(u8),

    /// Size limit exceeded while encoding
    #[error("size limit exceeded: {0}")]
    Size(usize),
}

/// Error returned by the packet codec's parse operation.
///
/// Callers drop the offending packet without side effects.
pub type DecodeError = WireError;
