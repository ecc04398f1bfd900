//! Domain error taxonomy surfaced across the object invocation boundary.
//!
//! QTEE and local callback objects report outcomes as a `u32` result code.
//! [`QcomError`] gives that wire-level code a name on our side of the
//! boundary; [`QcomResult`] is the `Result` alias dispatch handlers and
//! marshaling code return internally.

use std::fmt;

use strum::{AsRefStr, EnumMessage};

/// Start of the object- and interface-defined error range.
pub const USERBASE: u32 = 10;

/// Outcome of an object operation, as reported in the TEE's scalar result
/// or a callback object's dispatch return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumMessage)]
pub enum QcomError {
    /// Generic failure with no further detail.
    #[strum(message = "generic error")]
    Generic,
    /// Parameters, operation code, or argument count were invalid.
    #[strum(message = "invalid request")]
    Invalid,
    /// An input buffer was too large to marshal.
    #[strum(message = "input buffer too large")]
    SizeIn,
    /// An output buffer was too large to marshal.
    #[strum(message = "output buffer too large")]
    SizeOut,
    /// Memory allocation failed.
    #[strum(message = "memory allocation failed")]
    Mem,
    /// Object- or interface-defined error, carrying its raw code (>= [`USERBASE`]).
    #[strum(message = "user-defined error")]
    UserDefined(u32),
    /// Object reference is no longer accessible.
    #[strum(message = "object reference is defunct")]
    Defunct,
    /// The caller must exit.
    #[strum(message = "aborted")]
    Abort,
    /// The invocation was malformed.
    #[strum(message = "malformed invocation")]
    BadObj,
    /// The namespace has no free slots left to export an object.
    #[strum(message = "no namespace slots left")]
    NoSlots,
    /// Too many parameters for the object or transport.
    #[strum(message = "too many parameters")]
    MaxArgs,
    /// Payload exceeds the supported size.
    #[strum(message = "payload too large")]
    MaxData,
    /// Destination process is unavailable; retrying may succeed.
    #[strum(message = "destination unavailable")]
    Unavail,
    /// Memory allocation failed outside of the local or target domain.
    #[strum(message = "kernel memory allocation failed")]
    KMem,
    /// A local-only operation was requested on a remote object.
    #[strum(message = "operation is local-only")]
    Remote,
    /// Destination process is busy.
    #[strum(message = "destination busy")]
    Busy,
    /// A callback invocation timed out.
    #[strum(message = "callback invocation timed out")]
    Timeout,
}

impl QcomError {
    /// Build a `QcomError` from a wire-level result code, treating `0` as
    /// `Ok(())` rather than an error.
    pub fn from_code(code: u32) -> Result<(), Self> {
        let signed = code as i32;
        let err = match signed {
            0 => return Ok(()),
            1 => Self::Generic,
            2 => Self::Invalid,
            3 => Self::SizeIn,
            4 => Self::SizeOut,
            5 => Self::Mem,
            -90 => Self::Defunct,
            -91 => Self::Abort,
            -92 => Self::BadObj,
            -93 => Self::NoSlots,
            -94 => Self::MaxArgs,
            -95 => Self::MaxData,
            -96 => Self::Unavail,
            -97 => Self::KMem,
            -98 => Self::Remote,
            -99 => Self::Busy,
            -103 => Self::Timeout,
            _ => Self::UserDefined(code),
        };
        Err(err)
    }

    /// The wire-level code this error maps back to.
    pub fn code(&self) -> u32 {
        (match self {
            Self::Generic => 1,
            Self::Invalid => 2,
            Self::SizeIn => 3,
            Self::SizeOut => 4,
            Self::Mem => 5,
            Self::UserDefined(code) => return *code,
            Self::Defunct => -90,
            Self::Abort => -91,
            Self::BadObj => -92,
            Self::NoSlots => -93,
            Self::MaxArgs => -94,
            Self::MaxData => -95,
            Self::Unavail => -96,
            Self::KMem => -97,
            Self::Remote => -98,
            Self::Busy => -99,
            Self::Timeout => -103,
        }) as u32
    }
}

impl fmt::Display for QcomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserDefined(code) => write!(f, "user-defined error {code}"),
            other => write!(
                f,
                "{} ({})",
                other.get_message().unwrap_or("qtee error"),
                other.as_ref()
            ),
        }
    }
}

impl std::error::Error for QcomError {}

/// Result type for operations whose failure is a domain-level [`QcomError`]
/// rather than a transport failure.
pub type QcomResult<T> = Result<T, QcomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_code_round_trips() {
        assert_eq!(QcomError::from_code(0), Ok(()));
    }

    #[test]
    fn known_negative_code_round_trips() {
        let code = (-90i32) as u32;
        assert_eq!(QcomError::from_code(code), Err(QcomError::Defunct));
        assert_eq!(QcomError::Defunct.code(), code);
    }

    #[test]
    fn user_defined_code_is_preserved() {
        assert_eq!(QcomError::from_code(42), Err(QcomError::UserDefined(42)));
        assert_eq!(QcomError::UserDefined(42).code(), 42);
    }

    #[test]
    fn display_includes_message() {
        let msg = QcomError::Invalid.to_string();
        assert!(msg.contains("invalid request"));
    }
}
