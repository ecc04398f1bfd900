//! The internal parameter shape, independent of the driver's wire layout.
//!
//! A [`Param`] is the tagged union callers and callback dispatch handlers
//! build and read: a user buffer going in or out, or an object reference
//! going in or out. [`crate::marshal`] converts arrays of these to and from
//! the driver's [`crate::driver::WireParam`] shape.

use crate::error::{QcomError, QcomResult};
use crate::object::Object;

/// Maximum number of data parameters accepted by a callback dispatch,
/// mirroring the driver's per-request parameter array.
pub const DISPATCH_PARAMS_MAX: usize = 10;

/// Maximum number of parameters accepted by a single forward-path invoke.
pub const MAX_INVOKE_PARAMS: usize = 64;

/// An owned user buffer with a distinct capacity and "valid length".
///
/// The driver copies into or out of the buffer's storage during an
/// invocation; only the first `len` bytes are meaningful.
#[derive(Debug, Clone, Default)]
pub struct UBuf {
    bytes: Vec<u8>,
    len: usize,
}

impl UBuf {
    /// Build a buffer carrying `data` as its full valid contents (INPUT use).
    pub fn input(data: impl Into<Vec<u8>>) -> Self {
        let bytes = data.into();
        let len = bytes.len();
        Self { bytes, len }
    }

    /// Build an empty buffer with room for up to `capacity` bytes of
    /// output (OUTPUT use).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity],
            len: 0,
        }
    }

    /// The valid portion of the buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Total storage available, i.e. the maximum size the driver may fill.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Current valid length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the valid length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// Record how much of the buffer the driver actually filled or
    /// consumed. Fails if the reported length exceeds the backing storage.
    pub(crate) fn set_len(&mut self, len: usize) -> QcomResult<()> {
        if len > self.bytes.len() {
            return Err(QcomError::SizeOut);
        }
        self.len = len;
        Ok(())
    }
}

/// One marshaled parameter: a data buffer or object reference, flowing in
/// or out.
#[derive(Debug)]
pub enum Param {
    /// A user buffer supplying data to the callee.
    BufIn(UBuf),
    /// A user buffer the callee fills in; starts with its capacity set and
    /// no valid bytes.
    BufOut(UBuf),
    /// An object reference supplied to the callee. Consumed on success per
    /// the forward/reverse-path ownership rules.
    ObjIn(Object),
    /// A slot for an object reference the callee produces. Starts as
    /// [`Object::Null`] and is replaced by the `*_out` marshal step.
    ObjOut(Object),
}

impl Param {
    /// Convenience constructor for an empty `ObjOut` slot.
    pub fn obj_out_slot() -> Self {
        Self::ObjOut(Object::Null)
    }

    /// Take the resolved object out of an `ObjOut` parameter, leaving
    /// [`Object::Null`] behind. Panics if called on a non-`ObjOut` variant;
    /// callers only use this after a successful `*_out` marshal pass that
    /// they know produced object-typed slots.
    pub fn take_object(&mut self) -> Object {
        match self {
            Self::ObjOut(obj) => std::mem::replace(obj, Object::Null),
            Self::ObjIn(obj) => std::mem::replace(obj, Object::Null),
            _ => panic!("take_object called on a buffer parameter"),
        }
    }
}
