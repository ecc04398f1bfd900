//! The object graph: a tagged-variant handle over the three live object
//! kinds, plus the Remote and Callback internals.
//!
//! Rather than a C-style vtable with a shared base struct, each kind gets
//! its own `Arc`-backed inner type and [`Object`] is a small enum over
//! them. Reference counting falls straight out of `Arc`'s own atomics —
//! there is no separate `refs` field to manage by hand. The one invariant
//! that *does* need explicit code is ordering: a queued Callback's
//! Namespace-held instances must be relinquished before anything can
//! observe the Callback as fully released; [`crate::namespace::Namespace`]
//! guarantees that by construction (see its module docs).

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use qcomtee_log::{debug, warn};

use crate::driver::{RELEASE_OP, NULL_OBJECT_ID};
use crate::error::QcomResult;
use crate::param::Param;
use crate::root::RootHandle;

/// A capability to a TEE-hosted service, identified by an id the TEE
/// assigned. Its only owned resource is the reserved "release" call sent
/// when the last local reference drops.
pub(crate) struct RemoteInner {
    pub(crate) root: RootHandle,
    pub(crate) object_id: u64,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        let mut result = 0;
        let outcome = self
            .root
            .driver()
            .invoke(RELEASE_OP, self.object_id, &mut []);
        match outcome {
            Ok(r) => result = r,
            Err(e) => warn!("remote object {} release ioctl failed: {e}", self.object_id),
        }
        if result != 0 {
            warn!(
                "remote object {} release reported domain error {result}",
                self.object_id
            );
        }
    }
}

/// Behavior supplied by a locally-hosted Callback object.
///
/// `dispatch` receives the request's parameters and replaces them in place
/// with the response parameters (mirroring the driver's in/out parameter
/// array); its return value becomes the response's domain result code.
pub trait CallbackObject: Send + Sync {
    /// Service one reverse-path invocation.
    fn dispatch(&self, op: u32, params: &mut Vec<Param>) -> QcomResult<()>;

    /// Whether this object supports `op`. Checked before `dispatch` is
    /// called; the default accepts everything.
    fn supported(&self, _op: u32) -> bool {
        true
    }

    /// Called after a dispatch response failed to reach the TEE, or after
    /// an outbound marshal failure forced an error response, so the
    /// subclass can release anything it handed off to the response it
    /// thought would be delivered.
    fn on_transport_error(&self, _err: &io::Error) {}
}

/// The userspace side of a locally-hosted Callback object: the
/// user-supplied behavior plus the bookkeeping the Namespace and marshaling
/// layers need.
pub(crate) struct CallbackInner {
    pub(crate) root: RootHandle,
    object_id: AtomicU64,
    queued: AtomicBool,
    pub(crate) ops: Box<dyn CallbackObject>,
}

impl CallbackInner {
    pub(crate) fn new(root: RootHandle, ops: Box<dyn CallbackObject>) -> Arc<Self> {
        Arc::new(Self {
            root,
            object_id: AtomicU64::new(NULL_OBJECT_ID),
            queued: AtomicBool::new(false),
            ops,
        })
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn object_id(&self) -> u64 {
        self.object_id.load(Ordering::Acquire)
    }

    /// Called by the Namespace, under its mutex, when assigning a fresh id.
    pub(crate) fn set_queued(&self, id: u64) {
        self.object_id.store(id, Ordering::Release);
        self.queued.store(true, Ordering::Release);
    }

    /// Called by the Namespace, under its mutex, when the last
    /// namespace-held instance is released.
    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
        self.object_id.store(NULL_OBJECT_ID, Ordering::Release);
    }
}

/// A reference-counted handle to one of the three live object kinds, or
/// the boundary sentinel [`Object::Null`].
#[derive(Clone)]
pub enum Object {
    /// The boundary sentinel; accepted wherever an object parameter is
    /// expected, rejected as an invoke target.
    Null,
    /// A Root object, usable as an invoke target.
    Root(RootHandle),
    /// A capability to a TEE-hosted service.
    Remote(Arc<RemoteInner>),
    /// A capability to a locally-hosted service.
    Callback(Arc<CallbackInner>),
}

impl Object {
    /// The Root this object belongs to, if any (Null has none).
    pub(crate) fn root(&self) -> Option<&RootHandle> {
        match self {
            Self::Null => None,
            Self::Root(root) => Some(root),
            Self::Remote(remote) => Some(&remote.root),
            Self::Callback(cb) => Some(&cb.root),
        }
    }

    /// True for the two kinds [`crate::invoker::Invoker::invoke`] accepts.
    pub(crate) fn is_invokable(&self) -> bool {
        matches!(self, Self::Root(_) | Self::Remote(_))
    }

    /// The id used on the wire: the Root's null marker, the TEE-assigned
    /// id, or the Namespace-assigned id (only meaningful while queued).
    pub(crate) fn wire_id(&self) -> u64 {
        match self {
            Self::Null => NULL_OBJECT_ID,
            Self::Root(_) => NULL_OBJECT_ID,
            Self::Remote(remote) => remote.object_id,
            Self::Callback(cb) => cb.object_id(),
        }
    }

    /// True if this is a Callback currently registered in its Root's
    /// Namespace. Always false for the other kinds.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Callback(cb) if cb.is_queued())
    }

    /// The live strong reference count backing this handle, for tests and
    /// diagnostics. `None` for `Null`, which carries no shared state.
    pub fn strong_count(&self) -> Option<usize> {
        match self {
            Self::Null => None,
            Self::Root(root) => Some(Arc::strong_count(root)),
            Self::Remote(remote) => Some(Arc::strong_count(remote)),
            Self::Callback(cb) => Some(Arc::strong_count(cb)),
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "Object::Null"),
            Self::Root(_) => write!(f, "Object::Root"),
            Self::Remote(r) => write!(f, "Object::Remote({})", r.object_id),
            Self::Callback(c) => write!(f, "Object::Callback(id={:?}, queued={})", c.object_id(), c.is_queued()),
        }
    }
}

/// Build a Remote object handle for a TEE-assigned id, taking a fresh
/// counted reference on `root`.
pub(crate) fn remote_from_id(root: &RootHandle, object_id: u64) -> Object {
    debug!("constructing remote object id={object_id}");
    Object::Remote(Arc::new(RemoteInner {
        root: root.clone(),
        object_id,
    }))
}
