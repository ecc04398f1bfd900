//! Memory Object: a shared buffer the TEE can map independently, backed by
//! a pluggable allocator rather than the real shared-memory ioctl (out of
//! scope; see [`MemoryBackend`]).

use std::sync::{Arc, Mutex};

use crate::error::QcomResult;
use crate::object::{CallbackObject, Object};
use crate::param::Param;
use crate::root::Root;

/// Pluggable allocator standing in for the driver's shared-memory ioctl
/// pair (`TEE_IOC_SHM_ALLOC` plus `mmap`). The real backend is out of
/// scope; this trait is the seam a caller with one can plug into, and
/// [`StubMemoryBackend`] fakes it with a boxed buffer for tests.
pub trait MemoryBackend: Send + Sync {
    /// Allocate `size` bytes of TEE-shareable memory.
    fn alloc(&self, size: usize) -> std::io::Result<Vec<u8>>;

    /// Register an existing allocation for TEE sharing.
    fn register(&self, existing: Vec<u8>) -> std::io::Result<Vec<u8>>;
}

/// An in-process fake [`MemoryBackend`] for tests: "allocation" is just a
/// zeroed `Vec<u8>`, "registration" is an owned copy.
#[derive(Default)]
pub struct StubMemoryBackend;

impl MemoryBackend for StubMemoryBackend {
    fn alloc(&self, size: usize) -> std::io::Result<Vec<u8>> {
        Ok(vec![0u8; size])
    }

    fn register(&self, existing: Vec<u8>) -> std::io::Result<Vec<u8>> {
        Ok(existing)
    }
}

/// The Callback side of a Memory object: holds the shared buffer but
/// exposes no TEE-invokable operations of its own (the driver handles
/// sharing through the allocate/register ioctls, not a dispatch call).
struct MemoryObject {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CallbackObject for MemoryObject {
    fn dispatch(&self, _op: u32, _params: &mut Vec<Param>) -> QcomResult<()> {
        Ok(())
    }
}

/// A shared buffer the TEE can independently map; the local copy remains
/// independently releasable once transferred.
pub struct Memory {
    object: Object,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Memory {
    /// Allocate a fresh `size`-byte buffer via `backend`.
    pub fn alloc(size: usize, backend: &dyn MemoryBackend, root: &Root) -> std::io::Result<Self> {
        let data = backend.alloc(size)?;
        Self::from_buffer(data, root)
    }

    /// Register an existing allocation with `backend`.
    pub fn register(existing: Vec<u8>, backend: &dyn MemoryBackend, root: &Root) -> std::io::Result<Self> {
        let data = backend.register(existing)?;
        Self::from_buffer(data, root)
    }

    fn from_buffer(data: Vec<u8>, root: &Root) -> std::io::Result<Self> {
        let buffer = Arc::new(Mutex::new(data));
        let object = root.callback(Box::new(MemoryObject { buffer: buffer.clone() }));
        Ok(Self { object, buffer })
    }

    /// The Callback handle, usable as an `ObjIn`/`ObjOut` parameter.
    pub fn as_object(&self) -> Object {
        self.object.clone()
    }

    /// Base address of the backing buffer, stable for the lifetime of this
    /// `Memory` (nothing here resizes or reallocates it after construction).
    pub fn addr(&self) -> usize {
        self.buffer.lock().unwrap().as_ptr() as usize
    }

    /// Current buffer size in bytes.
    pub fn size(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Copy out the buffer's current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::StubDriver;
    use crate::root::RootBuilder;

    fn test_root() -> Root {
        RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .worker_threads(1)
            .build()
            .unwrap()
    }

    #[test]
    fn alloc_produces_zeroed_buffer_of_requested_size() {
        let root = test_root();
        let backend = StubMemoryBackend;
        let mem = Memory::alloc(64, &backend, &root).unwrap();
        assert_eq!(mem.size(), 64);
        assert!(mem.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn register_preserves_existing_contents() {
        let root = test_root();
        let backend = StubMemoryBackend;
        let mem = Memory::register(vec![1, 2, 3], &backend, &root).unwrap();
        assert_eq!(mem.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn addr_is_stable_and_nonzero() {
        let root = test_root();
        let backend = StubMemoryBackend;
        let mem = Memory::alloc(64, &backend, &root).unwrap();
        let addr = mem.addr();
        assert_ne!(addr, 0);
        assert_eq!(mem.addr(), addr);
    }
}
