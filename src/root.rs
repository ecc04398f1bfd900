//! Root object construction and the public [`Root`] handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qcomtee_log::{debug, instrument};

use crate::driver::unix::UnixDriver;
use crate::driver::{NULL_OBJECT_ID, TeeDriver};
use crate::namespace::Namespace;
use crate::object::Object;
use crate::supplicant::Supplicant;

/// Shared guts of a Root: the driver connection and the Namespace, reached
/// through an `Arc` by every Remote and Callback object under it (their
/// "counted reference to Root").
pub(crate) struct RootInner {
    driver: Box<dyn TeeDriver>,
    namespace: Namespace,
    close_hook: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// The `Arc` type Remote and Callback objects hold as their back-pointer.
pub(crate) type RootHandle = Arc<RootInner>;

impl RootInner {
    pub(crate) fn driver(&self) -> &dyn TeeDriver {
        self.driver.as_ref()
    }

    pub(crate) fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}

impl Drop for RootInner {
    fn drop(&mut self) {
        debug!("root resources released");
        if let Some(hook) = self.close_hook.lock().unwrap().take() {
            hook();
        }
        // `driver` and `namespace` drop here: for `UnixDriver` that closes
        // the device fd and the interrupt eventfd.
    }
}

/// An open connection to the TEE driver: owns the device, the Namespace of
/// exported Callback objects, and the Supplicant worker pool servicing
/// reverse-path requests.
///
/// `Root` is a unique, non-`Clone` handle — much like a [`std::fs::File`]
/// or a thread pool join guard. Remote and Callback objects created
/// through it keep the driver and Namespace alive via their own internal
/// `Arc<RootInner>`, but only dropping this handle triggers teardown:
/// cancelling and joining the Supplicant pool, then forcibly draining any
/// Callback objects the TEE never released (see
/// [`crate::namespace::Namespace::drain`] for why that step exists).
pub struct Root {
    pub(crate) inner: RootHandle,
    supplicant: Supplicant,
    shutdown_started: AtomicBool,
}

impl Root {
    /// Start building a Root against `devname`.
    pub fn builder() -> RootBuilder {
        RootBuilder::new()
    }

    /// This Root, usable as an invoke target.
    pub fn as_object(&self) -> Object {
        Object::Root(self.inner.clone())
    }

    /// Build a locally-hosted Callback object under this Root from
    /// caller-supplied behavior. Not queued in the Namespace until the
    /// first successful marshal that transfers it (forward-in or
    /// reverse-out).
    pub fn callback(&self, ops: Box<dyn crate::object::CallbackObject>) -> Object {
        Object::Callback(crate::object::CallbackInner::new(self.inner.clone(), ops))
    }

    /// Namespace-assigned id this Root uses on the wire for itself.
    pub(crate) fn null_id() -> u64 {
        NULL_OBJECT_ID
    }

    fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        instrument!(qcomtee_log::Level::DEBUG, "root_shutdown");
        self.supplicant.shutdown();
        // Break the Namespace -> Callback -> Root cycle for any Callback
        // the TEE never got around to releasing.
        let drained = self.inner.namespace.drain();
        drop(drained);
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Root`], mirroring the configuration-struct pattern used
/// elsewhere in this codebase (worker pool sizing, an optional close hook).
pub struct RootBuilder {
    device_path: std::path::PathBuf,
    worker_threads: usize,
    close_hook: Option<Box<dyn FnOnce() + Send>>,
    driver: Option<Arc<dyn TeeDriver>>,
}

impl RootBuilder {
    /// A builder defaulting to `/dev/tee0` and a 4-worker Supplicant pool.
    pub fn new() -> Self {
        Self {
            device_path: "/dev/tee0".into(),
            worker_threads: Supplicant::MAX_WORKERS,
            close_hook: None,
            driver: None,
        }
    }

    /// Override the device path (default `/dev/tee0`).
    pub fn device_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Cap the Supplicant worker pool (default and maximum: 4).
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.min(Supplicant::MAX_WORKERS).max(1);
        self
    }

    /// Run `hook` exactly once, after all Remote/Callback objects under
    /// this Root are gone and the Supplicant pool has joined.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.close_hook = Some(Box::new(hook));
        self
    }

    /// Use a pre-built driver instead of opening `device_path`. Intended
    /// for tests (a [`crate::driver::stub::StubDriver`]) and for embedding
    /// in a process that already owns the fd.
    pub fn driver(mut self, driver: Arc<dyn TeeDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Open the device (or adopt the driver set via [`Self::driver`]),
    /// initialize an empty Namespace, and start the Supplicant pool.
    pub fn build(self) -> std::io::Result<Root> {
        let driver: Box<dyn TeeDriver> = match self.driver {
            Some(driver) => Box::new(ArcDriver(driver)),
            None => Box::new(UnixDriver::open(&self.device_path)?),
        };
        let inner = Arc::new(RootInner {
            driver,
            namespace: Namespace::new(),
            close_hook: std::sync::Mutex::new(self.close_hook),
        });
        let supplicant = Supplicant::spawn(inner.clone(), self.worker_threads);
        Ok(Root {
            inner,
            supplicant,
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Build just the [`RootHandle`] guts with no Supplicant pool, for
    /// tests that only need a Root back-pointer (e.g. Namespace unit
    /// tests).
    #[cfg(test)]
    pub(crate) fn build_handle(self) -> RootHandle {
        let driver: Box<dyn TeeDriver> = match self.driver {
            Some(driver) => Box::new(ArcDriver(driver)),
            None => Box::new(UnixDriver::open(&self.device_path).expect("test driver")),
        };
        Arc::new(RootInner {
            driver,
            namespace: Namespace::new(),
            close_hook: std::sync::Mutex::new(self.close_hook),
        })
    }
}

impl Default for RootBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts a shared `Arc<dyn TeeDriver>` (as handed to [`RootBuilder::driver`])
/// to the `Box<dyn TeeDriver>` `RootInner` stores.
struct ArcDriver(Arc<dyn TeeDriver>);

impl TeeDriver for ArcDriver {
    fn invoke(
        &self,
        op: u32,
        object_id: u64,
        wire_params: &mut [crate::driver::WireParam],
    ) -> std::io::Result<u32> {
        self.0.invoke(op, object_id, wire_params)
    }

    fn supplicant_recv(&self, scratch: &mut [u8]) -> std::io::Result<crate::driver::SupplicantRequest> {
        self.0.supplicant_recv(scratch)
    }

    fn supplicant_send(
        &self,
        request_id: u64,
        result: u32,
        params: &[crate::driver::WireParam],
    ) -> std::io::Result<()> {
        self.0.supplicant_send(request_id, result, params)
    }

    fn interrupt(&self) {
        self.0.interrupt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::StubDriver;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[test]
    fn close_hook_runs_once_on_drop() {
        let called = Arc::new(StdAtomicBool::new(false));
        let called_clone = called.clone();
        let root = RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .worker_threads(1)
            .on_close(move || called_clone.store(true, Ordering::SeqCst))
            .build()
            .unwrap();
        drop(root);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn close_hook_runs_even_without_explicit_hook() {
        let root = RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .worker_threads(1)
            .build()
            .unwrap();
        drop(root);
    }
}
