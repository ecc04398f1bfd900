//! The reverse-path worker pool: blocks on the driver for TEE-issued
//! requests, dispatches them to local Callback objects, and replies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use qcomtee_log::{debug, instrument, warn};

use crate::driver::{RELEASE_OP, SupplicantRequest, WireParam};
use crate::error::QcomError;
use crate::marshal::{reverse_in, reverse_out};
use crate::object::CallbackInner;
use crate::root::RootHandle;

/// Scratch buffer size handed to the driver per supplicant receive, for it
/// to land `UBUF_INPUT` payloads into.
pub const SUPPLICANT_SCRATCH_LEN: usize = 1024;

struct WorkerSlot {
    /// The Callback currently mid-dispatch on this worker, if any — read by
    /// Root teardown to release a reference a cancelled worker was holding.
    current: Mutex<Option<Arc<CallbackInner>>>,
}

/// Shared state backing a pool of worker threads, each running
/// [`process_one`] until cancelled or the driver reports an unrecoverable
/// error.
pub(crate) struct Supplicant {
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
    waiters: Arc<AtomicUsize>,
    slots: Arc<Vec<WorkerSlot>>,
    cap: usize,
    spawned: Arc<AtomicUsize>,
    root: RootHandle,
}

impl Supplicant {
    /// Hard cap on the worker pool.
    pub(crate) const MAX_WORKERS: usize = 4;

    /// Start a pool of up to `worker_threads` workers (at least one is
    /// spawned immediately; the rest come online elastically per the
    /// waiter-count policy).
    pub(crate) fn spawn(root: RootHandle, worker_threads: usize) -> Self {
        let cap = worker_threads.min(Self::MAX_WORKERS).max(1);
        let slots = Arc::new((0..cap).map(|_| WorkerSlot { current: Mutex::new(None) }).collect::<Vec<_>>());
        let pool = Self {
            handles: Mutex::new(Vec::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            waiters: Arc::new(AtomicUsize::new(0)),
            slots,
            cap,
            spawned: Arc::new(AtomicUsize::new(0)),
            root,
        };
        pool.spawn_one();
        pool
    }

    fn spawn_one(&self) {
        let slot_index = self.spawned.fetch_add(1, Ordering::AcqRel);
        if slot_index >= self.cap {
            self.spawned.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let root = self.root.clone();
        let cancel = self.cancel.clone();
        let waiters = self.waiters.clone();
        let slots = self.slots.clone();
        let cap = self.cap;
        let spawned = self.spawned.clone();
        let handle = std::thread::Builder::new()
            .name(format!("qcomtee-supplicant-{slot_index}"))
            .spawn(move || worker_loop(root, cancel, waiters, slots, slot_index, cap, spawned))
            .expect("failed to spawn supplicant worker thread");
        self.handles.lock().unwrap().push(handle);
    }

    /// Cancel every worker and release whatever Callback reference a
    /// cancelled worker was mid-dispatch on, then join all threads.
    pub(crate) fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        self.root.driver().interrupt();
        for slot in self.slots.iter() {
            if let Some(held) = slot.current.lock().unwrap().take() {
                debug!("releasing mid-dispatch callback reference during teardown");
                drop(held);
            }
        }
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

fn worker_loop(
    root: RootHandle,
    cancel: Arc<AtomicBool>,
    waiters: Arc<AtomicUsize>,
    slots: Arc<Vec<WorkerSlot>>,
    slot_index: usize,
    cap: usize,
    spawned: Arc<AtomicUsize>,
) {
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        match process_one(&root, &cancel, &waiters, &slots, slot_index, cap, &spawned) {
            Ok(()) => {}
            Err(_) => break,
        }
    }
}

/// Spawn the next worker if the elastic policy calls for it: this worker
/// was the last one blocked in receive (post-decrement waiters==0) and the
/// pool has not reached its cap. Done before dispatch so concurrent
/// reverse calls can pick up a fresh worker promptly even if this call's
/// dispatch blocks.
fn maybe_spawn_next(
    root: &RootHandle,
    cancel: &Arc<AtomicBool>,
    waiters: &Arc<AtomicUsize>,
    slots: &Arc<Vec<WorkerSlot>>,
    cap: usize,
    spawned: &Arc<AtomicUsize>,
) {
    let next_index = spawned.load(Ordering::Acquire);
    if next_index >= cap {
        return;
    }
    let claimed = spawned.fetch_add(1, Ordering::AcqRel);
    if claimed >= cap {
        spawned.fetch_sub(1, Ordering::AcqRel);
        return;
    }
    let root = root.clone();
    let cancel = cancel.clone();
    let waiters = waiters.clone();
    let slots = slots.clone();
    let spawned = spawned.clone();
    let _ = std::thread::Builder::new()
        .name(format!("qcomtee-supplicant-{claimed}"))
        .spawn(move || worker_loop(root, cancel, waiters, slots, claimed, cap, spawned));
}

/// One iteration of the dispatcher loop: receive, look up the target,
/// check support, then either release the namespace instance (the
/// reserved release op) or dispatch and respond, leaving the instance
/// queued. Either way the temporary reference the lookup returned is
/// dropped when this function returns, for exactly one net decrement
/// per request.
pub(crate) fn process_one(
    root: &RootHandle,
    cancel: &Arc<AtomicBool>,
    waiters: &Arc<AtomicUsize>,
    slots: &Arc<Vec<WorkerSlot>>,
    slot_index: usize,
    cap: usize,
    spawned: &Arc<AtomicUsize>,
) -> std::io::Result<()> {
    instrument!(qcomtee_log::Level::TRACE, "process_one");

    let mut scratch = vec![0u8; SUPPLICANT_SCRATCH_LEN];
    waiters.fetch_add(1, Ordering::AcqRel);
    let received = root.driver().supplicant_recv(&mut scratch);
    let remaining = waiters.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 {
        maybe_spawn_next(root, cancel, waiters, slots, cap, spawned);
    }

    let request = match received {
        Ok(request) => request,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Err(e),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Err(e),
        Err(e) => {
            warn!("supplicant receive failed: {e}");
            return Err(e);
        }
    };

    let SupplicantRequest {
        target_id,
        request_id,
        op,
        params: wire_in,
    } = request;

    let Some(object) = root.namespace().find(target_id) else {
        send_error(root, request_id, QcomError::Defunct);
        return Ok(());
    };

    if !object.ops.supported(op) {
        if let Err(e) = root.driver().supplicant_send(request_id, QcomError::BadObj.code(), &[]) {
            warn!("supplicant send (unsupported op) failed: {e}");
            object.ops.on_transport_error(&e);
        }
        return Ok(());
    }

    if op == RELEASE_OP {
        // Reserved release: decrement once (matching find's increment), no response expected.
        drop(root.namespace().release_one(target_id));
        return Ok(());
    }

    slots[slot_index].current.lock().unwrap().replace(object.clone());

    let outcome = dispatch_one(root, &object, op, request_id, &wire_in);

    slots[slot_index].current.lock().unwrap().take();

    match outcome {
        DispatchOutcome::Responded { send_result } => {
            if let Err(e) = send_result {
                warn!("supplicant send failed: {e}");
                object.ops.on_transport_error(&e);
            }
        }
        DispatchOutcome::MarshalFailed => {
            let send_result = root.driver().supplicant_send(request_id, QcomError::Unavail.code(), &[]);
            if let Err(e) = &send_result {
                warn!("supplicant send failed after marshal failure: {e}");
            }
            object.ops.on_transport_error(&std::io::Error::new(
                std::io::ErrorKind::Other,
                "reverse marshal failed",
            ));
        }
    }

    Ok(())
}

enum DispatchOutcome {
    Responded { send_result: std::io::Result<()> },
    MarshalFailed,
}

fn dispatch_one(
    root: &RootHandle,
    object: &Arc<CallbackInner>,
    op: u32,
    request_id: u64,
    wire_in: &[WireParam],
) -> DispatchOutcome {
    let mut params = match reverse_in(root, wire_in) {
        Ok(params) => params,
        Err(_) => return DispatchOutcome::MarshalFailed,
    };

    let dispatch_result = object.ops.dispatch(op, &mut params);

    let status = match dispatch_result {
        Ok(()) => match reverse_out(root, &mut params) {
            Ok(wire_out) => {
                let send_result = root.driver().supplicant_send(request_id, 0, &wire_out);
                return DispatchOutcome::Responded { send_result };
            }
            Err(_) => return DispatchOutcome::MarshalFailed,
        },
        Err(e) => e.code(),
    };

    let send_result = root.driver().supplicant_send(request_id, status, &[]);
    DispatchOutcome::Responded { send_result }
}

fn send_error(root: &RootHandle, request_id: u64, err: QcomError) {
    if let Err(e) = root.driver().supplicant_send(request_id, err.code(), &[]) {
        warn!("supplicant send (error response) failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::StubDriver;
    use crate::object::CallbackObject;
    use crate::param::Param;
    use crate::root::RootBuilder;

    struct Noop;
    impl CallbackObject for Noop {
        fn dispatch(&self, _op: u32, _params: &mut Vec<Param>) -> crate::error::QcomResult<()> {
            Ok(())
        }
    }

    #[test]
    fn release_op_decrements_without_sending() {
        let stub = Arc::new(StubDriver::new());
        let root = RootBuilder::new().driver(stub.clone()).build_handle();
        let cb = CallbackInner::new(root.clone(), Box::new(Noop));
        let id = root.namespace().insert(&cb).unwrap();

        stub.push_supplicant_request(SupplicantRequest {
            target_id: id,
            request_id: 1,
            op: RELEASE_OP,
            params: vec![],
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let waiters = Arc::new(AtomicUsize::new(0));
        let slots = Arc::new(vec![WorkerSlot { current: Mutex::new(None) }]);
        let spawned = Arc::new(AtomicUsize::new(1));
        process_one(&root, &cancel, &waiters, &slots, 0, 1, &spawned).unwrap();

        assert!(stub.send_log().is_empty());
        assert!(root.namespace().find(id).is_none());
    }

    #[test]
    fn defunct_target_sends_error_response() {
        let stub = Arc::new(StubDriver::new());
        let root = RootBuilder::new().driver(stub.clone()).build_handle();

        stub.push_supplicant_request(SupplicantRequest {
            target_id: 123,
            request_id: 7,
            op: 1,
            params: vec![],
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let waiters = Arc::new(AtomicUsize::new(0));
        let slots = Arc::new(vec![WorkerSlot { current: Mutex::new(None) }]);
        let spawned = Arc::new(AtomicUsize::new(1));
        process_one(&root, &cancel, &waiters, &slots, 0, 1, &spawned).unwrap();

        let sent = stub.send_log();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].result, QcomError::Defunct.code());
    }
}
