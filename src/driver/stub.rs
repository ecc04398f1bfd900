//! In-process fake [`TeeDriver`], for tests and for exercising the object
//! graph without a real TEE-capable device.
//!
//! Unscripted calls behave like a trivial loopback: `invoke` reports
//! success (`result == 0`) and leaves the wire parameters untouched, which
//! is enough to exercise marshaling for UBUF parameters since forward-in
//! already wrote the buffer's address/capacity and the real driver would
//! only ever update the size in place. Scripted responses let tests drive
//! more interesting scenarios (object-reference returns, domain failures).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{interrupted_error, SupplicantRequest, TeeDriver, WireParam};

/// A scripted reply to the next `invoke` call.
#[derive(Debug, Clone, Default)]
pub struct InvokeResponse {
    /// Domain result code to report.
    pub result: u32,
    /// If present, replaces the wire parameter array the caller observes
    /// after the call (used to simulate the driver minting OBJREF_OUTPUT
    /// ids or rewriting UBUF_OUTPUT sizes).
    pub outputs: Option<Vec<WireParam>>,
}

/// A recorded `invoke` call, kept for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedInvoke {
    /// Operation code passed to `invoke`.
    pub op: u32,
    /// Target object id passed to `invoke`.
    pub object_id: u64,
    /// Wire parameters as observed at call time.
    pub params: Vec<WireParam>,
}

/// A recorded `supplicant_send` call, kept for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    /// Request id the response was submitted for.
    pub request_id: u64,
    /// Domain result code submitted.
    pub result: u32,
    /// Response parameters submitted.
    pub params: Vec<WireParam>,
}

#[derive(Default)]
struct StubState {
    invoke_responses: VecDeque<InvokeResponse>,
    invoke_log: Vec<RecordedInvoke>,
    pending_requests: VecDeque<SupplicantRequest>,
    send_log: Vec<RecordedSend>,
}

/// A fake driver, scriptable from test code via interior mutability so it
/// can be shared (e.g. `Arc<StubDriver>`) between the test and the
/// supplicant threads it drives.
#[derive(Default)]
pub struct StubDriver {
    state: Mutex<StubState>,
    interrupted: AtomicBool,
}

impl StubDriver {
    /// A fresh stub with no scripted responses or queued requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `invoke` call.
    pub fn push_invoke_response(&self, response: InvokeResponse) {
        self.state.lock().unwrap().invoke_responses.push_back(response);
    }

    /// Queue a reverse-path request for a supplicant worker to pick up.
    pub fn push_supplicant_request(&self, request: SupplicantRequest) {
        self.state.lock().unwrap().pending_requests.push_back(request);
    }

    /// Snapshot of every `invoke` call observed so far, in order.
    pub fn invoke_log(&self) -> Vec<RecordedInvoke> {
        self.state.lock().unwrap().invoke_log.clone()
    }

    /// Snapshot of every `supplicant_send` call observed so far, in order.
    pub fn send_log(&self) -> Vec<RecordedSend> {
        self.state.lock().unwrap().send_log.clone()
    }
}

/// Sentinel error returned by `supplicant_recv` once the scripted request
/// queue runs dry, so a worker loop driven by it exits instead of blocking
/// forever.
pub fn queue_drained_error() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "stub supplicant queue drained")
}

impl TeeDriver for StubDriver {
    fn invoke(&self, op: u32, object_id: u64, wire_params: &mut [WireParam]) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.invoke_log.push(RecordedInvoke {
            op,
            object_id,
            params: wire_params.to_vec(),
        });
        let Some(response) = state.invoke_responses.pop_front() else {
            return Ok(0);
        };
        if let Some(outputs) = response.outputs {
            let n = outputs.len().min(wire_params.len());
            wire_params[..n].copy_from_slice(&outputs[..n]);
        }
        Ok(response.result)
    }

    fn supplicant_recv(&self, _scratch: &mut [u8]) -> io::Result<SupplicantRequest> {
        if self.interrupted.swap(false, Ordering::AcqRel) {
            return Err(interrupted_error());
        }
        let mut state = self.state.lock().unwrap();
        state.pending_requests.pop_front().ok_or_else(queue_drained_error)
    }

    fn supplicant_send(&self, request_id: u64, result: u32, params: &[WireParam]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.send_log.push(RecordedSend {
            request_id,
            result,
            params: params.to_vec(),
        });
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_invoke_echoes_success() {
        let stub = StubDriver::new();
        let mut params = [WireParam::with_attr(super::super::attr::UBUF_OUTPUT)];
        let result = stub.invoke(0, 1, &mut params).unwrap();
        assert_eq!(result, 0);
    }

    #[test]
    fn drained_queue_is_reported_as_would_block() {
        let stub = StubDriver::new();
        let err = stub.supplicant_recv(&mut []).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
