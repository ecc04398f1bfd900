//! Wire-level constants and the [`TeeDriver`] abstraction over the kernel
//! driver's three ioctls (object invoke, supplicant receive, supplicant
//! send).
//!
//! This module only describes shapes and the trait; [`unix`] is the real
//! backend built on `libc::ioctl`, and [`stub`] is an in-process fake used
//! by tests and by callers without a TEE-capable device to exercise the
//! rest of the crate against.

use std::io;

pub mod stub;
pub mod unix;

/// Parameter attribute tags understood by the driver, matching
/// `TEE_IOCTL_PARAM_ATTR_TYPE_*` plus the qcomtee driver's object-reference
/// extensions.
pub mod attr {
    /// A user buffer supplying data, copied by the driver on the way in.
    pub const UBUF_INPUT: u64 = 0x8;
    /// A user buffer the driver fills in on the way out.
    pub const UBUF_OUTPUT: u64 = 0x9;
    /// An object reference supplying a capability.
    pub const OBJREF_INPUT: u64 = 0xB;
    /// An object reference slot to be filled by the callee.
    pub const OBJREF_OUTPUT: u64 = 0xC;
    /// A plain in/out scalar value, used for the meta parameter on the
    /// supplicant receive path.
    pub const VALUE_INOUT: u64 = 0x3;
    /// A plain output scalar value, used for the meta parameter on the
    /// supplicant send path.
    pub const VALUE_OUTPUT: u64 = 0x2;
    /// Flag OR'd into the attribute of the leading meta parameter of a
    /// supplicant receive/send argument buffer.
    pub const META: u64 = 0x100;
}

/// Sentinel object id denoting "null" on the wire.
pub const NULL_OBJECT_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Flag bit set in a `OBJREF_*` parameter's `b` field when the id names a
/// locally-hosted (callback) object rather than a TEE-hosted one.
pub const OBJREF_USER: u64 = 1 << 0;

/// The reserved operation code meaning "release this object".
pub const RELEASE_OP: u32 = 65536;

/// One driver-shape parameter: `{attr, a, b, c}`, the meaning of `a`/`b`/`c`
/// depending on `attr` (see [`attr`]).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct WireParam {
    /// Attribute tag, one of the constants in [`attr`].
    pub attr: u64,
    /// First scalar field; meaning depends on `attr`.
    pub a: u64,
    /// Second scalar field; meaning depends on `attr`.
    pub b: u64,
    /// Third scalar field, currently unused by any tag but present for
    /// layout parity with the driver ABI.
    pub c: u64,
}

impl WireParam {
    /// A zeroed parameter with the given attribute tag.
    pub fn with_attr(attr: u64) -> Self {
        Self {
            attr,
            a: 0,
            b: 0,
            c: 0,
        }
    }
}

/// A reverse-path request as delivered by the driver's supplicant-receive
/// ioctl.
#[derive(Debug)]
pub struct SupplicantRequest {
    /// Namespace id of the target Callback object.
    pub target_id: u64,
    /// Opaque id the driver uses to match the eventual response.
    pub request_id: u64,
    /// Operation code requested.
    pub op: u32,
    /// The request's parameter array (excluding the meta parameter).
    pub params: Vec<WireParam>,
}

/// Abstraction over the three ioctls the runtime issues against the TEE
/// character device. Implemented by [`unix::UnixDriver`] for the real
/// device and by [`stub::StubDriver`] for tests.
pub trait TeeDriver: Send + Sync {
    /// Issue `TEE_IOC_OBJECT_INVOKE`. `wire_params` is populated on input
    /// with forward-in marshaled parameters and updated in place with
    /// forward-out data on a successful (`Ok`) domain result. Returns the
    /// TEE's scalar result code; an `Err` here is a transport failure, not
    /// a domain one.
    fn invoke(&self, op: u32, object_id: u64, wire_params: &mut [WireParam]) -> io::Result<u32>;

    /// Issue `TEE_IOC_SUPPL_RECV`, blocking until a reverse-path request
    /// arrives. `scratch` is the buffer the driver may use to land
    /// `UBUF_INPUT` payloads for the request.
    fn supplicant_recv(&self, scratch: &mut [u8]) -> io::Result<SupplicantRequest>;

    /// Issue `TEE_IOC_SUPPL_SEND`, submitting the response to
    /// `request_id` with scalar result `result` and the given outbound
    /// parameters.
    fn supplicant_send(&self, request_id: u64, result: u32, params: &[WireParam]) -> io::Result<()>;

    /// Wake any worker currently blocked in [`Self::supplicant_recv`] so it
    /// observes cancellation instead of waiting indefinitely. Default
    /// no-op backends (like the stub) don't need it; [`unix::UnixDriver`]
    /// implements it with an auxiliary eventfd per the design notes on
    /// cancellation.
    fn interrupt(&self) {}
}

/// Error kind used by [`TeeDriver::supplicant_recv`] implementations to
/// report that [`TeeDriver::interrupt`] woke the call rather than a real
/// request arriving.
pub fn interrupted_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "supplicant worker interrupted")
}
