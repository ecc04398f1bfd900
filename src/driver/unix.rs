//! Real [`TeeDriver`] backed by `/dev/tee0`-style character device ioctls.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use super::{attr, SupplicantRequest, TeeDriver, WireParam};
use crate::param::DISPATCH_PARAMS_MAX;

/// Magic number shared by the TEE subsystem's ioctl family.
const TEE_IOC_MAGIC: u8 = 0xa4;

const fn iowr(nr: u8, size: usize) -> libc::c_ulong {
    const IOC_WRITE: libc::c_ulong = 1;
    const IOC_READ: libc::c_ulong = 2;
    const IOC_NRBITS: u32 = 8;
    const IOC_TYPEBITS: u32 = 8;
    const IOC_SIZEBITS: u32 = 14;
    const IOC_DIRBITS: u32 = 2;

    ((IOC_READ | IOC_WRITE) << (IOC_NRBITS + IOC_TYPEBITS + IOC_SIZEBITS))
        | ((TEE_IOC_MAGIC as libc::c_ulong) << IOC_NRBITS)
        | (nr as libc::c_ulong)
        | ((size as libc::c_ulong) << (IOC_NRBITS + IOC_TYPEBITS + IOC_DIRBITS))
}

const TEE_IOC_OBJECT_INVOKE: libc::c_ulong = iowr(10, std::mem::size_of::<BufData>());
const TEE_IOC_SUPPL_RECV: libc::c_ulong = iowr(11, std::mem::size_of::<BufData>());
const TEE_IOC_SUPPL_SEND: libc::c_ulong = iowr(12, std::mem::size_of::<BufData>());

/// Mirrors `struct tee_ioctl_buf_data`: a pointer/length pair describing an
/// argument buffer laid out as a small header followed by a `WireParam`
/// array.
#[repr(C)]
struct BufData {
    buf_len: u64,
    buf_ptr: u64,
}

/// Mirrors the header shared by `TEE_IOC_OBJECT_INVOKE`'s argument buffer.
#[repr(C)]
struct InvokeHeader {
    ret: u32,
    op: u32,
    object_id: u64,
    num_params: u32,
    _reserved: u32,
}

/// Mirrors the header of a supplicant-receive argument buffer.
#[repr(C)]
struct RecvHeader {
    num_params: u32,
    func: u32,
}

/// Mirrors the header of a supplicant-send argument buffer.
#[repr(C)]
struct SendHeader {
    ret: u32,
    num_params: u32,
}

/// A [`TeeDriver`] that talks to a real kernel character device.
///
/// Holds an auxiliary eventfd alongside the device fd purely so
/// [`TeeDriver::interrupt`] can wake a worker parked in
/// `supplicant_recv`'s blocking ioctl, per the design notes on
/// cancellation (an auxiliary fd poked during teardown, rather than
/// async-cancelling the thread outright).
pub struct UnixDriver {
    file: File,
    event_fd: RawFd,
}

impl UnixDriver {
    /// Open `path` (canonically `/dev/tee0`) for read/write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if event_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file, event_fd })
    }

    fn raw_ioctl(&self, request: libc::c_ulong, buf: &BufData) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request, buf as *const BufData) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Poll the device fd alongside the interrupt eventfd before issuing a
    /// blocking ioctl, so a pending `interrupt()` call can unblock a
    /// supplicant worker instead of leaving it stuck in the (from
    /// userspace, uninterruptible) ioctl itself.
    fn wait_readable_or_interrupted(&self) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.event_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if fds[1].revents & libc::POLLIN != 0 {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(self.event_fd, buf.as_mut_ptr().cast(), buf.len());
            }
            return Err(super::interrupted_error());
        }
        Ok(())
    }
}

impl Drop for UnixDriver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.event_fd);
        }
    }
}

impl AsRawFd for UnixDriver {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl TeeDriver for UnixDriver {
    fn invoke(&self, op: u32, object_id: u64, wire_params: &mut [WireParam]) -> io::Result<u32> {
        let mut arg = Vec::<u8>::with_capacity(
            std::mem::size_of::<InvokeHeader>()
                + wire_params.len() * std::mem::size_of::<WireParam>(),
        );
        // SAFETY: `arg` is sized exactly for the header followed by the
        // parameter array; both are `repr(C)` plain-old-data types and the
        // kernel only ever reads/writes within that layout.
        unsafe {
            let header = InvokeHeader {
                ret: 0,
                op,
                object_id,
                num_params: wire_params.len() as u32,
                _reserved: 0,
            };
            let header_ptr = arg.as_mut_ptr().cast::<InvokeHeader>();
            header_ptr.write(header);
            let params_ptr = header_ptr.add(1).cast::<WireParam>();
            params_ptr.copy_from_nonoverlapping(wire_params.as_ptr(), wire_params.len());
            arg.set_len(arg.capacity());
        }

        let buf = BufData {
            buf_len: arg.len() as u64,
            buf_ptr: arg.as_ptr() as u64,
        };
        self.raw_ioctl(TEE_IOC_OBJECT_INVOKE, &buf)?;

        // SAFETY: same layout as above, now read back.
        unsafe {
            let header_ptr = arg.as_ptr().cast::<InvokeHeader>();
            let result = (*header_ptr).ret;
            let params_ptr = header_ptr.add(1).cast::<WireParam>();
            std::ptr::copy_nonoverlapping(params_ptr, wire_params.as_mut_ptr(), wire_params.len());
            Ok(result)
        }
    }

    fn supplicant_recv(&self, scratch: &mut [u8]) -> io::Result<SupplicantRequest> {
        let num_params = DISPATCH_PARAMS_MAX + 1;
        let mut arg = Vec::<u8>::with_capacity(
            std::mem::size_of::<RecvHeader>() + num_params * std::mem::size_of::<WireParam>(),
        );
        // SAFETY: see `invoke`; layout matches RecvHeader followed by a
        // fixed-size WireParam array, the first of which is the meta
        // parameter carrying the scratch buffer pointer/length.
        unsafe {
            let header = RecvHeader {
                num_params: num_params as u32,
                func: 0,
            };
            let header_ptr = arg.as_mut_ptr().cast::<RecvHeader>();
            header_ptr.write(header);
            let params_ptr = header_ptr.add(1).cast::<WireParam>();
            params_ptr.write(WireParam {
                attr: attr::VALUE_INOUT | attr::META,
                a: scratch.as_mut_ptr() as u64,
                b: scratch.len() as u64,
                c: 0,
            });
            for i in 1..num_params {
                params_ptr.add(i).write(WireParam::default());
            }
            arg.set_len(arg.capacity());
        }

        let buf = BufData {
            buf_len: arg.len() as u64,
            buf_ptr: arg.as_ptr() as u64,
        };
        self.wait_readable_or_interrupted()?;
        self.raw_ioctl(TEE_IOC_SUPPL_RECV, &buf)?;

        // SAFETY: read back the same layout the kernel just filled in.
        unsafe {
            let header_ptr = arg.as_ptr().cast::<RecvHeader>();
            let op = (*header_ptr).func;
            let params_ptr = header_ptr.add(1).cast::<WireParam>();
            let meta = params_ptr.read();
            let target_id = meta.a;
            let request_id = meta.b;
            let mut params = Vec::with_capacity(num_params - 1);
            for i in 1..num_params {
                params.push(params_ptr.add(i).read());
            }
            Ok(SupplicantRequest {
                target_id,
                request_id,
                op,
                params,
            })
        }
    }

    fn supplicant_send(&self, request_id: u64, result: u32, params: &[WireParam]) -> io::Result<()> {
        let num_params = params.len() + 1;
        let mut arg = Vec::<u8>::with_capacity(
            std::mem::size_of::<SendHeader>() + num_params * std::mem::size_of::<WireParam>(),
        );
        // SAFETY: see `invoke`; SendHeader followed by a meta parameter and
        // the caller-supplied response parameters.
        unsafe {
            let header = SendHeader {
                ret: result,
                num_params: num_params as u32,
            };
            let header_ptr = arg.as_mut_ptr().cast::<SendHeader>();
            header_ptr.write(header);
            let params_ptr = header_ptr.add(1).cast::<WireParam>();
            params_ptr.write(WireParam {
                attr: attr::VALUE_OUTPUT | attr::META,
                a: request_id,
                b: 0,
                c: 0,
            });
            params_ptr.add(1).copy_from_nonoverlapping(params.as_ptr(), params.len());
            arg.set_len(arg.capacity());
        }

        let buf = BufData {
            buf_len: arg.len() as u64,
            buf_ptr: arg.as_ptr() as u64,
        };
        self.raw_ioctl(TEE_IOC_SUPPL_SEND, &buf)
    }

    fn interrupt(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.event_fd, (&one as *const u64).cast(), 8);
        }
    }
}
