//! Credentials Callback Object: an immutable byte buffer exposed to the TEE
//! via two operations, "get length" and "read at offset".
//!
//! The blob itself (a CBOR-encoded caller-identity record in the original)
//! is produced elsewhere; this object only serves whatever bytes it is
//! handed, unchanged for its lifetime.

use crate::error::{QcomError, QcomResult};
use crate::object::{CallbackObject, Object};
use crate::param::{Param, UBuf};
use crate::root::Root;

const OP_GET_LENGTH: u32 = 0;
const OP_READ_AT_OFFSET: u32 = 1;

/// A Callback object serving a fixed byte buffer.
pub struct CredentialsObject {
    data: Vec<u8>,
}

impl CredentialsObject {
    /// Wrap an already-built blob (e.g. CBOR-encoded caller credentials) as
    /// a Callback object under `root`.
    pub fn from_bytes(data: Vec<u8>, root: &Root) -> Object {
        root.callback(Box::new(Self { data }))
    }

    /// Build a minimal, non-CBOR placeholder blob (uid + a monotonic
    /// counter) for local testing only. Not wire-compatible with a real
    /// QTEE peer — use [`Self::from_bytes`] with a real encoder otherwise.
    #[cfg(feature = "collect_demo_credentials")]
    pub fn collect(root: &Root, sequence: u64) -> Object {
        let uid = unsafe { libc::getuid() };
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&uid.to_le_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        Self::from_bytes(data, root)
    }
}

impl CallbackObject for CredentialsObject {
    fn dispatch(&self, op: u32, params: &mut Vec<Param>) -> QcomResult<()> {
        match op {
            OP_GET_LENGTH => {
                let [Param::BufOut(out)] = params.as_mut_slice() else {
                    return Err(QcomError::Invalid);
                };
                write_le_u64(out, self.data.len() as u64)
            }
            OP_READ_AT_OFFSET => {
                let [Param::BufIn(offset_buf), Param::BufOut(out)] = params.as_mut_slice() else {
                    return Err(QcomError::Invalid);
                };
                let offset_bytes: [u8; 8] = offset_buf
                    .as_slice()
                    .try_into()
                    .map_err(|_| QcomError::Invalid)?;
                let offset = u64::from_le_bytes(offset_bytes) as usize;
                if offset >= self.data.len() {
                    return Err(QcomError::Invalid);
                }
                let available = &self.data[offset..];
                let n = available.len().min(out.capacity());
                write_bytes(out, &available[..n])
            }
            _ => Err(QcomError::Invalid),
        }
    }
}

fn write_le_u64(out: &mut UBuf, value: u64) -> QcomResult<()> {
    write_bytes(out, &value.to_le_bytes())
}

fn write_bytes(out: &mut UBuf, bytes: &[u8]) -> QcomResult<()> {
    if bytes.len() > out.capacity() {
        return Err(QcomError::SizeOut);
    }
    // SAFETY: `bytes.len() <= out.capacity()`, checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.as_mut_ptr(), bytes.len());
    }
    out.set_len(bytes.len()).map_err(|_| QcomError::SizeOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::StubDriver;
    use crate::root::RootBuilder;
    use std::sync::Arc;

    fn test_root() -> Root {
        RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .worker_threads(1)
            .build()
            .unwrap()
    }

    fn dispatch(object: &Object, op: u32, params: &mut Vec<Param>) -> QcomResult<()> {
        match object {
            Object::Callback(cb) => cb.ops.dispatch(op, params),
            _ => panic!("expected Callback object"),
        }
    }

    #[test]
    fn get_length_reports_stored_length() {
        let root = test_root();
        let object = CredentialsObject::from_bytes(vec![1, 2, 3, 4, 5], &root);
        let mut params = vec![Param::BufOut(UBuf::with_capacity(8))];
        dispatch(&object, OP_GET_LENGTH, &mut params).unwrap();
        match &params[0] {
            Param::BufOut(out) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(out.as_slice());
                assert_eq!(u64::from_le_bytes(buf), 5);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn read_at_offset_clips_to_output_capacity() {
        let root = test_root();
        let object = CredentialsObject::from_bytes(b"hello world".to_vec(), &root);
        let mut params = vec![
            Param::BufIn(UBuf::input(6u64.to_le_bytes().to_vec())),
            Param::BufOut(UBuf::with_capacity(3)),
        ];
        dispatch(&object, OP_READ_AT_OFFSET, &mut params).unwrap();
        match &params[1] {
            Param::BufOut(out) => assert_eq!(out.as_slice(), b"wor"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn read_at_offset_past_end_is_invalid() {
        let root = test_root();
        let object = CredentialsObject::from_bytes(b"hi".to_vec(), &root);
        let mut params = vec![
            Param::BufIn(UBuf::input(5u64.to_le_bytes().to_vec())),
            Param::BufOut(UBuf::with_capacity(3)),
        ];
        assert_eq!(dispatch(&object, OP_READ_AT_OFFSET, &mut params), Err(QcomError::Invalid));
    }
}
