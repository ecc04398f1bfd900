//! Pure translators between the internal [`Param`] shape and the driver's
//! [`WireParam`] shape, one pair per direction of travel.
//!
//! Each function embeds the object-capability transfer rules for that
//! direction. None of them unwind partial work on failure beyond what is
//! explicitly documented below (see the crate-level design notes on the
//! Namespace-insert open question): a Callback queued by an earlier
//! parameter in the same call stays queued even if a later parameter fails
//! to marshal.

use qcomtee_log::trace;

use crate::driver::{attr, OBJREF_USER, NULL_OBJECT_ID, WireParam};
use crate::error::{QcomError, QcomResult};
use crate::object::{remote_from_id, CallbackInner};
use crate::param::Param;
use crate::root::RootHandle;

/// Translate caller-built [`Param`]s into the driver's wire shape ahead of
/// an invoke ioctl: the "forward-in" direction of the object-capability
/// transfer rules.
pub(crate) fn forward_in(root: &RootHandle, params: &[Param]) -> QcomResult<Vec<WireParam>> {
    let mut wire = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let w = match param {
            Param::BufIn(buf) => WireParam {
                attr: attr::UBUF_INPUT,
                a: buf.as_ptr() as u64,
                b: buf.len() as u64,
                c: 0,
            },
            Param::BufOut(buf) => WireParam {
                attr: attr::UBUF_OUTPUT,
                a: buf.as_ptr() as u64,
                b: buf.capacity() as u64,
                c: 0,
            },
            Param::ObjIn(obj) => {
                use crate::object::Object;
                match obj {
                    Object::Null => WireParam {
                        attr: attr::OBJREF_INPUT,
                        a: NULL_OBJECT_ID,
                        b: 0,
                        c: 0,
                    },
                    Object::Remote(remote) => WireParam {
                        attr: attr::OBJREF_INPUT,
                        a: remote.object_id,
                        b: 0,
                        c: 0,
                    },
                    Object::Callback(cb) => {
                        if !std::sync::Arc::ptr_eq(&cb.root, root) {
                            return Err(QcomError::BadObj);
                        }
                        let id = root.namespace().insert(cb)?;
                        WireParam {
                            attr: attr::OBJREF_INPUT,
                            a: id,
                            b: OBJREF_USER,
                            c: 0,
                        }
                    }
                    Object::Root(_) => return Err(QcomError::BadObj),
                }
            }
            Param::ObjOut(_) => WireParam::with_attr(attr::OBJREF_OUTPUT),
        };
        trace!("forward_in[{i}]: attr={:#x}", w.attr);
        wire.push(w);
    }
    Ok(wire)
}

/// Translate the driver's wire shape back into [`Param`]s after a
/// successful invoke ("forward-out"): on any `OBJREF_OUTPUT` construction
/// failure, keep scanning so already-constructed Remote objects are still
/// released (dropped) rather than leaked, then report failure as a whole.
pub(crate) fn forward_out(
    root: &RootHandle,
    params: &mut [Param],
    wire: &[WireParam],
) -> QcomResult<()> {
    let mut failed = false;
    for (param, w) in params.iter_mut().zip(wire) {
        match param {
            Param::BufOut(buf) => {
                if buf.set_len(w.b as usize).is_err() {
                    failed = true;
                }
            }
            Param::ObjOut(slot) => {
                *slot = remote_from_id(root, w.a);
            }
            Param::BufIn(_) | Param::ObjIn(_) => {}
        }
    }
    if failed {
        return Err(QcomError::Unavail);
    }
    Ok(())
}

/// Translate a received reverse-path request's wire parameters into
/// [`Param`]s ahead of dispatch ("reverse-in"): `OBJREF_INPUT` with the
/// `USER` flag resolves via this Root's Namespace; otherwise a fresh
/// Remote object is constructed. On any failure, release every
/// already-resolved object parameter from this same call and fail.
pub(crate) fn reverse_in(root: &RootHandle, wire: &[WireParam]) -> QcomResult<Vec<Param>> {
    let mut params = Vec::with_capacity(wire.len());
    for (i, w) in wire.iter().enumerate() {
        let param = match w.attr {
            attr::UBUF_INPUT => {
                let len = w.b as usize;
                // SAFETY: the driver populated `a`/`b` as a valid
                // pointer/length pair into its own scratch buffer for the
                // duration of this dispatch.
                let bytes = unsafe { std::slice::from_raw_parts(w.a as *const u8, len) }.to_vec();
                Param::BufIn(crate::param::UBuf::input(bytes))
            }
            attr::UBUF_OUTPUT => Param::BufOut(crate::param::UBuf::with_capacity(w.b as usize)),
            attr::OBJREF_INPUT => {
                let resolved = if w.b & OBJREF_USER != 0 {
                    match root.namespace().find(w.a) {
                        Some(cb) => crate::object::Object::Callback(cb),
                        None => {
                            release_resolved(&mut params);
                            return Err(QcomError::Defunct);
                        }
                    }
                } else if w.a == NULL_OBJECT_ID {
                    crate::object::Object::Null
                } else {
                    remote_from_id(root, w.a)
                };
                Param::ObjIn(resolved)
            }
            attr::OBJREF_OUTPUT => Param::obj_out_slot(),
            _ => {
                release_resolved(&mut params);
                return Err(QcomError::Invalid);
            }
        };
        trace!("reverse_in[{i}]: attr={:#x}", w.attr);
        params.push(param);
    }
    Ok(params)
}

fn release_resolved(params: &mut [Param]) {
    for param in params.iter_mut() {
        if let Param::ObjIn(_) = param {
            let _ = param.take_object();
        }
    }
}

/// Translate a dispatch's outgoing [`Param`]s into wire parameters to send
/// back ("reverse-out"), symmetric to forward-in.
pub(crate) fn reverse_out(root: &RootHandle, params: &mut [Param]) -> QcomResult<Vec<WireParam>> {
    let mut wire = Vec::with_capacity(params.len());
    for param in params.iter_mut() {
        let w = match param {
            Param::BufIn(buf) => WireParam {
                attr: attr::UBUF_INPUT,
                a: buf.as_ptr() as u64,
                b: buf.len() as u64,
                c: 0,
            },
            Param::BufOut(buf) => WireParam {
                attr: attr::UBUF_OUTPUT,
                a: buf.as_ptr() as u64,
                b: buf.len() as u64,
                c: 0,
            },
            Param::ObjOut(_) => {
                use crate::object::Object;
                match param.take_object() {
                    Object::Null => WireParam {
                        attr: attr::OBJREF_OUTPUT,
                        a: NULL_OBJECT_ID,
                        b: 0,
                        c: 0,
                    },
                    Object::Remote(remote) => WireParam {
                        attr: attr::OBJREF_OUTPUT,
                        a: remote.object_id,
                        b: 0,
                        c: 0,
                    },
                    Object::Callback(cb) => {
                        if !std::sync::Arc::ptr_eq(&cb.root, root) {
                            return Err(QcomError::BadObj);
                        }
                        let id = root.namespace().insert(&cb)?;
                        WireParam {
                            attr: attr::OBJREF_OUTPUT,
                            a: id,
                            b: OBJREF_USER,
                            c: 0,
                        }
                    }
                    Object::Root(_) => return Err(QcomError::BadObj),
                }
            }
            Param::ObjIn(_) => WireParam::with_attr(attr::OBJREF_INPUT),
        };
        wire.push(w);
    }
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::StubDriver;
    use crate::object::{CallbackObject, Object};
    use crate::param::UBuf;
    use crate::root::RootBuilder;
    use std::sync::Arc;

    struct Echo;
    impl CallbackObject for Echo {
        fn dispatch(&self, _op: u32, _params: &mut Vec<Param>) -> QcomResult<()> {
            Ok(())
        }
    }

    fn test_root() -> RootHandle {
        RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .build_handle()
    }

    #[test]
    fn forward_in_buffers_round_trip_sizes() {
        let root = test_root();
        let params = vec![
            Param::BufIn(UBuf::input(vec![1, 2, 3, 4])),
            Param::BufOut(UBuf::with_capacity(8)),
        ];
        let wire = forward_in(&root, &params).unwrap();
        assert_eq!(wire[0].attr, attr::UBUF_INPUT);
        assert_eq!(wire[0].b, 4);
        assert_eq!(wire[1].attr, attr::UBUF_OUTPUT);
        assert_eq!(wire[1].b, 8);
    }

    #[test]
    fn forward_in_callback_inserts_into_namespace() {
        let root = test_root();
        let cb = CallbackInner::new(root.clone(), Box::new(Echo));
        let params = vec![Param::ObjIn(Object::Callback(cb.clone()))];
        let wire = forward_in(&root, &params).unwrap();
        assert_eq!(wire[0].attr, attr::OBJREF_INPUT);
        assert_eq!(wire[0].b, OBJREF_USER);
        assert!(cb.is_queued());
        assert_eq!(wire[0].a, cb.object_id());
    }

    #[test]
    fn forward_in_rejects_foreign_root() {
        let root = test_root();
        let other_root = test_root();
        let cb = CallbackInner::new(other_root, Box::new(Echo));
        let params = vec![Param::ObjIn(Object::Callback(cb))];
        assert_eq!(forward_in(&root, &params), Err(QcomError::BadObj));
    }

    #[test]
    fn forward_out_constructs_remote_from_objref_output() {
        let root = test_root();
        let mut params = vec![Param::obj_out_slot()];
        let wire = vec![WireParam {
            attr: attr::OBJREF_OUTPUT,
            a: 42,
            b: 0,
            c: 0,
        }];
        forward_out(&root, &mut params, &wire).unwrap();
        match &params[0] {
            Param::ObjOut(Object::Remote(r)) => assert_eq!(r.object_id, 42),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn reverse_in_resolves_user_flagged_id_via_namespace() {
        let root = test_root();
        let cb = CallbackInner::new(root.clone(), Box::new(Echo));
        let id = root.namespace().insert(&cb).unwrap();
        let wire = vec![WireParam {
            attr: attr::OBJREF_INPUT,
            a: id,
            b: OBJREF_USER,
            c: 0,
        }];
        let params = reverse_in(&root, &wire).unwrap();
        assert!(matches!(&params[0], Param::ObjIn(Object::Callback(_))));
    }

    #[test]
    fn reverse_in_unresolved_id_fails_and_releases_earlier_objects() {
        let root = test_root();
        let wire = vec![
            WireParam {
                attr: attr::OBJREF_INPUT,
                a: NULL_OBJECT_ID,
                b: 0,
                c: 0,
            },
            WireParam {
                attr: attr::OBJREF_INPUT,
                a: 999,
                b: OBJREF_USER,
                c: 0,
            },
        ];
        assert_eq!(reverse_in(&root, &wire), Err(QcomError::Defunct));
    }
}
