//! Forward-path invocation: caller → driver → caller.

use qcomtee_log::instrument;

use crate::error::QcomError;
use crate::marshal::{forward_in, forward_out};
use crate::object::Object;
use crate::param::{Param, MAX_INVOKE_PARAMS};

/// The outcome of an [`Invoker::invoke`] call: the domain result code plus
/// whatever outbound parameters were successfully marshaled back. Kept
/// distinct from a transport failure, which surfaces as `io::Error`
/// instead of this type at all.
#[derive(Debug)]
pub struct InvokeOutcome {
    /// The TEE's (or marshal layer's) scalar result code; `0` is success.
    pub result: u32,
}

impl InvokeOutcome {
    /// True if `result == 0`.
    pub fn is_ok(&self) -> bool {
        self.result == 0
    }
}

/// Issues forward-path calls against a Root or Remote object.
pub struct Invoker;

impl Invoker {
    /// Invoke `op` on `object` with `params`, mutating `params` in place
    /// with the response (buffer sizes updated, `ObjOut` slots filled).
    ///
    /// Returns `Err(io::Error)` for transport failures (rejected target,
    /// too many parameters, a failing forward-in marshal, or a nonzero
    /// ioctl return) and `Ok(InvokeOutcome)` whenever the ioctl itself
    /// succeeded, carrying whatever domain result code it reported.
    pub fn invoke(object: &Object, op: u32, params: &mut [Param]) -> std::io::Result<InvokeOutcome> {
        instrument!(qcomtee_log::Level::TRACE, "invoke", op);

        if !object.is_invokable() {
            return Err(invalid_target());
        }
        if params.len() > MAX_INVOKE_PARAMS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "too many invoke parameters",
            ));
        }
        let root = object
            .root()
            .expect("invokable objects always have a root")
            .clone();

        let mut wire = forward_in(&root, params).map_err(domain_to_io)?;

        let result = root.driver().invoke(op, object.wire_id(), &mut wire)?;
        if result != 0 {
            // Domain failure: the driver call itself succeeded, so this is
            // not a transport error. Outputs are not marshaled back.
            return Ok(InvokeOutcome { result });
        }

        match forward_out(&root, params, &wire) {
            Ok(()) => Ok(InvokeOutcome { result: 0 }),
            Err(_) => Ok(InvokeOutcome {
                result: QcomError::Unavail.code(),
            }),
        }
    }
}

fn invalid_target() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "invoke target must be a Root or Remote object",
    )
}

fn domain_to_io(err: QcomError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::stub::{InvokeResponse, StubDriver};
    use crate::driver::{attr, WireParam};
    use crate::object::CallbackInner;
    use crate::object::{CallbackObject, Object};
    use crate::param::UBuf;
    use crate::root::RootBuilder;
    use std::sync::Arc;

    struct Echo;
    impl CallbackObject for Echo {
        fn dispatch(&self, _op: u32, _params: &mut Vec<Param>) -> crate::error::QcomResult<()> {
            Ok(())
        }
    }

    #[test]
    fn rejects_callback_target() {
        let root = RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .build_handle();
        let cb = CallbackInner::new(root, Box::new(Echo));
        let object = Object::Callback(cb);
        let mut params: Vec<Param> = Vec::new();
        assert!(Invoker::invoke(&object, 0, &mut params).is_err());
    }

    #[test]
    fn rejects_too_many_params() {
        let root = RootBuilder::new()
            .driver(Arc::new(StubDriver::new()))
            .build_handle();
        let object = Object::Root(root);
        let mut params: Vec<Param> = (0..65).map(|_| Param::BufIn(UBuf::input(vec![]))).collect();
        assert!(Invoker::invoke(&object, 0, &mut params).is_err());
    }

    #[test]
    fn scalar_add_roundtrip_on_stub() {
        let stub = Arc::new(StubDriver::new());
        stub.push_invoke_response(InvokeResponse {
            result: 0,
            outputs: Some(vec![
                WireParam::with_attr(attr::UBUF_INPUT),
                WireParam::with_attr(attr::UBUF_INPUT),
                WireParam {
                    attr: attr::UBUF_OUTPUT,
                    a: 0,
                    b: 4,
                    c: 0,
                },
            ]),
        });
        let root = RootBuilder::new().driver(stub).build_handle();
        let object = Object::Root(root);
        let mut params = vec![
            Param::BufIn(UBuf::input(7i32.to_le_bytes().to_vec())),
            Param::BufIn(UBuf::input(35i32.to_le_bytes().to_vec())),
            Param::BufOut(UBuf::with_capacity(4)),
        ];
        let outcome = Invoker::invoke(&object, 0, &mut params).unwrap();
        assert!(outcome.is_ok());
        match &params[2] {
            Param::BufOut(buf) => assert_eq!(buf.len(), 4),
            other => panic!("expected BufOut, got {other:?}"),
        }
    }

    #[test]
    fn domain_failure_skips_output_marshal() {
        let stub = Arc::new(StubDriver::new());
        stub.push_invoke_response(InvokeResponse {
            result: QcomError::Generic.code(),
            outputs: None,
        });
        let root = RootBuilder::new().driver(stub).build_handle();
        let object = Object::Root(root);
        let mut params: Vec<Param> = Vec::new();
        let outcome = Invoker::invoke(&object, 99, &mut params).unwrap();
        assert_eq!(outcome.result, QcomError::Generic.code());
    }
}
