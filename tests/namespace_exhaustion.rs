//! Exhausts a Root's 1024-slot Namespace via forward-path Callback exports,
//! confirms the next export is rejected, then frees one id through the
//! reserved release operation and confirms a later export reuses it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qcomtee::{CallbackObject, Invoker, Param, QcomResult, Root, StubDriver, SupplicantRequest};

struct Echo;
impl CallbackObject for Echo {
    fn dispatch(&self, _op: u32, _params: &mut Vec<Param>) -> QcomResult<()> {
        Ok(())
    }
}

const RELEASE_OP: u32 = 65536;

#[test]
fn namespace_exhausts_then_reuses_a_released_slot() {
    let stub = Arc::new(StubDriver::new());
    let root = Root::builder().driver(stub.clone()).worker_threads(1).build().unwrap();
    let target = root.as_object();

    let mut ids = Vec::with_capacity(1024);
    for _ in 0..1024 {
        let callback = root.callback(Box::new(Echo));
        let mut params = vec![Param::ObjIn(callback)];
        Invoker::invoke(&target, 99, &mut params).unwrap();
        ids.push(stub.invoke_log().last().unwrap().params[0].a);
    }

    let overflow = root.callback(Box::new(Echo));
    let mut overflow_params = vec![Param::ObjIn(overflow)];
    assert!(
        Invoker::invoke(&target, 99, &mut overflow_params).is_err(),
        "the 1025th export must fail once the namespace is full"
    );

    let freed_id = ids[512];
    stub.push_supplicant_request(SupplicantRequest {
        target_id: freed_id,
        request_id: 1,
        op: RELEASE_OP,
        params: vec![],
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut reused = false;
    while Instant::now() < deadline {
        let callback = root.callback(Box::new(Echo));
        let mut params = vec![Param::ObjIn(callback)];
        if Invoker::invoke(&target, 99, &mut params).is_ok() {
            let new_id = stub.invoke_log().last().unwrap().params[0].a;
            if new_id == freed_id {
                reused = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(reused, "expected the released slot id to be reused by a later export");
}
