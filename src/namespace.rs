//! A fixed-capacity table mapping small integer ids to locally-hosted
//! Callback objects, one per Root.
//!
//! Each occupied slot holds one `Arc` clone per outstanding export of that
//! Callback to the TEE — exporting the same Callback twice produces two
//! clones in the same slot, since the driver treats each transfer as an
//! independent capability even though the id is reused. Releasing one
//! clone (in response to the TEE's reserved "release" operation) pops a
//! single instance; the slot, and the Callback's `queued` flag, only clear
//! once the last instance is gone.
//!
//! This is why a Callback can never be torn down by the Namespace merely
//! holding the last `Arc`: every namespace-held reference is paired with an
//! explicit pop somewhere (release-op handling, or Root teardown), so by
//! the time a Callback's `Arc` strong count would reach zero, the
//! Namespace has already relinquished its hold. `Object::drop` therefore
//! needs no special-cased detach step.
//!
//! A lock-free `find` would rely on the driver never handing back an id
//! it has already released. That invariant is hard to lean on safely from
//! outside the kernel, so `find` takes the same mutex as `insert`/`delete`
//! instead (see DESIGN.md for the tradeoff).

use std::sync::{Arc, Mutex};

use crate::error::{QcomError, QcomResult};
use crate::object::CallbackInner;

/// Capacity of a Root's Namespace.
pub const CAPACITY: usize = 1024;

struct Slot {
    instances: Vec<Arc<CallbackInner>>,
}

/// Per-Root table of exported Callback objects.
pub(crate) struct Namespace {
    table: Mutex<NamespaceTable>,
}

struct NamespaceTable {
    slots: Vec<Option<Slot>>,
    cursor: usize,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(NamespaceTable {
                slots: (0..CAPACITY).map(|_| None).collect(),
                cursor: 0,
            }),
        }
    }

    /// Export `obj`, adding one counted instance to its slot. Reuses the
    /// existing id if `obj` is already queued. Fails with
    /// [`QcomError::NoSlots`] if no slot is free for a first-time export.
    pub(crate) fn insert(&self, obj: &Arc<CallbackInner>) -> QcomResult<u64> {
        let mut table = self.table.lock().unwrap();
        if obj.is_queued() {
            let id = obj.object_id();
            table.slots[id as usize]
                .as_mut()
                .expect("queued object must have a live slot")
                .instances
                .push(Arc::clone(obj));
            return Ok(id);
        }

        for i in 0..CAPACITY {
            let idx = (table.cursor + i) % CAPACITY;
            if table.slots[idx].is_none() {
                table.slots[idx] = Some(Slot {
                    instances: vec![Arc::clone(obj)],
                });
                obj.set_queued(idx as u64);
                table.cursor = (idx + 1) % CAPACITY;
                return Ok(idx as u64);
            }
        }
        Err(QcomError::NoSlots)
    }

    /// Look up `id`, handing back a fresh counted reference on success.
    pub(crate) fn find(&self, id: u64) -> Option<Arc<CallbackInner>> {
        if id as usize >= CAPACITY {
            return None;
        }
        let table = self.table.lock().unwrap();
        table.slots[id as usize]
            .as_ref()
            .and_then(|slot| slot.instances.last())
            .map(Arc::clone)
    }

    /// Release exactly one namespace-held instance of `id`. Clears the
    /// slot (and the object's `queued` flag) once the last instance is
    /// gone. Returns the released `Arc`; dropping it performs the actual
    /// decrement.
    pub(crate) fn release_one(&self, id: u64) -> Option<Arc<CallbackInner>> {
        if id as usize >= CAPACITY {
            return None;
        }
        let mut table = self.table.lock().unwrap();
        let slot = table.slots[id as usize].as_mut()?;
        let released = slot.instances.pop();
        if let Some(released) = &released {
            if slot.instances.is_empty() {
                released.clear_queued();
                table.slots[id as usize] = None;
            }
        }
        released
    }

    /// Forcibly drain every slot, clearing `queued` on every object found.
    /// Used during Root teardown to break the Namespace's hold on any
    /// Callback the TEE never released, so the cycle through its `root`
    /// back-pointer doesn't keep the Root's resources alive forever.
    pub(crate) fn drain(&self) -> Vec<Arc<CallbackInner>> {
        let mut table = self.table.lock().unwrap();
        let mut released = Vec::new();
        for slot in table.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                for instance in &slot.instances {
                    instance.clear_queued();
                }
                released.extend(slot.instances);
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::RootBuilder;
    use crate::driver::stub::StubDriver;
    use std::sync::Arc as StdArc;

    struct NoopCallback;
    impl crate::object::CallbackObject for NoopCallback {
        fn dispatch(&self, _op: u32, _params: &mut Vec<crate::param::Param>) -> QcomResult<()> {
            Ok(())
        }
    }

    fn test_root() -> crate::root::RootHandle {
        RootBuilder::new()
            .driver(StdArc::new(StubDriver::new()))
            .build_handle()
    }

    #[test]
    fn insert_reuses_id_and_adds_an_instance() {
        let root = test_root();
        let cb = CallbackInner::new(root.clone(), Box::new(NoopCallback));
        let ns = Namespace::new();

        let id1 = ns.insert(&cb).unwrap();
        assert!(cb.is_queued());
        let id2 = ns.insert(&cb).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(StdArc::strong_count(&cb), 3); // caller + two instances
    }

    #[test]
    fn release_one_clears_slot_only_when_empty() {
        let root = test_root();
        let cb = CallbackInner::new(root.clone(), Box::new(NoopCallback));
        let ns = Namespace::new();
        let id = ns.insert(&cb).unwrap();
        ns.insert(&cb).unwrap();

        let first = ns.release_one(id).unwrap();
        drop(first);
        assert!(cb.is_queued());
        assert!(ns.find(id).is_some());

        let second = ns.release_one(id).unwrap();
        drop(second);
        assert!(!cb.is_queued());
        assert!(ns.find(id).is_none());
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let root = test_root();
        let ns = Namespace::new();
        let mut held = Vec::new();
        for _ in 0..CAPACITY {
            let cb = CallbackInner::new(root.clone(), Box::new(NoopCallback));
            ns.insert(&cb).unwrap();
            held.push(cb);
        }
        let overflow = CallbackInner::new(root.clone(), Box::new(NoopCallback));
        assert_eq!(ns.insert(&overflow), Err(QcomError::NoSlots));
    }
}
