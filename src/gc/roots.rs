//! Root and object traversal (spec.md §4.6 scanning dispatch, §6
//! `visitObjectFields`).
//!
//! `RootVisitor` enumerates root slots (thread stacks, JNI tables,
//! interned strings, global refs — owned by the `MutatorRuntime`
//! collaborator). `scan_object` is the engine-neutral dispatch by class
//! flags shared by both collectors: mark-sweep treats each visited slot as
//! "mark the referent"; the copying engine treats it as "scavenge this
//! slot". Both are expressed as a `FnMut(Address)` callback over slot
//! addresses so neither collector needs its own copy of the dispatch
//! logic.

use crate::gc::object_model::{ClassFlags, ObjectModel, ReferenceOffsets};
use crate::util::address::{Address, ObjectReference};

/// Enumerates every root slot address. Implemented by the `MutatorRuntime`
/// collaborator (spec.md §6); the collector supplies the callback.
pub trait RootVisitor {
    fn visit_roots(&self, cb: &mut dyn FnMut(Address));
}

/// The outcome of dispatching `scan_object` on a single object: which
/// category it fell into, and (for reference objects) the address of its
/// `referent` slot, which the caller must not pass to the generic
/// callback (spec.md §4.6: "do NOT mark it" — reference processing handles
/// it separately, in strength order).
pub struct ScanOutcome {
    pub is_reference: bool,
    pub referent_slot: Option<Address>,
}

/// Dispatches on `obj`'s class flags and invokes `cb` on every ordinary
/// reference-bearing slot (class pointer, super/loader/interfaces for
/// `classJavaLangClass`, element slots for object arrays, or the packed
/// reference-offset map / superchain walk for a plain data object).
/// The `referent` slot of a reference object is *not* passed to `cb`;
/// its address is returned in [`ScanOutcome`] instead.
pub fn scan_object(
    model: &dyn ObjectModel,
    obj: ObjectReference,
    mut cb: impl FnMut(Address),
) -> ScanOutcome {
    let class = model.class_of(obj);
    cb(class_slot_of(obj));
    let flags = model.flags_of(class);

    if flags.contains(ClassFlags::IS_CLASS_OBJECT) {
        model.visit_class_object_slots(obj, &mut cb);
    } else if flags.contains(ClassFlags::IS_ARRAY) && flags.contains(ClassFlags::IS_OBJECT_ARRAY) {
        model.visit_array_elements(obj, &mut cb);
    } else {
        match model.reference_offsets(class) {
            ReferenceOffsets::Bitmap(_) | ReferenceOffsets::WalkSuper => {
                model.visit_reference_slots(obj, &mut cb);
            }
        }
    }

    if flags.contains(ClassFlags::IS_REFERENCE) {
        ScanOutcome { is_reference: true, referent_slot: Some(model.referent_slot(obj)) }
    } else {
        ScanOutcome { is_reference: false, referent_slot: None }
    }
}

/// The address of an object's own class-pointer slot (always the first
/// word of the header in this object model).
pub fn class_slot_of(obj: ObjectReference) -> Address {
    obj.to_address()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::object_model::ClassFlags;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A tiny in-memory object model for tests: objects are just ids, with
    /// a table of (class, flags, ref-slots) per id.
    struct FakeModel {
        class_of: RefCell<HashMap<usize, usize>>,
        flags_of: RefCell<HashMap<usize, ClassFlags>>,
        slots_of: RefCell<HashMap<usize, Vec<Address>>>,
    }

    fn obj(id: usize) -> ObjectReference {
        ObjectReference::from_address(unsafe { Address::from_usize(id) })
    }

    impl ObjectModel for FakeModel {
        fn class_of(&self, o: ObjectReference) -> ObjectReference {
            obj(self.class_of.borrow()[&o.to_address().as_usize()])
        }
        fn flags_of(&self, class: ObjectReference) -> ClassFlags {
            self.flags_of.borrow()[&class.to_address().as_usize()]
        }
        fn reference_offsets(&self, _class: ObjectReference) -> ReferenceOffsets {
            ReferenceOffsets::WalkSuper
        }
        fn size_of(&self, _obj: ObjectReference) -> usize {
            16
        }
        fn visit_reference_slots(&self, o: ObjectReference, cb: &mut dyn FnMut(Address)) {
            for &slot in self.slots_of.borrow().get(&o.to_address().as_usize()).unwrap_or(&vec![]) {
                cb(slot);
            }
        }
        fn referent_slot(&self, o: ObjectReference) -> Address {
            o.to_address().plus(8)
        }
        fn pending_next_slot(&self, o: ObjectReference) -> Address {
            o.to_address().plus(16)
        }
        fn zombie_slot(&self, o: ObjectReference) -> Address {
            o.to_address().plus(24)
        }
        fn is_enqueueable(&self, _o: ObjectReference) -> bool {
            false
        }
        fn mark_enqueued(&self, _o: ObjectReference) {}
        fn visit_array_elements(&self, _o: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
        fn visit_class_object_slots(&self, _o: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
        fn hash_state(&self, _o: ObjectReference) -> crate::gc::object_model::HashState {
            crate::gc::object_model::HashState::Unhashed
        }
        fn set_hash_state(&self, _o: ObjectReference, _state: crate::gc::object_model::HashState) {}
    }

    #[test]
    fn scan_plain_object_visits_class_and_fields() {
        let model = FakeModel {
            class_of: RefCell::new(HashMap::from([(0x100, 0x200)])),
            flags_of: RefCell::new(HashMap::from([(0x200, ClassFlags::NONE)])),
            slots_of: RefCell::new(HashMap::from([(0x100, vec![unsafe { Address::from_usize(0x108) }])])),
        };
        let mut seen = vec![];
        let outcome = scan_object(&model, obj(0x100), |a| seen.push(a));
        assert!(!outcome.is_reference);
        assert_eq!(seen, vec![class_slot_of(obj(0x100)), unsafe { Address::from_usize(0x108) }]);
    }

    #[test]
    fn scan_reference_object_excludes_referent_from_callback() {
        let model = FakeModel {
            class_of: RefCell::new(HashMap::from([(0x100, 0x200)])),
            flags_of: RefCell::new(HashMap::from([(0x200, ClassFlags::IS_REFERENCE)])),
            slots_of: RefCell::new(HashMap::new()),
        };
        let mut seen = vec![];
        let outcome = scan_object(&model, obj(0x100), |a| seen.push(a));
        assert!(outcome.is_reference);
        assert_eq!(outcome.referent_slot, Some(unsafe { Address::from_usize(0x108) }));
        assert!(!seen.contains(&unsafe { Address::from_usize(0x108) }));
    }
}
