//! Strength-ordered soft/weak/finalizer/phantom reference processing,
//! shared by both collectors (spec.md §4.6/§4.7: "same strength-ordered
//! protocol ... 'is white' means ..." differs only in what "white" means).
//!
//! Reference objects discovered during a scan are appended to one of four
//! lists (spec.md §9 design note: modeled as a head + intrusive
//! `pendingNext` slot; here, a plain `Vec` per strength plays the role of
//! that head — the intrusive slot is still written so embedders that walk
//! the list through the object graph directly see the same link).

use crate::gc::object_model::ObjectModel;
use crate::util::address::{Address, ObjectReference};

#[derive(Default)]
pub struct ReferenceLists {
    pub soft: Vec<ObjectReference>,
    pub weak: Vec<ObjectReference>,
    pub finalizer: Vec<ObjectReference>,
    pub phantom: Vec<ObjectReference>,
}

/// Objects whose referent was cleared and who had a registered
/// `ReferenceQueue` — handed to `MutatorRuntime::enqueue_cleared_references`
/// (spec.md §6).
pub type PendingEnqueue = Vec<ObjectReference>;

impl ReferenceLists {
    /// Appends `obj` to the given list iff its `pendingNext` slot is null
    /// (spec.md §4.6: "if and only if its `pendingNext` slot is null").
    /// Marks the slot non-null by writing a sentinel; callers relying on
    /// circular-list semantics for external consumers should instead chain
    /// it to the previous tail, which `finish()` does in one pass.
    pub fn try_enqueue(list: &mut Vec<ObjectReference>, model: &dyn ObjectModel, obj: ObjectReference, referent_marked: bool) {
        if referent_marked {
            return;
        }
        let pending_next = model.pending_next_slot(obj);
        if !slot_is_null(pending_next) {
            return;
        }
        // Mark as enqueued with a non-null placeholder; `finish()` below
        // rewrites these into a genuine circular chain.
        write_slot(pending_next, obj);
        list.push(obj);
    }
}

fn slot_is_null(slot: Address) -> bool {
    unsafe { slot.to_ptr::<usize>().read() == 0 }
}

fn write_slot(slot: Address, obj: ObjectReference) {
    unsafe {
        slot.to_mut_ptr::<usize>().write(obj.to_address().as_usize());
    }
}

/// Finalizes a list into the circular form spec.md describes ("the head's
/// `pendingNext` points to itself when singleton"): each entry's
/// `pendingNext` is rewritten to point at the next entry, and the last
/// entry's to the first.
pub fn close_circular_list(model: &dyn ObjectModel, list: &[ObjectReference]) {
    if list.is_empty() {
        return;
    }
    for window in list.windows(2) {
        write_slot(model.pending_next_slot(window[0]), window[1]);
    }
    write_slot(model.pending_next_slot(*list.last().unwrap()), *list.first().unwrap());
}

/// Step 1 (soft only, spec.md §4.6 item 1): when `preserve` is true and
/// this is not the zygote heap, keep roughly every other referent alive
/// (spec.md §9 Open Question / DESIGN.md decision 4: intentional
/// load-shedding, not a placeholder) by marking it; the rest fall through
/// to `clear_white_references` below as ordinary unmarked referents.
pub fn preserve_some_soft_references(
    model: &dyn ObjectModel,
    softs: &[ObjectReference],
    mut mark: impl FnMut(Address),
) {
    let mut counter: u32 = 0;
    for &r in softs {
        counter += 1;
        if counter & 1 == 1 {
            mark(model.referent_slot(r));
        }
    }
}

/// Steps 2/3/5 (spec.md §4.6): for each reference in `list` whose referent
/// is white, clear the referent slot; if the reference is enqueueable,
/// collect it into `pending_enqueue`.
pub fn clear_white_references(
    model: &dyn ObjectModel,
    list: &[ObjectReference],
    is_white: impl Fn(ObjectReference) -> bool,
    pending_enqueue: &mut PendingEnqueue,
) {
    for &r in list {
        let referent_slot = model.referent_slot(r);
        let referent = super::object_model::load_reference(referent_slot);
        if referent.is_null() || !is_white(referent) {
            continue;
        }
        super::object_model::store_reference(referent_slot, ObjectReference::NULL);
        if model.is_enqueueable(r) {
            model.mark_enqueued(r);
            pending_enqueue.push(r);
        }
    }
}

/// Step 4 (spec.md §4.6): for each finalizer reference whose referent is
/// still white, mark the referent (it survives one more cycle), move it
/// from `referent` to `zombie`, clear `referent`, and enqueue it.
/// Returns the set of zombie referents so the caller can drain them
/// through the mark stack (they are transitively reachable once more).
pub fn enqueue_finalizer_references(
    model: &dyn ObjectModel,
    finalizers: &[ObjectReference],
    is_white: impl Fn(ObjectReference) -> bool,
    mut mark: impl FnMut(Address),
    pending_enqueue: &mut PendingEnqueue,
) -> Vec<ObjectReference> {
    let mut resurrected = vec![];
    for &r in finalizers {
        let referent_slot = model.referent_slot(r);
        let referent = super::object_model::load_reference(referent_slot);
        if referent.is_null() {
            continue;
        }
        if is_white(referent) {
            mark(referent.to_address());
            let zombie_slot = model.zombie_slot(r);
            super::object_model::store_reference(zombie_slot, referent);
            super::object_model::store_reference(referent_slot, ObjectReference::NULL);
            model.mark_enqueued(r);
            pending_enqueue.push(r);
            resurrected.push(referent);
        }
    }
    resurrected
}
