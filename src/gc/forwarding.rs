//! Forwarding pointers tagged into an object's class slot (spec.md §4.7,
//! §9 design note).
//!
//! The design note asks for a dedicated helper rather than raw pointer
//! tagging scattered through the copying engine, so the representation
//! (low-bit tag on an otherwise-aligned `Address`) stays behind this one
//! module.

use crate::util::address::{Address, ObjectReference};

/// The value found in (or written to) an object's class-pointer slot
/// during a copying collection: either an ordinary class reference, or a
/// forwarding pointer to the object's new location.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(transparent)]
pub struct ClassSlot(usize);

impl ClassSlot {
    pub fn class(class: ObjectReference) -> ClassSlot {
        debug_assert!(class.to_address().as_usize() & 1 == 0, "class pointers must be word-aligned");
        ClassSlot(class.to_address().as_usize())
    }

    pub fn forwarding(to: Address) -> ClassSlot {
        ClassSlot(to.as_usize() | 1)
    }

    pub fn is_forwarded(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn forwarded_to(self) -> Option<Address> {
        self.is_forwarded().then(|| unsafe { Address::from_usize(self.0 & !1) })
    }

    pub fn as_class(self) -> Option<ObjectReference> {
        (!self.is_forwarded()).then(|| ObjectReference::from_address(unsafe { Address::from_usize(self.0) }))
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn from_raw(raw: usize) -> ClassSlot {
        ClassSlot(raw)
    }
}

/// Reads the class slot at the start of `obj`'s header and interprets it
/// as either a class pointer or a forwarding pointer.
pub fn read_class_slot(obj: ObjectReference) -> ClassSlot {
    let raw = unsafe { obj.to_address().to_ptr::<usize>().read() };
    ClassSlot::from_raw(raw)
}

/// Installs a forwarding pointer in `obj`'s class slot (spec.md §4.7 step
/// 4: "install a forwarding pointer ... in the original's class-pointer
/// slot").
pub fn install_forward(obj: ObjectReference, to: Address) {
    let slot = ClassSlot::forwarding(to);
    unsafe {
        obj.to_address().to_mut_ptr::<usize>().write(slot.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_slot_roundtrip() {
        let class = ObjectReference::from_address(unsafe { Address::from_usize(0x2000) });
        let slot = ClassSlot::class(class);
        assert!(!slot.is_forwarded());
        assert_eq!(slot.as_class(), Some(class));
    }

    #[test]
    fn forwarding_slot_roundtrip() {
        let to = unsafe { Address::from_usize(0x3000) };
        let slot = ClassSlot::forwarding(to);
        assert!(slot.is_forwarded());
        assert_eq!(slot.forwarded_to(), Some(to));
        assert_eq!(slot.as_class(), None);
    }
}
