//! The object header contract the GC consumes (spec.md §3, "Object
//! header"). Not an object format the core defines — the `MutatorRuntime`
//! collaborator (spec.md §6) supplies class metadata through this trait.

use crate::util::address::{Address, ObjectReference};

/// Reference-subclass flags carried by a class descriptor. A plain bitset
/// rather than a `bitflags!`-generated type, matching the teacher's
/// preference for hand-rolled bit twiddling over pulling in a flags crate
/// for a handful of constants (e.g. its `header_byte`/`gc_byte` modules).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ClassFlags(u32);

impl ClassFlags {
    pub const IS_REFERENCE: ClassFlags = ClassFlags(1 << 0);
    pub const IS_WEAK: ClassFlags = ClassFlags(1 << 1);
    pub const IS_PHANTOM: ClassFlags = ClassFlags(1 << 2);
    pub const IS_FINALIZER: ClassFlags = ClassFlags(1 << 3);
    pub const IS_ARRAY: ClassFlags = ClassFlags(1 << 4);
    pub const IS_OBJECT_ARRAY: ClassFlags = ClassFlags(1 << 5);
    pub const IS_CLASS_OBJECT: ClassFlags = ClassFlags(1 << 6);
    pub const NONE: ClassFlags = ClassFlags(0);

    pub const fn from_bits(bits: u32) -> ClassFlags {
        ClassFlags(bits)
    }

    pub const fn contains(self, other: ClassFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: ClassFlags) -> ClassFlags {
        ClassFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for ClassFlags {
    type Output = ClassFlags;
    fn bitor(self, rhs: ClassFlags) -> ClassFlags {
        self.union(rhs)
    }
}

/// The two-bit hash-code migration state carried in every object header
/// (spec.md §4.7 "Hash-code migration invariant"): whether
/// `Object.hashCode()` has ever been called on this object, and if so,
/// whether its identity hash has already been relocated alongside it by
/// a copying collection.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HashState {
    Unhashed,
    Hashed,
    HashedAndMoved,
}

/// How a class descriptor exposes the reference-bearing slots of its
/// instances.
pub enum ReferenceOffsets {
    /// A packed bitmap of reference-bearing words, CLZ-decoded the way the
    /// source's `CLASS_OBJECT_SIZE`/ref-offset bitmap is (spec.md §4.6
    /// `scanDataObject`).
    Bitmap(u32),
    /// The "walk the superchain" sentinel: the class's own fields are
    /// discovered by walking declared fields up the superclass chain
    /// rather than through a precomputed bitmap.
    WalkSuper,
}

/// Per-object metadata the collector needs. Implemented by the embedding
/// VM's class/object representation; the collector never constructs
/// objects itself.
pub trait ObjectModel {
    fn class_of(&self, obj: ObjectReference) -> ObjectReference;
    fn flags_of(&self, class: ObjectReference) -> ClassFlags;
    fn reference_offsets(&self, class: ObjectReference) -> ReferenceOffsets;
    /// Size in bytes of `obj`'s allocation, including header.
    fn size_of(&self, obj: ObjectReference) -> usize;
    /// Visits every reference-bearing slot address within `obj`
    /// (excluding the special `referent` slot of reference objects, which
    /// reference processing handles separately).
    fn visit_reference_slots(&self, obj: ObjectReference, cb: &mut dyn FnMut(Address));
    /// For a `IS_REFERENCE` object, the address of its `referent` slot.
    fn referent_slot(&self, obj: ObjectReference) -> Address;
    /// For a `IS_REFERENCE` object, the address of its intrusive
    /// `pendingNext` slot (spec.md §9 design note: circular worklist, no
    /// ownership implied).
    fn pending_next_slot(&self, obj: ObjectReference) -> Address;
    /// For `IS_FINALIZER` objects only: the address of the `zombie` slot
    /// the referent is moved to during finalizer processing.
    fn zombie_slot(&self, obj: ObjectReference) -> Address;
    /// Whether the reference object has a registered `ReferenceQueue`
    /// (non-null `queue` field) that has not yet been appended to
    /// (`queueNext` is null) — i.e. it is "enqueueable".
    fn is_enqueueable(&self, obj: ObjectReference) -> bool;
    fn mark_enqueued(&self, obj: ObjectReference);

    /// `ISARRAY & ISOBJECTARRAY`: visits every element reference.
    fn visit_array_elements(&self, obj: ObjectReference, cb: &mut dyn FnMut(Address));
    /// `classJavaLangClass`: static fields, superclass, loader, element
    /// class (arrays of class status past resolution).
    fn visit_class_object_slots(&self, obj: ObjectReference, cb: &mut dyn FnMut(Address));

    /// The object's current hash-code migration state (spec.md §4.7).
    /// Only consulted by the copying engine; the mark-sweep engine never
    /// relocates objects so never reads or writes this.
    fn hash_state(&self, obj: ObjectReference) -> HashState;
    fn set_hash_state(&self, obj: ObjectReference, state: HashState);
}

/// Which strength-ordered reference list a reference object belongs on,
/// derived from its class flags (spec.md §4.6 `scanDataObject`). Shared
/// by both collectors so the classification lives in one place.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Finalizer,
    Phantom,
}

pub fn classify_reference(flags: ClassFlags) -> Option<ReferenceKind> {
    if !flags.contains(ClassFlags::IS_REFERENCE) {
        return None;
    }
    if flags.contains(ClassFlags::IS_WEAK) {
        Some(ReferenceKind::Weak)
    } else if flags.contains(ClassFlags::IS_PHANTOM) {
        Some(ReferenceKind::Phantom)
    } else if flags.contains(ClassFlags::IS_FINALIZER) {
        Some(ReferenceKind::Finalizer)
    } else {
        Some(ReferenceKind::Soft)
    }
}

#[inline]
pub fn load_reference(slot: Address) -> ObjectReference {
    let raw = unsafe { slot.to_ptr::<usize>().read() };
    ObjectReference::from_address(unsafe { Address::from_usize(raw) })
}

#[inline]
pub fn store_reference(slot: Address, value: ObjectReference) {
    unsafe {
        slot.to_mut_ptr::<usize>().write(value.to_address().as_usize());
    }
}
