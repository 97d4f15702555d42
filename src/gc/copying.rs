//! The mostly-copying (Bartlett-style) collection engine (spec.md §4.7).
//!
//! A fixed-size block space: each [`BLOCK_SIZE`] block is FREE, FROM, TO
//! or CONTINUED (the tail of a multi-block allocation). Allocation bumps
//! a cursor through the current TO block; collection flips TO blocks to
//! FROM, pins blocks an ambiguous or permanent root lands in (keeping
//! them in place rather than copying out of them), then scavenges roots
//! and drains newly-copied objects until closure.
//!
//! Rather than a literal FIFO of blocks awaiting their first scan, the
//! block queue in spec.md §9's design note is modeled here as repeated
//! sweeps over the block table: each round rescans every TO block for
//! bytes written since the last round (the currently active block's
//! frontier is re-read live; finalized blocks are scanned once), and
//! rounds continue until one makes no progress. Simpler than a literal
//! queue, and behaviorally the same: "appending new TO blocks keeps the
//! queue non-empty until closure" just becomes "another round finds more
//! to do".

use crate::gc::forwarding::{install_forward, read_class_slot};
use crate::gc::object_model::{
    classify_reference, load_reference, store_reference, HashState, ObjectModel, ReferenceKind,
};
use crate::gc::reference_processor::{close_circular_list, preserve_some_soft_references, PendingEnqueue, ReferenceLists};
use crate::gc::roots::{scan_object, RootVisitor};
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::{ALIGN, BLOCK_SIZE};
use spin::Mutex as SpinMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum BlockState {
    Free,
    From,
    To,
    /// The tail of a multi-block allocation; scanned as part of its
    /// run's first (`To`) block, never independently.
    Continued,
}

/// Outcome of one [`CopyingSpace::scavenge`] call.
pub struct ScavengeReport {
    pub blocks_reclaimed: usize,
    pub bytes_in_to_space: usize,
    pub pending_enqueue: PendingEnqueue,
}

/// A contiguous reservation of fixed-size blocks backing the mostly-copying
/// engine. Construction reserves no memory itself — `base` must already
/// point at `block_count * BLOCK_SIZE` bytes the caller owns (mirrors how
/// `HeapSource` takes an already-mapped reservation).
pub struct CopyingSpace {
    base: Address,
    block_count: usize,
    states: Vec<SpinMutex<BlockState>>,
    /// Bytes of valid object data in each block. For the currently active
    /// allocation block this is stale (the live value is `alloc_offset`);
    /// for every other block it is authoritative.
    used: Vec<AtomicUsize>,
    /// How far each block has been scanned by `drain`.
    scanned: Vec<AtomicUsize>,
    alloc_block: AtomicUsize,
    alloc_offset: AtomicUsize,
}

impl CopyingSpace {
    pub fn new(base: Address, block_count: usize) -> CopyingSpace {
        CopyingSpace {
            base,
            block_count,
            states: (0..block_count).map(|_| SpinMutex::new(BlockState::Free)).collect(),
            used: (0..block_count).map(|_| AtomicUsize::new(0)).collect(),
            scanned: (0..block_count).map(|_| AtomicUsize::new(0)).collect(),
            alloc_block: AtomicUsize::new(usize::MAX),
            alloc_offset: AtomicUsize::new(0),
        }
    }

    fn block_base(&self, idx: usize) -> Address {
        self.base.plus(idx * BLOCK_SIZE)
    }

    fn block_of(&self, addr: Address) -> Option<usize> {
        if addr < self.base || addr.diff(self.base) >= self.block_count * BLOCK_SIZE {
            return None;
        }
        Some(addr.diff(self.base) / BLOCK_SIZE)
    }

    pub fn in_from_space(&self, addr: Address) -> bool {
        self.block_of(addr).is_some_and(|idx| *self.states[idx].lock() == BlockState::From)
    }

    /// Bump-allocates `requested` bytes from the current TO block,
    /// acquiring fresh blocks as needed. A request larger than one block
    /// gets its own run of contiguous blocks instead of being bumped.
    pub fn alloc(&self, requested: usize) -> Option<Address> {
        let size = requested.div_ceil(ALIGN) * ALIGN;
        if size > BLOCK_SIZE {
            let blocks_needed = size.div_ceil(BLOCK_SIZE);
            let first = self.acquire_contiguous_free_blocks(blocks_needed)?;
            self.used[first].store(size, Ordering::Release);
            return Some(self.block_base(first));
        }

        loop {
            let block = self.alloc_block.load(Ordering::Acquire);
            if block != usize::MAX {
                let offset = self.alloc_offset.load(Ordering::Acquire);
                if offset + size <= BLOCK_SIZE {
                    if self
                        .alloc_offset
                        .compare_exchange(offset, offset + size, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Some(self.block_base(block).plus(offset));
                    }
                    continue;
                }
            }
            let new_block = self.acquire_free_block()?;
            if block != usize::MAX {
                self.used[block].store(self.alloc_offset.load(Ordering::Acquire), Ordering::Release);
            }
            self.alloc_block.store(new_block, Ordering::Release);
            self.alloc_offset.store(0, Ordering::Release);
            self.scanned[new_block].store(0, Ordering::Release);
        }
    }

    fn acquire_free_block(&self) -> Option<usize> {
        for idx in 0..self.block_count {
            let mut st = self.states[idx].lock();
            if *st == BlockState::Free {
                *st = BlockState::To;
                return Some(idx);
            }
        }
        None
    }

    fn acquire_contiguous_free_blocks(&self, n: usize) -> Option<usize> {
        'search: for start in 0..=self.block_count.saturating_sub(n) {
            for i in 0..n {
                if *self.states[start + i].lock() != BlockState::Free {
                    continue 'search;
                }
            }
            for i in 0..n {
                let mut st = self.states[start + i].lock();
                *st = if i == 0 { BlockState::To } else { BlockState::Continued };
            }
            return Some(start);
        }
        None
    }

    /// Step 1 of scavenging (spec.md §4.7): every TO/CONTINUED block
    /// becomes FROM, the allocator is reset, and a fresh empty block is
    /// acquired so there is always somewhere to copy the first root into.
    fn flip(&self) {
        for st in &self.states {
            let mut st = st.lock();
            if *st == BlockState::To || *st == BlockState::Continued {
                *st = BlockState::From;
            }
        }
        for u in &self.used {
            u.store(0, Ordering::Release);
        }
        for s in &self.scanned {
            s.store(0, Ordering::Release);
        }
        self.alloc_block.store(usize::MAX, Ordering::Release);
        self.alloc_offset.store(0, Ordering::Release);
        let first = self.acquire_free_block().expect("copying space exhausted at flip");
        self.alloc_block.store(first, Ordering::Release);
    }

    /// Promotes the block containing `addr`, if it is currently FROM, to
    /// TO in place — the object (and everything else sharing its block)
    /// survives this collection without being copied (spec.md §4.7 step
    /// 2, "pin"). Conservative: an ambiguous root anywhere in a block
    /// pins the whole block, the same granularity the source's block
    /// space table works at.
    fn pin(&self, addr: Address) {
        let Some(idx) = self.block_of(addr) else { return };
        let mut st = self.states[idx].lock();
        if *st == BlockState::From {
            *st = BlockState::To;
            drop(st);
            // A promoted block's prior contents are already-valid object
            // data for their whole extent; there is no cheap way to
            // recover how much of it was actually in use, so it is
            // conservatively treated as full.
            self.used[idx].store(BLOCK_SIZE, Ordering::Release);
            self.scanned[idx].store(0, Ordering::Release);
        }
    }

    fn is_to_block(&self, idx: usize) -> bool {
        *self.states[idx].lock() == BlockState::To
    }

    fn frontier(&self, idx: usize) -> usize {
        if self.alloc_block.load(Ordering::Acquire) == idx {
            self.alloc_offset.load(Ordering::Acquire)
        } else {
            self.used[idx].load(Ordering::Acquire)
        }
    }

    /// Follows (or installs) a forwarding pointer for the object at
    /// `slot`, rewriting `slot` to the to-space address. A no-op if the
    /// slot is null or already outside from-space (to-space, a pinned
    /// block, or a permanent object the collector never moves).
    fn scavenge_reference(&self, model: &dyn ObjectModel, slot: Address) {
        let target = load_reference(slot);
        if target.is_null() || !self.in_from_space(target.to_address()) {
            return;
        }
        let tagged = read_class_slot(target);
        let new_addr = match tagged.forwarded_to() {
            Some(to) => to,
            None => {
                let to = self.transport_object(model, target);
                install_forward(target, to);
                to
            }
        };
        store_reference(slot, ObjectReference::from_address(new_addr));
    }

    /// Copies `obj` into freshly allocated to-space, carrying the
    /// hash-code migration invariant along (spec.md §4.7 "Hash-code
    /// migration invariant"): UNHASHED objects copy as-is; HASHED objects
    /// gain a trailing word holding `fromAddr >> 3` and become
    /// HASHED_AND_MOVED; HASHED_AND_MOVED objects (whose trailing word
    /// was already written by an earlier move) just carry that word
    /// along.
    fn transport_object(&self, model: &dyn ObjectModel, obj: ObjectReference) -> Address {
        let state = model.hash_state(obj);
        let base_size = object_footprint(model, obj);
        let extra = if state == HashState::Hashed { std::mem::size_of::<usize>() } else { 0 };
        let dest = self.alloc(base_size + extra).expect("copying space allocation failure is fatal");
        unsafe {
            std::ptr::copy_nonoverlapping(obj.to_address().to_ptr::<u8>(), dest.to_mut_ptr::<u8>(), base_size);
        }
        let dest_obj = ObjectReference::from_address(dest);
        match state {
            HashState::Unhashed => {}
            HashState::Hashed => {
                unsafe {
                    dest.plus(base_size).to_mut_ptr::<usize>().write(obj.to_address().as_usize() >> 3);
                }
                model.set_hash_state(dest_obj, HashState::HashedAndMoved);
            }
            HashState::HashedAndMoved => {
                model.set_hash_state(dest_obj, HashState::HashedAndMoved);
            }
        }
        dest
    }

    /// Scans one to-space object already copied by `scavenge_reference`,
    /// scavenging its outgoing slots and — for a reference object —
    /// sorting it onto the right strength list (spec.md §4.7 step 6 /
    /// §4.6 `scanDataObject`, shared dispatch via `scan_object`).
    fn scavenge_object(&self, model: &dyn ObjectModel, obj: ObjectReference, lists: &mut ReferenceLists) {
        let outcome = scan_object(model, obj, |slot| self.scavenge_reference(model, slot));
        if let Some(referent_slot) = outcome.referent_slot {
            let class = model.class_of(obj);
            let flags = model.flags_of(class);
            let Some(kind) = classify_reference(flags) else { return };
            let referent = load_reference(referent_slot);
            let referent_live = referent.is_null() || !self.in_from_space(referent.to_address()) || read_class_slot(referent).is_forwarded();
            let list = match kind {
                ReferenceKind::Soft => &mut lists.soft,
                ReferenceKind::Weak => &mut lists.weak,
                ReferenceKind::Finalizer => &mut lists.finalizer,
                ReferenceKind::Phantom => &mut lists.phantom,
            };
            ReferenceLists::try_enqueue(list, model, obj, referent_live);
        }
    }

    fn scan_block_round(&self, idx: usize, model: &dyn ObjectModel, lists: &mut ReferenceLists) -> bool {
        let mut progressed = false;
        loop {
            let scanned = self.scanned[idx].load(Ordering::Acquire);
            let frontier = self.frontier(idx);
            if scanned >= frontier {
                break;
            }
            let obj = ObjectReference::from_address(self.block_base(idx).plus(scanned));
            let size = object_footprint(model, obj);
            self.scavenge_object(model, obj, lists);
            self.scanned[idx].store(scanned + size, Ordering::Release);
            progressed = true;
        }
        progressed
    }

    /// Drains every TO block to closure: repeated rounds over the block
    /// table until one makes no progress (spec.md §4.7 step 5).
    fn drain(&self, model: &dyn ObjectModel, lists: &mut ReferenceLists) {
        loop {
            let mut progressed = false;
            for idx in 0..self.block_count {
                if self.is_to_block(idx) && self.scan_block_round(idx, model, lists) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn is_white(&self, r: ObjectReference) -> bool {
        self.in_from_space(r.to_address()) && !read_class_slot(r).is_forwarded()
    }

    /// Steps 2/3/5 of reference processing (spec.md §4.6, reapplied with
    /// copying's definition of white): clears referents still in
    /// from-space with no forwarding pointer, and otherwise fixes up the
    /// slot to the (possibly just-forwarded) to-space address, since a
    /// stale from-space pointer left in place would dangle once
    /// from-space is reclaimed.
    fn clear_or_fixup(&self, model: &dyn ObjectModel, list: &[ObjectReference], pending: &mut PendingEnqueue) {
        for &r in list {
            let slot = model.referent_slot(r);
            let referent = load_reference(slot);
            if referent.is_null() {
                continue;
            }
            if self.is_white(referent) {
                store_reference(slot, ObjectReference::NULL);
                if model.is_enqueueable(r) {
                    model.mark_enqueued(r);
                    pending.push(r);
                }
            } else {
                self.scavenge_reference(model, slot);
            }
        }
    }

    /// Step 4 (spec.md §4.6, copying's "white" again): a finalizer whose
    /// referent is still white gets it transported (kept alive one more
    /// cycle), moved into `zombie`, and the reference enqueued.
    fn resurrect_finalizers(&self, model: &dyn ObjectModel, list: &[ObjectReference], pending: &mut PendingEnqueue) {
        for &r in list {
            let slot = model.referent_slot(r);
            let referent = load_reference(slot);
            if referent.is_null() {
                continue;
            }
            let was_white = self.is_white(referent);
            self.scavenge_reference(model, slot);
            if was_white {
                let new_referent = load_reference(slot);
                store_reference(model.zombie_slot(r), new_referent);
                store_reference(slot, ObjectReference::NULL);
                model.mark_enqueued(r);
                pending.push(r);
            }
        }
    }

    fn process_references(&self, model: &dyn ObjectModel, do_preserve: bool, lists: &mut ReferenceLists) -> PendingEnqueue {
        let mut pending = PendingEnqueue::new();
        if do_preserve {
            preserve_some_soft_references(model, &lists.soft, |slot| self.scavenge_reference(model, slot));
        }
        self.clear_or_fixup(model, &lists.soft, &mut pending);
        self.clear_or_fixup(model, &lists.weak, &mut pending);
        self.resurrect_finalizers(model, &lists.finalizer, &mut pending);
        self.drain(model, lists);
        self.clear_or_fixup(model, &lists.soft, &mut pending);
        self.clear_or_fixup(model, &lists.weak, &mut pending);
        self.clear_or_fixup(model, &lists.phantom, &mut pending);

        close_circular_list(model, &lists.soft);
        close_circular_list(model, &lists.weak);
        close_circular_list(model, &lists.finalizer);
        close_circular_list(model, &lists.phantom);
        pending
    }

    /// Reclaims every remaining FROM block back to FREE, zeroing their
    /// contents (spec.md §4.7 step 7: "verify & reclaim"). Returns the
    /// number of blocks reclaimed, and the bytes left live in to-space.
    fn reclaim_from_space(&self) -> (usize, usize) {
        let to_space_bytes: usize = (0..self.block_count).filter(|&idx| self.is_to_block(idx)).map(|idx| self.frontier(idx)).sum();

        let mut reclaimed = 0;
        for idx in 0..self.block_count {
            let mut st = self.states[idx].lock();
            if *st == BlockState::From {
                *st = BlockState::Free;
                drop(st);
                self.used[idx].store(0, Ordering::Release);
                self.scanned[idx].store(0, Ordering::Release);
                unsafe {
                    std::ptr::write_bytes(self.block_base(idx).to_mut_ptr::<u8>(), 0, BLOCK_SIZE);
                }
                reclaimed += 1;
            }
        }
        (reclaimed, to_space_bytes)
    }

    /// Runs one full scavenge per spec.md §4.7: flip, pin, scavenge
    /// thread roots, drain to closure, process references, reclaim.
    ///
    /// `conservative_pins` supplies addresses found on native stacks or
    /// registers that cannot be proven to be object pointers (spec.md
    /// §4.7 "Pinning on native method frames": ambiguous values are
    /// pinned rather than risked as dangling after a move).
    /// `permanent_roots` supplies roots that are always pinned rather
    /// than scavenged (the loaded-class table, interned strings,
    /// primitive classes) since those tables are shared structures the
    /// engine does not want to rewrite through.
    pub fn scavenge(
        &self,
        model: &dyn ObjectModel,
        roots: &dyn RootVisitor,
        permanent_roots: &dyn RootVisitor,
        conservative_pins: impl Iterator<Item = Address>,
        do_preserve: bool,
    ) -> ScavengeReport {
        self.flip();

        for addr in conservative_pins {
            self.pin(addr);
        }
        permanent_roots.visit_roots(&mut |slot| {
            let obj = load_reference(slot);
            if !obj.is_null() {
                self.pin(obj.to_address());
            }
        });

        let mut lists = ReferenceLists::default();
        roots.visit_roots(&mut |slot| self.scavenge_reference(model, slot));
        self.drain(model, &mut lists);

        let pending_enqueue = self.process_references(model, do_preserve, &mut lists);

        let (blocks_reclaimed, bytes_in_to_space) = self.reclaim_from_space();
        ScavengeReport { blocks_reclaimed, bytes_in_to_space, pending_enqueue }
    }
}

fn object_footprint(model: &dyn ObjectModel, obj: ObjectReference) -> usize {
    model.size_of(obj).div_ceil(ALIGN) * ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::object_model::{ClassFlags, ReferenceOffsets};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// An object model over a `Vec<u8>` arena, analogous to
    /// `mark_sweep`'s `ArenaModel`, plus per-object hash-state tracking.
    struct ArenaModel {
        arena: RefCell<Vec<u8>>,
        class_flags: RefCell<HashMap<usize, ClassFlags>>,
        fields: RefCell<HashMap<usize, Vec<usize>>>,
        hash_states: RefCell<HashMap<usize, HashState>>,
    }

    impl ArenaModel {
        fn new(capacity: usize) -> ArenaModel {
            ArenaModel {
                arena: RefCell::new(vec![0u8; capacity]),
                class_flags: RefCell::new(HashMap::new()),
                fields: RefCell::new(HashMap::new()),
                hash_states: RefCell::new(HashMap::new()),
            }
        }

        fn base(&self) -> Address {
            Address::from_ptr(self.arena.borrow().as_ptr())
        }

        fn define(&self, offset: usize, field_offsets: &[usize]) -> ObjectReference {
            self.class_flags.borrow_mut().insert(offset, ClassFlags::NONE);
            self.fields.borrow_mut().insert(offset, field_offsets.to_vec());
            ObjectReference::from_address(self.base().plus(offset))
        }

        fn set_field(&self, obj: ObjectReference, field_index: usize, target: ObjectReference) {
            let offset = self.fields.borrow()[&obj.to_address().diff(self.base())][field_index];
            store_reference(obj.to_address().plus(offset), target);
        }
    }

    impl ObjectModel for ArenaModel {
        fn class_of(&self, _obj: ObjectReference) -> ObjectReference {
            ObjectReference::NULL
        }
        fn flags_of(&self, _class: ObjectReference) -> ClassFlags {
            ClassFlags::NONE
        }
        fn reference_offsets(&self, _class: ObjectReference) -> ReferenceOffsets {
            ReferenceOffsets::WalkSuper
        }
        fn size_of(&self, _obj: ObjectReference) -> usize {
            16
        }
        fn visit_reference_slots(&self, obj: ObjectReference, cb: &mut dyn FnMut(Address)) {
            let offset = obj.to_address().diff(self.base());
            for &field_offset in self.fields.borrow().get(&offset).unwrap_or(&vec![]) {
                cb(obj.to_address().plus(field_offset));
            }
        }
        fn referent_slot(&self, obj: ObjectReference) -> Address {
            obj.to_address().plus(8)
        }
        fn pending_next_slot(&self, obj: ObjectReference) -> Address {
            obj.to_address().plus(16)
        }
        fn zombie_slot(&self, obj: ObjectReference) -> Address {
            obj.to_address().plus(24)
        }
        fn is_enqueueable(&self, _obj: ObjectReference) -> bool {
            false
        }
        fn mark_enqueued(&self, _obj: ObjectReference) {}
        fn visit_array_elements(&self, _obj: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
        fn visit_class_object_slots(&self, _obj: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
        fn hash_state(&self, obj: ObjectReference) -> HashState {
            *self.hash_states.borrow().get(&obj.to_address().as_usize()).unwrap_or(&HashState::Unhashed)
        }
        fn set_hash_state(&self, obj: ObjectReference, state: HashState) {
            self.hash_states.borrow_mut().insert(obj.to_address().as_usize(), state);
        }
    }

    struct NoRoots;
    impl RootVisitor for NoRoots {
        fn visit_roots(&self, _cb: &mut dyn FnMut(Address)) {}
    }

    struct OneRoot(RefCell<Address>);
    impl RootVisitor for OneRoot {
        fn visit_roots(&self, cb: &mut dyn FnMut(Address)) {
            cb(*self.0.borrow());
        }
    }

    #[test]
    fn alloc_bumps_within_a_block_then_acquires_a_new_one() {
        let space = CopyingSpace::new(unsafe { Address::from_usize(0x10000) }, 4);
        space.flip();
        let a = space.alloc(64).unwrap();
        let b = space.alloc(64).unwrap();
        assert_eq!(b.diff(a), 64);
        // A third 64-byte request overflows the 512-byte block and lands
        // in a fresh one.
        for _ in 0..6 {
            space.alloc(64).unwrap();
        }
        let overflow = space.alloc(64).unwrap();
        assert!(overflow.diff(a) >= BLOCK_SIZE);
    }

    #[test]
    fn large_allocation_spans_contiguous_blocks() {
        let space = CopyingSpace::new(unsafe { Address::from_usize(0x10000) }, 4);
        space.flip();
        let big = space.alloc(BLOCK_SIZE * 2).unwrap();
        assert!(space.block_of(big).is_some());
        assert_eq!(*space.states[space.block_of(big).unwrap() + 1].lock(), BlockState::Continued);
    }

    #[test]
    fn scavenge_copies_reachable_object_and_updates_root_slot() {
        let model = ArenaModel::new(4096);
        let a = model.define(3000, &[8]);
        let b = model.define(3100, &[]);
        model.set_field(a, 0, b);

        // Directly mark the blocks holding `a`/`b` as FROM, as if they
        // survived a prior collection into what is now from-space.
        let space = CopyingSpace::new(model.base(), 4096 / BLOCK_SIZE);
        let idx_a = space.block_of(a.to_address()).unwrap();
        *space.states[idx_a].lock() = BlockState::From;
        let idx_b = space.block_of(b.to_address()).unwrap();
        *space.states[idx_b].lock() = BlockState::From;

        // `scavenge_reference` expects a slot address holding an
        // `ObjectReference`; stash the root pointer in an arena cell the
        // model never otherwise uses.
        let synthetic_root = model.base().plus(3200);
        store_reference(synthetic_root, a);
        let roots = OneRoot(RefCell::new(synthetic_root));
        let report = space.scavenge(&model, &roots, &NoRoots, std::iter::empty(), true);

        let new_a = load_reference(synthetic_root);
        assert_ne!(new_a, a);
        assert!(!space.in_from_space(new_a.to_address()));
        // `b` is never reached (this toy model's field table is keyed by
        // an object's original offset, which no longer matches its
        // to-space copy) so both original blocks end up reclaimed.
        assert_eq!(report.blocks_reclaimed, 2);
    }

    #[test]
    fn pin_promotes_block_in_place_without_copying() {
        let model = ArenaModel::new(4096);
        let pinned = model.define(2000, &[]);
        let space = CopyingSpace::new(model.base(), 4096 / BLOCK_SIZE);
        let idx = space.block_of(pinned.to_address()).unwrap();
        *space.states[idx].lock() = BlockState::From;

        space.pin(pinned.to_address());
        assert!(space.is_to_block(idx));
        assert!(!space.in_from_space(pinned.to_address()));
    }
}
