//! The mark-sweep collection engine (spec.md §4.6).
//!
//! Drives one collection through the state machine roughly:
//! `stop the world -> mark roots -> trace closure -> (concurrent: resume,
//! remark against dirty cards) -> reference processing -> sweep`. The
//! "concurrent" flavor in [`GcSpec::CONCURRENT`] is modeled here as a
//! second root-marking + dirty-card pass rather than literally resuming
//! mutator threads mid-collection — this crate has no mutator-thread
//! scheduler of its own, so the card table is the only place concurrency
//! actually shows up (a real embedding drives `remark` while its threads
//! run; the bits it reads are the same either way).

use crate::gc::object_model::{classify_reference, load_reference, ObjectModel, ReferenceKind};
use crate::gc::reference_processor::{
    clear_white_references, close_circular_list, enqueue_finalizer_references, preserve_some_soft_references,
    PendingEnqueue, ReferenceLists,
};
use crate::gc::roots::{scan_object, RootVisitor};
use crate::heap::{GcSpec, HeapSource};
use crate::util::address::{Address, ObjectReference};
use crate::util::cardtable::CardTable;

/// What to do with a system-weak table entry (interned strings, monitor
/// list, weak JNI globals — spec.md §4.6 "System-weak sweep") once the
/// mark phase has settled.
pub enum WeakSweepAction {
    Keep,
    Clear,
}

/// The collaborator that owns system-weak tables. Implemented by the
/// embedding `MutatorRuntime` (spec.md §6); the collector only decides
/// keep-or-clear per entry.
pub trait SystemWeakVisitor {
    fn visit_system_weaks(&self, cb: &mut dyn FnMut(ObjectReference) -> WeakSweepAction);
}

/// Outcome of one `collect()` call, enough for the caller to finish the
/// job the collector cannot do itself: notify finalizer queues and fold
/// growth policy results back into scheduling decisions.
pub struct CollectionReport {
    pub bytes_freed: usize,
    pub objects_freed: usize,
    pub live_bytes_estimate: usize,
    /// Reference objects whose `referent` was cleared (or, for
    /// finalizer references, moved to `zombie`) and need to be appended
    /// to a `ReferenceQueue` by the runtime (spec.md §6
    /// `enqueue_cleared_references`).
    pub pending_enqueue: PendingEnqueue,
}

#[derive(Default)]
pub struct MarkSweepCollector;

impl MarkSweepCollector {
    /// Runs one full collection per `spec`. Takes `&mut HeapSource` for
    /// the whole call: this crate has no real suspend/resume of mutator
    /// threads to interleave with, so the bitmap swap at the end (the one
    /// genuinely exclusive step) is folded into the same borrow rather
    /// than re-acquiring partway through.
    pub fn collect(
        &self,
        heap: &mut HeapSource,
        model: &dyn ObjectModel,
        cards: &mut CardTable,
        roots: &dyn RootVisitor,
        system_weaks: Option<&dyn SystemWeakVisitor>,
        spec: GcSpec,
    ) -> CollectionReport {
        heap.begin_gc();

        self.mark_immune_region(heap, spec.is_partial);
        self.mark_roots(heap, roots);

        let mut mark_stack: Vec<ObjectReference> = Vec::new();
        let mut lists = ReferenceLists::default();
        self.scan_marked_objects(heap, model, &mut mark_stack, &mut lists);

        if spec.is_concurrent {
            // Re-mark roots (conservative: may repeat work already done)
            // then chase anything a concurrent mutator wrote behind the
            // collector's back, found via dirty cards.
            self.mark_roots(heap, roots);
            self.scan_gray_objects(heap, model, cards, &mut mark_stack, &mut lists);
            self.scan_marked_objects(heap, model, &mut mark_stack, &mut lists);
            cards.clear();
        }

        let pending_enqueue = self.process_references(heap, model, &mut mark_stack, &mut lists, spec.do_preserve);
        // Resurrecting a finalizable object can chase down new referents;
        // drain once more before the system-weak sweep.
        self.drain_mark_stack(heap, model, &mut mark_stack, &mut lists);

        if let Some(sw) = system_weaks {
            sw.visit_system_weaks(|obj| {
                if heap.mark_bits.test(obj.to_address()) {
                    WeakSweepAction::Keep
                } else {
                    WeakSweepAction::Clear
                }
            });
        }

        let (bytes_freed, objects_freed) = self.sweep(heap, spec.is_partial);

        let live_bytes_estimate = heap.active_heap().bytes_allocated();
        heap.swap_bitmaps();
        heap.mark_bits.zero();
        heap.end_gc();

        CollectionReport { bytes_freed, objects_freed, live_bytes_estimate, pending_enqueue }
    }

    fn mark_immune_region(&self, heap: &HeapSource, is_partial: bool) {
        if !is_partial {
            return;
        }
        let Some(zygote) = heap.zygote_heap() else { return };
        let (base, brk) = (zygote.base(), zygote.brk());
        heap.live_bits.walk(|addr| {
            if addr >= base && addr < brk {
                heap.mark_bits.set(addr);
            }
        });
    }

    /// Root marking: test-and-set the mark bit directly, no mark-stack
    /// push (spec.md §4.6 `markRootSet`) — the closure scan below finds
    /// these through the bitmap itself.
    fn mark_roots(&self, heap: &HeapSource, roots: &dyn RootVisitor) {
        roots.visit_roots(&mut |slot| {
            let obj = load_reference(slot);
            if !obj.is_null() {
                heap.mark_bits.set(obj.to_address());
            }
        });
    }

    /// `scanMarkedObjects`: drains the mark bitmap via `scan_walk`, then
    /// the explicit mark stack for anything discovered behind the
    /// already-passed finger.
    fn scan_marked_objects(
        &self,
        heap: &HeapSource,
        model: &dyn ObjectModel,
        mark_stack: &mut Vec<ObjectReference>,
        lists: &mut ReferenceLists,
    ) {
        heap.mark_bits.scan_walk(|addr, finger| {
            let obj = ObjectReference::from_address(addr);
            self.scan_one(heap, model, obj, finger, mark_stack, lists);
        });
        self.drain_mark_stack(heap, model, mark_stack, lists);
    }

    fn drain_mark_stack(
        &self,
        heap: &HeapSource,
        model: &dyn ObjectModel,
        mark_stack: &mut Vec<ObjectReference>,
        lists: &mut ReferenceLists,
    ) {
        let infinity = unsafe { Address::from_usize(usize::MAX) };
        while let Some(obj) = mark_stack.pop() {
            self.scan_one(heap, model, obj, infinity, mark_stack, lists);
        }
    }

    /// Scans one already-marked object: marks its outgoing references
    /// (pushing to `mark_stack` only if the target lies below `finger`),
    /// and if it is a reference object, enqueues it on the appropriate
    /// strength list.
    fn scan_one(
        &self,
        heap: &HeapSource,
        model: &dyn ObjectModel,
        obj: ObjectReference,
        finger: Address,
        mark_stack: &mut Vec<ObjectReference>,
        lists: &mut ReferenceLists,
    ) {
        let outcome = scan_object(model, obj, |slot| {
            let target = load_reference(slot);
            if target.is_null() {
                return;
            }
            let already_marked = heap.mark_bits.set_and_return_old(target.to_address());
            if !already_marked && target.to_address() < finger {
                mark_stack.push(target);
            }
        });

        if let Some(referent_slot) = outcome.referent_slot {
            let class = model.class_of(obj);
            let flags = model.flags_of(class);
            let Some(kind) = classify_reference(flags) else { return };
            let referent = load_reference(referent_slot);
            let referent_marked = !referent.is_null() && heap.mark_bits.test(referent.to_address());
            let list = match kind {
                ReferenceKind::Soft => &mut lists.soft,
                ReferenceKind::Weak => &mut lists.weak,
                ReferenceKind::Finalizer => &mut lists.finalizer,
                ReferenceKind::Phantom => &mut lists.phantom,
            };
            ReferenceLists::try_enqueue(list, model, obj, referent_marked);
        }
    }

    /// `scanGrayObjects`: find dirty cards, then within each walk forward
    /// over aligned object boundaries, scanning every marked object found
    /// (spec.md §4.6 concurrent remark).
    fn scan_gray_objects(
        &self,
        heap: &HeapSource,
        model: &dyn ObjectModel,
        cards: &CardTable,
        mark_stack: &mut Vec<ObjectReference>,
        lists: &mut ReferenceLists,
    ) {
        use crate::util::constants::CARD_SIZE;
        let infinity = unsafe { Address::from_usize(usize::MAX) };
        cards.scan_dirty_cards(|card_addr| {
            let mut cursor = card_addr;
            let card_end = card_addr.plus(CARD_SIZE);
            while cursor < card_end {
                if !heap.mark_bits.test(cursor) {
                    cursor = cursor.plus(crate::util::constants::ALIGN);
                    continue;
                }
                let obj = ObjectReference::from_address(cursor);
                let size = model.size_of(obj).div_ceil(crate::util::constants::ALIGN) * crate::util::constants::ALIGN;
                self.scan_one(heap, model, obj, infinity, mark_stack, lists);
                cursor = cursor.plus(size.max(crate::util::constants::ALIGN));
            }
        });
    }

    /// The full strength-ordered reference-processing pass (spec.md §4.6
    /// steps 1-6).
    fn process_references(
        &self,
        heap: &HeapSource,
        model: &dyn ObjectModel,
        mark_stack: &mut Vec<ObjectReference>,
        lists: &mut ReferenceLists,
        do_preserve: bool,
    ) -> PendingEnqueue {
        let is_white = |r: ObjectReference| !heap.mark_bits.test(r.to_address());
        let mut pending = PendingEnqueue::new();

        if do_preserve {
            preserve_some_soft_references(model, &lists.soft, |slot| {
                let target = load_reference(slot);
                if !target.is_null() && !heap.mark_bits.set_and_return_old(target.to_address()) {
                    mark_stack.push(target);
                }
            });
        }
        clear_white_references(model, &lists.soft, is_white, &mut pending);
        clear_white_references(model, &lists.weak, is_white, &mut pending);

        let resurrected = enqueue_finalizer_references(
            model,
            &lists.finalizer,
            is_white,
            |slot| {
                let target = ObjectReference::from_address(slot);
                if !heap.mark_bits.set_and_return_old(target.to_address()) {
                    mark_stack.push(target);
                }
            },
            &mut pending,
        );
        let _ = resurrected;
        self.drain_mark_stack(heap, model, mark_stack, lists);

        // Re-clear soft/weak to catch chains only reachable through
        // finalizer-resurrected objects (spec.md §4.6 step 5).
        clear_white_references(model, &lists.soft, is_white, &mut pending);
        clear_white_references(model, &lists.weak, is_white, &mut pending);
        clear_white_references(model, &lists.phantom, is_white, &mut pending);

        close_circular_list(model, &lists.soft);
        close_circular_list(model, &lists.weak);
        close_circular_list(model, &lists.finalizer);
        close_circular_list(model, &lists.phantom);

        pending
    }

    /// Sweeps the active sub-heap (and, for a non-partial collection,
    /// the zygote sub-heap too) via `Bitmap::sweep_walk`, bulk-freeing
    /// each batch back into the heap source.
    fn sweep(&self, heap: &HeapSource, is_partial: bool) -> (usize, usize) {
        let mut bytes_freed = 0;
        let mut objects_freed = 0;
        let mut sweep_one = |lo: Address, hi: Address| {
            crate::util::bitmap::Bitmap::sweep_walk(&heap.live_bits, &heap.mark_bits, lo, hi, |batch| {
                // The sweep_walk contract only reports addresses; without
                // a size table this crate's heap source cannot recover
                // the original allocation size. `chunk_size` returns the
                // alignment-granularity lower bound documented on
                // `HeapSource::chunk_size`; a real `NativeHeap` backing
                // would report the real size here instead.
                let ptrs: Vec<(Address, usize)> = batch.iter().map(|&a| (a, heap.chunk_size(a).unwrap_or(8))).collect();
                if let Ok(reclaimed) = heap.free_list(&ptrs) {
                    bytes_freed += reclaimed;
                    objects_freed += ptrs.len();
                }
            });
        };
        let active = heap.active_heap();
        sweep_one(active.base(), active.brk());
        if !is_partial {
            if let Some(zygote) = heap.zygote_heap() {
                sweep_one(zygote.base(), zygote.brk());
            }
        }
        (bytes_freed, objects_freed)
    }
}
