//! The embedder-facing trait boundary (spec.md §6): the collaborator
//! contracts the managed-heap core consumes from the rest of the VM —
//! `MutatorRuntime` (threads, roots, class metadata), `NativeHeap` (a
//! swappable malloc), and `DebugFrontend` (the DDMS/JDWP consumer) — plus
//! the glue that drives HPROF dumping and native-frame pinning against
//! those contracts.

use crate::gc::mark_sweep::SystemWeakVisitor;
use crate::gc::object_model::ObjectModel;
use crate::gc::reference_processor::PendingEnqueue;
use crate::gc::roots::RootVisitor;
use crate::hprof::{HeapDumpModel, HeapDumpRootVisitor, HprofEmitter};
use crate::util::address::{Address, ObjectReference};
use crate::util::bitmap::Bitmap;
use crate::util::constants::BYTES_IN_WORD;
use std::ptr::NonNull;

/// "Managed runtime → core" (spec.md §6, "consumed contracts"): thread
/// enumeration, register maps for precise stack scanning, and the two
/// finalization hooks the collector hands back to the runtime rather than
/// running itself. Root enumeration, object-field visiting, and
/// system-weak sweeping are separate, narrower traits
/// ([`RootVisitor`], [`ObjectModel`], [`SystemWeakVisitor`]) the same
/// runtime object also implements.
pub trait MutatorRuntime: ObjectModel + RootVisitor + SystemWeakVisitor {
    /// `Thread::Current()`'s id.
    fn current_thread_id(&self) -> u64;
    /// The live thread list, pinned against modification by the caller
    /// for the duration of a root visit (spec.md §5's thread-list lock).
    fn thread_ids(&self) -> Vec<u64>;
    /// `getRegisterMap(method) -> bitmap or null`.
    fn register_map(&self, method_id: u64) -> Option<Vec<u8>>;
    /// `getRegisterMapLine(map, pc_offset) -> u1*`.
    fn register_map_line(&self, map: &[u8], pc_offset: u64) -> Option<Vec<u8>>;
    fn run_finalization(&self);
    fn enqueue_cleared_references(&self, list: PendingEnqueue);
}

/// A thin malloc/free/footprint trait (spec.md's `NativeHeap`) so a
/// libc-backed allocator can be swapped for a test double without
/// touching anything that consumes it.
pub trait NativeHeap {
    fn native_alloc(&self, size: usize) -> Option<NonNull<u8>>;
    fn native_free(&self, ptr: NonNull<u8>, size: usize);
    /// Current resident footprint, used to decide whether
    /// `registerNativeAllocation` should itself trigger a GC.
    fn footprint(&self) -> usize;
}

/// `libc::malloc`/`libc::free`-backed [`NativeHeap`] — spec.md's
/// "general-purpose malloc (`dlmalloc`-shaped)" collaborator, realized
/// with the platform allocator rather than a from-scratch dlmalloc port.
#[derive(Default)]
pub struct SystemNativeHeap;

impl NativeHeap for SystemNativeHeap {
    fn native_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        NonNull::new(ptr)
    }

    fn native_free(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) };
    }

    fn footprint(&self) -> usize {
        let mut sys = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(|p| p.memory() as usize).unwrap_or(0)
    }
}

/// DDMS/JDWP debugger frontend (spec.md's "DDMS/Debug Frontend"):
/// consumer of heap-profiling chunks and composite JDWP event replies.
pub trait DebugFrontend {
    /// Hands a DDMS chunk (e.g. [`HprofEmitter::finish_to_ddms`]'s output)
    /// to whatever transport is currently attached.
    fn send_ddms_chunk(&self, chunk: &[u8]);
    /// Hands a composite event reply to the attached transport at the
    /// given suspend policy.
    fn send_event(&self, suspend_policy: crate::jdwp::SuspendPolicy, packet: Vec<u8>);
}

/// Drives an HPROF snapshot: a root visit (tagging each root with its
/// HPROF root kind) followed by a live-bitmap walk (spec.md §4.8).
/// `live_bits` is the mark-sweep engine's live bitmap, or the copying
/// engine's to-space occupancy bitmap — either way, every bit set is one
/// live object to dump.
pub fn dump_heap<R>(runtime: &R, live_bits: &Bitmap) -> HprofEmitter
where
    R: HeapDumpModel + HeapDumpRootVisitor,
{
    let mut emitter = HprofEmitter::new();
    runtime.visit_roots(&mut |kind, obj| emitter.mark_root(kind, obj));
    live_bits.walk(|addr| {
        let obj = ObjectReference::from_address(addr);
        emitter.dump_object(runtime, obj);
    });
    emitter
}

/// Precisely pins the object-reference slots of a native method's
/// argument frame using its shorty (return-type-then-parameter-types)
/// signature (spec.md §4.7, "Pinning on native method frames"): `L` slots
/// are pinned, `D`/`J` (8-byte) slots skip two word slots, everything else
/// skips one.
pub fn pin_native_frame_args(shorty: &str, frame_base: Address, mut pin_slot: impl FnMut(Address)) {
    let mut offset = 0usize;
    for kind in shorty.chars().skip(1) {
        let slot = frame_base.plus(offset);
        match kind {
            'L' => {
                pin_slot(slot);
                offset += BYTES_IN_WORD;
            }
            'D' | 'J' => offset += BYTES_IN_WORD * 2,
            _ => offset += BYTES_IN_WORD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_native_frame_args_visits_only_object_slots() {
        let base = unsafe { Address::from_usize(0x1000) };
        let mut pinned = Vec::new();
        // shorty "ILJD" => return int, then (L, J, D): one object slot at
        // offset 0, then J skips two words, then D skips two more.
        pin_native_frame_args("ILJD", base, |slot| pinned.push(slot));
        assert_eq!(pinned, vec![base]);
    }

    #[test]
    fn pin_native_frame_args_finds_every_object_slot_with_correct_offsets() {
        let base = unsafe { Address::from_usize(0x2000) };
        let mut pinned = Vec::new();
        // shorty "VLIL" => return void, then (L, I, L): object slots at
        // word 0 and word 2 (I occupies one word at offset 1).
        pin_native_frame_args("VLIL", base, |slot| pinned.push(slot));
        assert_eq!(pinned, vec![base, base.plus(2 * BYTES_IN_WORD)]);
    }

    #[test]
    fn dump_heap_visits_roots_then_walks_live_bitmap() {
        use crate::gc::object_model::{ClassFlags, HashState, ReferenceOffsets};
        use crate::hprof::{BasicType, RootKind};
        use std::cell::RefCell;
        use std::collections::HashMap;

        struct Runtime {
            class_of: RefCell<HashMap<usize, usize>>,
            names: RefCell<HashMap<usize, String>>,
        }

        fn obj(id: usize) -> ObjectReference {
            ObjectReference::from_address(unsafe { Address::from_usize(id) })
        }

        impl ObjectModel for Runtime {
            fn class_of(&self, o: ObjectReference) -> ObjectReference {
                obj(self.class_of.borrow()[&o.to_address().as_usize()])
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
            fn visit_reference_slots(&self, _obj: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
            fn referent_slot(&self, o: ObjectReference) -> Address {
                o.to_address().plus(8)
            }
            fn pending_next_slot(&self, o: ObjectReference) -> Address {
                o.to_address().plus(16)
            }
            fn zombie_slot(&self, o: ObjectReference) -> Address {
                o.to_address().plus(24)
            }
            fn is_enqueueable(&self, _obj: ObjectReference) -> bool {
                false
            }
            fn mark_enqueued(&self, _obj: ObjectReference) {}
            fn visit_array_elements(&self, _obj: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
            fn visit_class_object_slots(&self, _obj: ObjectReference, _cb: &mut dyn FnMut(Address)) {}
            fn hash_state(&self, _obj: ObjectReference) -> HashState {
                HashState::Unhashed
            }
            fn set_hash_state(&self, _obj: ObjectReference, _state: HashState) {}
        }

        impl HeapDumpModel for Runtime {
            fn class_name(&self, class: ObjectReference) -> String {
                self.names.borrow()[&class.to_address().as_usize()].clone()
            }
            fn super_class(&self, _class: ObjectReference) -> Option<ObjectReference> {
                None
            }
            fn class_loader(&self, _class: ObjectReference) -> ObjectReference {
                obj(0)
            }
            fn array_length(&self, _obj: ObjectReference) -> u32 {
                0
            }
            fn primitive_element_type(&self, _class: ObjectReference) -> BasicType {
                BasicType::Int
            }
            fn primitive_element(&self, _obj: ObjectReference, _index: u32) -> u64 {
                0
            }
            fn is_zygote_object(&self, _obj: ObjectReference) -> bool {
                false
            }
        }

        impl HeapDumpRootVisitor for Runtime {
            fn visit_roots(&self, cb: &mut dyn FnMut(RootKind, ObjectReference)) {
                cb(RootKind::StickyClass, obj(0x900));
            }
        }

        let runtime = Runtime {
            class_of: RefCell::new(HashMap::from([(0x1100, 0x900)])),
            names: RefCell::new(HashMap::from([(0x900, "com.example.Thing".to_string())])),
        };

        let base = unsafe { Address::from_usize(0x1000) };
        let bitmap = Bitmap::new(base, 0x1000);
        bitmap.set(unsafe { Address::from_usize(0x1100) });

        let emitter = dump_heap(&runtime, &bitmap);
        let mut out = Vec::new();
        emitter.finish(&mut out).unwrap();
        // at least the magic/id-size/timestamp header plus one class-load
        // and one instance-dump record.
        assert!(out.len() > 64);
    }
}
