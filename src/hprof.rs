//! HPROF heap-dump snapshot emitter (spec.md §4.8).
//!
//! A dump is produced in two halves and composed only once writing
//! completes (`dalvik/vm/hprof/Hprof.cpp`'s `hprofStartup`/`hprofShutdown`):
//! a "tail" of `HEAP_DUMP_SEGMENT`/`HEAP_DUMP_END` records built while the
//! root set and live bitmap are walked, and a "head" of the file magic,
//! interned strings and `LOAD_CLASS` records, plus a dummy `STACK_TRACE`
//! record, built afterwards once every string/class referenced by the
//! tail is known. The final file is `head ++ tail`.
//!
//! Class-format/field-name reflection is out of scope (spec.md's carried
//! Non-goals list "class-format parsing"): `CLASS_DUMP` records carry
//! identity, superclass, loader and instance size but an empty field
//! table. `INSTANCE_DUMP`/`OBJECT_ARRAY_DUMP` records still carry every
//! object's real reference-bearing payload (the data retention analysis
//! actually depends on), read through the same [`ObjectModel`] the
//! collectors use.

use crate::gc::object_model::{load_reference, ClassFlags, ObjectModel};
use crate::util::address::ObjectReference;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

const HPROF_MAGIC: &[u8] = b"JAVA PROFILE 1.0.3\0";
/// spec.md §6: "4-byte identifier size (always 4)" — overrides the
/// source's `sizeof(void*)`-sized ids. Object addresses are truncated to
/// `u32` accordingly; see DESIGN.md Open Question 7.
const ID_SIZE: u32 = 4;
const HPROF_NULL_STACK_TRACE: u32 = 0;
const HPROF_NULL_THREAD: u32 = 0;

const OBJECTS_PER_SEGMENT: usize = 128;
const BYTES_PER_SEGMENT: usize = 4096;

#[repr(u8)]
#[derive(Copy, Clone)]
enum Tag {
    String = 0x01,
    LoadClass = 0x02,
    StackTrace = 0x05,
    HeapDumpSegment = 0x1C,
    HeapDumpEnd = 0x2C,
}

#[repr(u8)]
#[derive(Copy, Clone)]
enum HeapTag {
    HeapDumpInfo = 0xFE,
    ClassDump = 0x20,
    InstanceDump = 0x21,
    ObjectArrayDump = 0x22,
    PrimitiveArrayDump = 0x23,
}

/// Basic element/field type tags, matching HPROF's own `hprof_basic_type`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum BasicType {
    Object = 2,
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl BasicType {
    pub const fn size(self) -> usize {
        match self {
            BasicType::Object | BasicType::Float | BasicType::Int => 4,
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Double | BasicType::Long => 8,
        }
    }
}

/// Which sub-heap an object lives in, for the `HEAP_DUMP_INFO` origin-change
/// chunk (spec.md §4.8 "whenever the current object's origin ... changes").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum HeapId {
    Default,
    Zygote,
    App,
}

impl HeapId {
    fn code(self) -> u32 {
        match self {
            HeapId::Default => 0,
            HeapId::Zygote => b'Z' as u32,
            HeapId::App => b'A' as u32,
        }
    }

    fn label(self) -> &'static str {
        match self {
            HeapId::Default => "<default>",
            HeapId::Zygote => "zygote",
            HeapId::App => "app",
        }
    }
}

/// The GC root kinds a `RootVisitor` reports, mapped to HPROF's
/// `hprof_heap_tag_t` root tags (spec.md §4.8).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RootKind {
    Unknown,
    JniGlobal { jni_ref: u32 },
    JniLocal { thread_serial: u32 },
    JavaFrame { thread_serial: u32 },
    NativeStack { thread_serial: u32 },
    StickyClass,
    ThreadBlock { thread_serial: u32 },
    MonitorUsed,
    ThreadObject { thread_serial: u32 },
    InternedString,
    Debugger,
    VmInternal,
    JniMonitor { thread_serial: u32 },
}

fn root_tag(kind: RootKind) -> u8 {
    match kind {
        RootKind::Unknown => 0xFF,
        RootKind::JniGlobal { .. } => 0x01,
        RootKind::JniLocal { .. } => 0x02,
        RootKind::JavaFrame { .. } => 0x03,
        RootKind::NativeStack { .. } => 0x04,
        RootKind::StickyClass => 0x05,
        RootKind::ThreadBlock { .. } => 0x06,
        RootKind::MonitorUsed => 0x07,
        RootKind::ThreadObject { .. } => 0x08,
        RootKind::InternedString => 0x89,
        RootKind::Debugger => 0x8b,
        RootKind::VmInternal => 0x8d,
        RootKind::JniMonitor { .. } => 0x8e,
    }
}

/// Enumerates every GC root, tagged with the kind HPROF needs to classify
/// it (unlike [`crate::gc::roots::RootVisitor`], which the collectors use
/// and which has no notion of "kind").
pub trait HeapDumpRootVisitor {
    fn visit_roots(&self, cb: &mut dyn FnMut(RootKind, ObjectReference));
}

/// Class/object metadata [`ObjectModel`] doesn't carry, needed only for
/// heap-dump formatting (spec.md §4.8). Implemented by the embedding VM's
/// class/object representation alongside `ObjectModel`.
pub trait HeapDumpModel: ObjectModel {
    /// Human-readable class name, e.g. `"java.lang.String"`.
    fn class_name(&self, class: ObjectReference) -> String;
    fn super_class(&self, class: ObjectReference) -> Option<ObjectReference>;
    /// `0` (null) if the class was loaded by the boot class loader.
    fn class_loader(&self, class: ObjectReference) -> ObjectReference;
    /// Element count of an array object (object or primitive).
    fn array_length(&self, obj: ObjectReference) -> u32;
    /// Element type of a primitive array's class.
    fn primitive_element_type(&self, class: ObjectReference) -> BasicType;
    /// One element of a primitive array, widened to `u64`; the emitter
    /// narrows it back to `primitive_element_type`'s size before writing.
    fn primitive_element(&self, obj: ObjectReference, index: u32) -> u64;
    fn is_zygote_object(&self, obj: ObjectReference) -> bool;
}

fn obj_id(obj: ObjectReference) -> u32 {
    obj.to_address().as_usize() as u32
}

fn push_record(out: &mut Vec<u8>, tag: u8, time: u32, body: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&time.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
}

/// Builds a two-part HPROF snapshot: call [`Self::mark_root`] for every
/// root and [`Self::dump_object`] for every live object (in that order,
/// matching `hprofDumpHeap`'s root-visit-then-bitmap-walk sequence), then
/// [`Self::finish`] to compose and write the result.
pub struct HprofEmitter {
    strings: Vec<(u32, String)>,
    string_ids: HashMap<String, u32>,
    next_string_id: u32,
    /// Classes referenced by the dump so far, with the string id of their
    /// name already interned (spec.md §4.8 class-dump prefix).
    classes: Vec<(ObjectReference, u32)>,
    classes_seen: HashSet<ObjectReference>,
    tail: Vec<u8>,
    segment: Vec<u8>,
    objects_in_segment: usize,
    current_heap: HeapId,
}

impl Default for HprofEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl HprofEmitter {
    pub fn new() -> Self {
        HprofEmitter {
            strings: Vec::new(),
            string_ids: HashMap::new(),
            next_string_id: 1,
            classes: Vec::new(),
            classes_seen: HashSet::new(),
            tail: Vec::new(),
            segment: Vec::new(),
            objects_in_segment: 0,
            current_heap: HeapId::Default,
        }
    }

    fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.next_string_id;
        self.next_string_id += 1;
        self.strings.push((id, s.to_string()));
        self.string_ids.insert(s.to_string(), id);
        id
    }

    /// Registers `class` for a `LOAD_CLASS` record and interns its name,
    /// mirroring `hprofLookupClassId`'s "make sure the class's name is in
    /// the string table" side effect.
    fn lookup_class_id(&mut self, model: &dyn HeapDumpModel, class: ObjectReference) -> u32 {
        let name_id = self.intern_string(&model.class_name(class));
        if self.classes_seen.insert(class) {
            self.classes.push((class, name_id));
        }
        obj_id(class)
    }

    fn flush_segment(&mut self) {
        if self.segment.is_empty() {
            return;
        }
        push_record(&mut self.tail, Tag::HeapDumpSegment as u8, 0, &self.segment);
        self.segment.clear();
        self.objects_in_segment = 0;
        self.current_heap = HeapId::Default;
    }

    fn ensure_capacity(&mut self) {
        if self.objects_in_segment >= OBJECTS_PER_SEGMENT || self.segment.len() >= BYTES_PER_SEGMENT {
            self.flush_segment();
        }
    }

    /// Records a GC root (spec.md §4.8 root-visit phase).
    pub fn mark_root(&mut self, kind: RootKind, obj: ObjectReference) {
        self.ensure_capacity();
        self.segment.push(root_tag(kind));
        self.segment.extend_from_slice(&obj_id(obj).to_be_bytes());
        match kind {
            RootKind::JniGlobal { jni_ref } => {
                self.segment.extend_from_slice(&jni_ref.to_be_bytes());
            }
            RootKind::JniLocal { thread_serial } | RootKind::JavaFrame { thread_serial } | RootKind::JniMonitor { thread_serial } => {
                self.segment.extend_from_slice(&thread_serial.to_be_bytes());
                self.segment.extend_from_slice(&u32::MAX.to_be_bytes());
            }
            RootKind::NativeStack { thread_serial } | RootKind::ThreadBlock { thread_serial } => {
                self.segment.extend_from_slice(&thread_serial.to_be_bytes());
            }
            RootKind::ThreadObject { thread_serial } => {
                self.segment.extend_from_slice(&thread_serial.to_be_bytes());
                self.segment.extend_from_slice(&u32::MAX.to_be_bytes());
            }
            RootKind::Unknown | RootKind::StickyClass | RootKind::MonitorUsed | RootKind::InternedString | RootKind::Debugger | RootKind::VmInternal => {}
        }
        self.objects_in_segment += 1;
    }

    /// Dumps one live object (spec.md §4.8 live-bitmap-walk phase).
    pub fn dump_object(&mut self, model: &dyn HeapDumpModel, obj: ObjectReference) {
        self.ensure_capacity();

        let desired_heap = if model.is_zygote_object(obj) { HeapId::Zygote } else { HeapId::App };
        if desired_heap != self.current_heap {
            self.segment.push(HeapTag::HeapDumpInfo as u8);
            self.segment.extend_from_slice(&desired_heap.code().to_be_bytes());
            let name_id = self.intern_string(desired_heap.label());
            self.segment.extend_from_slice(&name_id.to_be_bytes());
            self.current_heap = desired_heap;
        }

        let class = model.class_of(obj);
        let flags = model.flags_of(class);

        if flags.contains(ClassFlags::IS_CLASS_OBJECT) {
            self.dump_class_object(model, obj);
        } else if flags.contains(ClassFlags::IS_ARRAY) {
            if flags.contains(ClassFlags::IS_OBJECT_ARRAY) {
                let class_id = self.lookup_class_id(model, class);
                self.dump_object_array(model, obj, class_id);
            } else {
                self.dump_primitive_array(model, obj, class);
            }
        } else {
            let class_id = self.lookup_class_id(model, class);
            self.dump_instance(model, obj, class_id);
        }

        self.objects_in_segment += 1;
    }

    fn dump_class_object(&mut self, model: &dyn HeapDumpModel, obj: ObjectReference) {
        let class_id = self.lookup_class_id(model, obj);
        let super_id = model.super_class(obj).map(obj_id).unwrap_or(0);
        self.segment.push(HeapTag::ClassDump as u8);
        self.segment.extend_from_slice(&class_id.to_be_bytes());
        self.segment.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
        self.segment.extend_from_slice(&super_id.to_be_bytes());
        self.segment.extend_from_slice(&obj_id(model.class_loader(obj)).to_be_bytes());
        self.segment.extend_from_slice(&0u32.to_be_bytes()); // signer
        self.segment.extend_from_slice(&0u32.to_be_bytes()); // protection domain
        self.segment.extend_from_slice(&0u32.to_be_bytes()); // reserved
        self.segment.extend_from_slice(&0u32.to_be_bytes()); // reserved
        self.segment.extend_from_slice(&(model.size_of(obj) as u32).to_be_bytes());
        self.segment.extend_from_slice(&0u16.to_be_bytes()); // empty const pool
        self.segment.extend_from_slice(&0u16.to_be_bytes()); // static field count (Non-goal: field reflection)
        self.segment.extend_from_slice(&0u16.to_be_bytes()); // instance field count
    }

    fn dump_object_array(&mut self, model: &dyn HeapDumpModel, obj: ObjectReference, class_id: u32) {
        let length = model.array_length(obj);
        self.segment.push(HeapTag::ObjectArrayDump as u8);
        self.segment.extend_from_slice(&obj_id(obj).to_be_bytes());
        self.segment.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
        self.segment.extend_from_slice(&length.to_be_bytes());
        self.segment.extend_from_slice(&class_id.to_be_bytes());
        let segment = &mut self.segment;
        model.visit_array_elements(obj, &mut |slot| {
            let value = load_reference(slot);
            segment.extend_from_slice(&obj_id(value).to_be_bytes());
        });
    }

    fn dump_primitive_array(&mut self, model: &dyn HeapDumpModel, obj: ObjectReference, class: ObjectReference) {
        let elem_type = model.primitive_element_type(class);
        let length = model.array_length(obj);
        self.segment.push(HeapTag::PrimitiveArrayDump as u8);
        self.segment.extend_from_slice(&obj_id(obj).to_be_bytes());
        self.segment.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
        self.segment.extend_from_slice(&length.to_be_bytes());
        self.segment.push(elem_type as u8);
        for i in 0..length {
            let v = model.primitive_element(obj, i);
            match elem_type.size() {
                1 => self.segment.push(v as u8),
                2 => self.segment.extend_from_slice(&(v as u16).to_be_bytes()),
                4 => self.segment.extend_from_slice(&(v as u32).to_be_bytes()),
                8 => self.segment.extend_from_slice(&v.to_be_bytes()),
                _ => unreachable!("BasicType::size() only returns 1/2/4/8"),
            }
        }
    }

    fn dump_instance(&mut self, model: &dyn HeapDumpModel, obj: ObjectReference, class_id: u32) {
        self.segment.push(HeapTag::InstanceDump as u8);
        self.segment.extend_from_slice(&obj_id(obj).to_be_bytes());
        self.segment.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
        self.segment.extend_from_slice(&class_id.to_be_bytes());

        // Reserve space for the instance-data length, unknown until the
        // fields below are written; patched in once `start` is known.
        let patch_at = self.segment.len();
        self.segment.extend_from_slice(&0u32.to_be_bytes());
        let start = self.segment.len();

        let segment = &mut self.segment;
        model.visit_reference_slots(obj, &mut |slot| {
            let value = load_reference(slot);
            segment.extend_from_slice(&obj_id(value).to_be_bytes());
        });

        let written = (self.segment.len() - start) as u32;
        self.segment[patch_at..patch_at + 4].copy_from_slice(&written.to_be_bytes());
    }

    /// Builds the head (magic, strings, classes, dummy stack trace) and
    /// tail (heap-dump segments), matching `hprofShutdown`'s head-then-tail
    /// ordering. Shared by [`finish`](Self::finish) (plain file output) and
    /// [`finish_to_ddms`](Self::finish_to_ddms) (DDMS chunk output).
    fn compose(mut self) -> (Vec<u8>, Vec<u8>) {
        self.flush_segment();
        push_record(&mut self.tail, Tag::HeapDumpEnd as u8, 0, &[]);

        let mut head = Vec::new();
        head.extend_from_slice(HPROF_MAGIC);
        head.extend_from_slice(&ID_SIZE.to_be_bytes());
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        head.extend_from_slice(&now_ms.to_be_bytes());

        for (id, text) in &self.strings {
            let mut body = Vec::with_capacity(4 + text.len());
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(text.as_bytes());
            push_record(&mut head, Tag::String as u8, 0, &body);
        }

        for (serial, &(class, name_id)) in self.classes.iter().enumerate() {
            let mut body = Vec::with_capacity(16);
            body.extend_from_slice(&((serial + 1) as u32).to_be_bytes());
            body.extend_from_slice(&obj_id(class).to_be_bytes());
            body.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
            body.extend_from_slice(&name_id.to_be_bytes());
            push_record(&mut head, Tag::LoadClass as u8, 0, &body);
        }

        let mut stack_trace_body = Vec::with_capacity(12);
        stack_trace_body.extend_from_slice(&HPROF_NULL_STACK_TRACE.to_be_bytes());
        stack_trace_body.extend_from_slice(&HPROF_NULL_THREAD.to_be_bytes());
        stack_trace_body.extend_from_slice(&0u32.to_be_bytes());
        push_record(&mut head, Tag::StackTrace as u8, 0, &stack_trace_body);

        (head, self.tail)
    }

    /// Writes `head ++ tail` to `out` — the plain-file path (`directToDdms
    /// == false` in the source).
    pub fn finish<W: Write>(self, mut out: W) -> io::Result<()> {
        let (head, tail) = self.compose();
        out.write_all(&head)?;
        out.write_all(&tail)
    }

    /// Wraps `head ++ tail` as a single `"HPDS"` DDMS chunk, the
    /// `directToDdms == true` path in the source (`hprofShutdown`'s
    /// two-element `iovec` handed to `dvmDbgDdmSendChunkV`).
    pub fn finish_to_ddms(self) -> Vec<u8> {
        let (head, tail) = self.compose();
        ddms_chunk(CHUNK_HPDS, &[head, tail].concat())
    }
}

/// DDMS chunk type tags this emitter produces, the 4-character ASCII tag
/// packed big-endian the way `CHUNK_TYPE(...)` does in the source.
const CHUNK_HPDS: u32 = u32::from_be_bytes(*b"HPDS");

/// Frames `payload` as one DDMS chunk: 4-byte type, 4-byte big-endian
/// length, then the payload. Multiple chunks may be concatenated in a
/// single DDM (cmd-set 199) packet body.
fn ddms_chunk(chunk_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&chunk_type.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::object_model::{HashState, ReferenceOffsets};
    use crate::util::address::Address;
    use std::cell::RefCell;

    fn obj(id: usize) -> ObjectReference {
        ObjectReference::from_address(unsafe { Address::from_usize(id) })
    }

    struct FakeModel {
        class_of: RefCell<HashMap<usize, usize>>,
        names: RefCell<HashMap<usize, String>>,
        refs: RefCell<HashMap<usize, Vec<ObjectReference>>>,
    }

    impl ObjectModel for FakeModel {
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
            24
        }
        fn visit_reference_slots(&self, o: ObjectReference, cb: &mut dyn FnMut(crate::util::address::Address)) {
            for (i, &r) in self.refs.borrow().get(&o.to_address().as_usize()).unwrap_or(&vec![]).iter().enumerate() {
                cb(scratch_slot(o, i, r));
            }
        }
        fn referent_slot(&self, o: ObjectReference) -> crate::util::address::Address {
            o.to_address().plus(8)
        }
        fn pending_next_slot(&self, o: ObjectReference) -> crate::util::address::Address {
            o.to_address().plus(16)
        }
        fn zombie_slot(&self, o: ObjectReference) -> crate::util::address::Address {
            o.to_address().plus(24)
        }
        fn is_enqueueable(&self, _o: ObjectReference) -> bool {
            false
        }
        fn mark_enqueued(&self, _o: ObjectReference) {}
        fn visit_array_elements(&self, _o: ObjectReference, _cb: &mut dyn FnMut(crate::util::address::Address)) {}
        fn visit_class_object_slots(&self, _o: ObjectReference, _cb: &mut dyn FnMut(crate::util::address::Address)) {}
        fn hash_state(&self, _o: ObjectReference) -> HashState {
            HashState::Unhashed
        }
        fn set_hash_state(&self, _o: ObjectReference, _state: HashState) {}
    }

    impl HeapDumpModel for FakeModel {
        fn class_name(&self, class: ObjectReference) -> String {
            self.names.borrow()[&class.to_address().as_usize()].clone()
        }
        fn super_class(&self, _class: ObjectReference) -> Option<ObjectReference> {
            None
        }
        fn class_loader(&self, _class: ObjectReference) -> ObjectReference {
            ObjectReference::NULL
        }
        fn array_length(&self, _obj: ObjectReference) -> u32 {
            0
        }
        fn primitive_element_type(&self, _class: ObjectReference) -> BasicType {
            BasicType::Byte
        }
        fn primitive_element(&self, _obj: ObjectReference, _index: u32) -> u64 {
            0
        }
        fn is_zygote_object(&self, _obj: ObjectReference) -> bool {
            false
        }
    }

    /// A real, leaked word of memory holding `referenced`'s address, so
    /// `load_reference` (which reads through a raw pointer) has somewhere
    /// real to read from; this fake model has no actual object headers.
    fn scratch_slot(_holder: ObjectReference, _index: usize, referenced: ObjectReference) -> crate::util::address::Address {
        let cell: &'static mut usize = Box::leak(Box::new(referenced.to_address().as_usize()));
        crate::util::address::Address::from_ptr(cell as *const usize)
    }

    #[test]
    fn root_then_instance_dump_round_trips_through_finish() {
        let model = FakeModel {
            class_of: RefCell::new(HashMap::from([(0x100, 0x900)])),
            names: RefCell::new(HashMap::from([(0x900, "com.example.Thing".to_string())])),
            refs: RefCell::new(HashMap::new()),
        };
        let mut emitter = HprofEmitter::new();
        emitter.mark_root(RootKind::StickyClass, obj(0x900));
        emitter.dump_object(&model, obj(0x100));

        let mut out = Vec::new();
        emitter.finish(&mut out).unwrap();

        assert_eq!(&out[0..HPROF_MAGIC.len()], HPROF_MAGIC);
        assert!(out.len() > HPROF_MAGIC.len() + 8);
        // The dummy stack-trace record and heap-dump-end tag must both be
        // present somewhere in the composed output.
        assert!(out.windows(1).any(|w| w[0] == Tag::HeapDumpEnd as u8));
    }

    #[test]
    fn segment_flushes_after_object_count_threshold() {
        let model = FakeModel {
            class_of: RefCell::new(HashMap::from([(0x100, 0x900)])),
            names: RefCell::new(HashMap::from([(0x900, "com.example.Thing".to_string())])),
            refs: RefCell::new(HashMap::new()),
        };
        let mut emitter = HprofEmitter::new();
        for _ in 0..OBJECTS_PER_SEGMENT + 1 {
            emitter.dump_object(&model, obj(0x100));
        }
        // At least one HEAP_DUMP_SEGMENT record must already be in `tail`
        // (flushed mid-dump), ahead of whatever `finish` flushes last.
        assert!(!emitter.tail.is_empty());
    }

    #[test]
    fn finish_to_ddms_wraps_head_and_tail_in_one_hpds_chunk() {
        let model = FakeModel {
            class_of: RefCell::new(HashMap::from([(0x100, 0x900)])),
            names: RefCell::new(HashMap::from([(0x900, "com.example.Thing".to_string())])),
            refs: RefCell::new(HashMap::new()),
        };
        let mut emitter = HprofEmitter::new();
        emitter.dump_object(&model, obj(0x100));

        let mut plain = Vec::new();
        let mut emitter2 = HprofEmitter::new();
        emitter2.dump_object(&model, obj(0x100));
        emitter2.finish(&mut plain).unwrap();

        let chunk = emitter.finish_to_ddms();
        assert_eq!(&chunk[0..4], b"HPDS");
        let declared_len = u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as usize;
        assert_eq!(declared_len, chunk.len() - 8);
        assert_eq!(declared_len, plain.len());
    }
}
