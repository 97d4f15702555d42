//! The two collection engines (spec.md §4.6 mark-sweep, §4.7 mostly-copying)
//! and the collaborator traits/helpers they share: the object-header
//! contract, root scanning, forwarding-pointer encoding, and strength-
//! ordered reference processing.

pub mod copying;
pub mod daemon;
pub mod forwarding;
pub mod mark_sweep;
pub mod object_model;
pub mod reference_processor;
pub mod roots;

pub use copying::{CopyingSpace, ScavengeReport};
pub use daemon::{channel as gc_daemon_channel, DaemonEvent, DaemonMessage, GcDaemonHandle, GcDaemonLoop};
pub use forwarding::{install_forward, read_class_slot, ClassSlot};
pub use mark_sweep::{CollectionReport, MarkSweepCollector, SystemWeakVisitor, WeakSweepAction};
pub use object_model::{
    classify_reference, load_reference, store_reference, ClassFlags, HashState, ObjectModel,
    ReferenceKind, ReferenceOffsets,
};
pub use reference_processor::{
    clear_white_references, close_circular_list, enqueue_finalizer_references,
    preserve_some_soft_references, PendingEnqueue, ReferenceLists,
};
pub use roots::{class_slot_of, scan_object, RootVisitor, ScanOutcome};
