//! `dalvikheap`: a managed-heap core for a mobile VM.
//!
//! Provides the heap source (virtual-memory reservation, sub-heaps,
//! growth policy), two collection engines (mark-sweep and mostly-copying),
//! the card-table write barrier and heap bitmap they share, a JDWP
//! debugger-protocol engine, and an HPROF heap-dump emitter. The crate
//! does not implement a VM itself: [`vm::MutatorRuntime`] and its sibling
//! traits are the seam an embedding runtime implements to plug its
//! threads, object layout, and class metadata into the collectors.

pub mod gc;
pub mod heap;
pub mod hprof;
pub mod jdwp;
pub mod util;
pub mod vm;
