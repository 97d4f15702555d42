//! The Heap Source: virtual-memory reservation, sub-heaps, allocation,
//! growth policy, and native-allocation accounting (spec.md §4.5).

pub mod heap_source;

pub use heap_source::{GcSpec, GrowthResult, HeapSource, NativeAllocOutcome, SubHeap};
