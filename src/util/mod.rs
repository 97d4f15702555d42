//! Leaf primitives shared by every layer above: address arithmetic,
//! quasi-atomics, the heap bitmap and card table, named locks, typed
//! options, error taxonomies, and the logging wrapper.

pub mod address;
pub mod atomics;
pub mod bitmap;
pub mod cardtable;
pub mod constants;
pub mod error;
pub mod logger;
pub mod mutex;
pub mod options;

pub use address::{Address, ObjectReference};
pub use atomics::{long_atomics_use_mutexes, Quasi64};
pub use bitmap::Bitmap;
pub use cardtable::CardTable;
pub use error::{HeapError, HeapResult, JdwpError, JdwpResult};
pub use mutex::{
    LockLevel, NamedCondvar, NamedMutex, NamedMutexGuard, NamedRwMutex, NamedRwReadGuard,
    NamedRwWriteGuard, WaitResult,
};
pub use options::{HeapSourceBackend, Options};
