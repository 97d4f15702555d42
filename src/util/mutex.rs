//! Named, level-ordered mutexes, RW-mutexes and condition variables
//! (spec.md §4.2).
//!
//! The source implements these directly on futex syscalls. `std::sync`'s
//! primitives already park on the platform's native primitive (a futex on
//! Linux), so we build on top of `std::sync::{Mutex, Condvar}` rather than
//! re-implement parking — the contract spec.md asks for (CAS-free unlock
//! when uncontended, spurious-wakeup tolerance, recursive mode, a debug
//! lock-order check) is layered on top.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

/// The lock hierarchy from spec.md §5: "acquire in this order; never
/// inverted". Declared as a plain enum so the ordering is `derive`d rather
/// than encoded as magic numbers scattered through call sites.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum LockLevel {
    Logging,
    ThreadList,
    ThreadSuspendCount,
    Heap,
    MutatorExclusive,
    RuntimeShutdown,
    JdwpState,
}

thread_local! {
    /// Held-lock levels for the current thread, most-recently-acquired
    /// last. Only consulted when `debug_assertions` is on; production
    /// builds pay nothing for this beyond the `Mutex<LockLevel>` tag.
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

fn debug_check_acquire(level: LockLevel) {
    if cfg!(debug_assertions) {
        HELD_LOCKS.with(|held| {
            let held = held.borrow();
            if let Some(&innermost) = held.last() {
                assert!(
                    level > innermost,
                    "lock order violation: attempted to acquire {level:?} while holding {innermost:?} (held stack: {held:?})"
                );
            }
        });
    }
}

fn debug_push(level: LockLevel) {
    if cfg!(debug_assertions) {
        HELD_LOCKS.with(|held| held.borrow_mut().push(level));
    }
}

fn debug_pop(level: LockLevel) {
    if cfg!(debug_assertions) {
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            let popped = held.pop();
            debug_assert_eq!(popped, Some(level), "unbalanced lock release for {level:?}");
        });
    }
}

/// Owning thread, recursion depth, and a raw pointer into the data
/// already locked by the outermost guard — only meaningful while
/// `depth > 0`. The pointer is stored as a `usize` so the field stays
/// `Send`/`Sync` regardless of `T`.
type RecursionState = Option<(std::thread::ThreadId, usize, usize)>;

/// A named mutex at a fixed level in the hierarchy, with optional
/// recursive acquisition.
pub struct NamedMutex<T> {
    name: &'static str,
    level: LockLevel,
    recursive: bool,
    inner: StdMutex<T>,
    /// Owning thread + recursion depth, used only when `recursive` is set.
    recursion: StdMutex<RecursionState>,
    contenders: AtomicUsize,
}

pub struct NamedMutexGuard<'a, T> {
    mutex: &'a NamedMutex<T>,
    guard: Option<MutexGuard<'a, T>>,
    /// Set instead of `guard` for a same-thread reentrant acquisition
    /// (see [`NamedMutex::new_recursive`]): derefs through this pointer
    /// rather than holding a second `std::sync::MutexGuard`, which would
    /// deadlock against the outermost guard's own lock.
    reentrant: Option<*mut T>,
}

impl<T> NamedMutex<T> {
    pub fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        NamedMutex {
            name,
            level,
            recursive: false,
            inner: StdMutex::new(value),
            recursion: StdMutex::new(None),
            contenders: AtomicUsize::new(0),
        }
    }

    /// Creates a mutex whose `lock()` may be called again by the thread
    /// that already holds it, per spec.md §4.2: "Recursive mode is
    /// supported and tracked by a per-mutex `recursion_count`."
    pub fn new_recursive(name: &'static str, level: LockLevel, value: T) -> Self {
        let mut m = Self::new(name, level, value);
        m.recursive = true;
        m
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Number of threads currently parked waiting for this mutex. Used by
    /// tests and diagnostics; not load-bearing for correctness.
    pub fn num_contenders(&self) -> usize {
        self.contenders.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> NamedMutexGuard<'_, T> {
        debug_check_acquire(self.level);
        if self.recursive {
            return self.lock_recursive();
        }
        self.contenders.fetch_add(1, Ordering::AcqRel);
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.contenders.fetch_sub(1, Ordering::AcqRel);
        debug_push(self.level);
        NamedMutexGuard { mutex: self, guard: Some(guard), reentrant: None }
    }

    fn lock_recursive(&self) -> NamedMutexGuard<'_, T> {
        let current = std::thread::current().id();
        {
            let mut rec = self.recursion.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((owner, depth, ptr)) = rec.as_mut() {
                if *owner == current {
                    *depth += 1;
                    debug_push(self.level);
                    return NamedMutexGuard { mutex: self, guard: None, reentrant: Some(*ptr as *mut T) };
                }
            }
        }
        self.contenders.fetch_add(1, Ordering::AcqRel);
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.contenders.fetch_sub(1, Ordering::AcqRel);
        let ptr = &mut *guard as *mut T as usize;
        *self.recursion.lock().unwrap_or_else(|p| p.into_inner()) = Some((current, 1, ptr));
        debug_push(self.level);
        NamedMutexGuard { mutex: self, guard: Some(guard), reentrant: None }
    }

    /// Drop this mutex, asserting it is neither held nor contended — spec.md
    /// §4.2: "Destruction of a mutex with a non-zero owner or non-zero
    /// contender count is fatal unless the runtime is shutting down."
    pub fn assert_quiescent(&self) {
        assert_eq!(
            self.num_contenders(),
            0,
            "mutex {} destroyed with {} contenders waiting",
            self.name,
            self.num_contenders()
        );
        assert!(
            self.inner.try_lock().is_ok(),
            "mutex {} destroyed while held",
            self.name
        );
    }
}

impl<'a, T> std::ops::Deref for NamedMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self.reentrant {
            // Safety: this guard was handed out because the current
            // thread already holds `mutex.inner`'s lock (it is the
            // recorded owner); the outermost guard keeps that lock held
            // for at least as long as this guard exists, per the LIFO
            // release contract documented on `new_recursive`.
            Some(ptr) => unsafe { &*ptr },
            None => self.guard.as_ref().unwrap(),
        }
    }
}

impl<'a, T> std::ops::DerefMut for NamedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.reentrant {
            Some(ptr) => unsafe { &mut *ptr },
            None => self.guard.as_mut().unwrap(),
        }
    }
}

impl<'a, T> Drop for NamedMutexGuard<'a, T> {
    fn drop(&mut self) {
        if self.guard.is_some() || self.reentrant.is_some() {
            debug_pop(self.mutex.level);
        }
        if self.mutex.recursive {
            let mut rec = self.mutex.recursion.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((_, depth, _)) = rec.as_mut() {
                *depth -= 1;
                if *depth == 0 {
                    *rec = None;
                } else {
                    debug_assert!(
                        self.guard.is_none(),
                        "recursive mutex {} released out of order: outermost guard dropped \
                         while a reentrant guard was still held",
                        self.mutex.name
                    );
                }
            }
        }
        // `self.guard`, if `Some`, drops after this function returns,
        // releasing `mutex.inner` only once the recursion depth above has
        // already reached zero.
    }
}

impl<'a, T> NamedMutexGuard<'a, T> {
    /// Extracts the underlying `std::sync::MutexGuard`, popping this
    /// guard's entry off the debug lock-order stack without running the
    /// rest of `Drop` (used by [`NamedCondvar::wait`] to hand the guard to
    /// `std::sync::Condvar`, which re-acquires it on wake). Only valid on
    /// a non-recursive or outermost-recursive guard; a reentrant guard
    /// has no `std::sync::MutexGuard` of its own to extract.
    fn into_std_guard(mut self) -> (&'a NamedMutex<T>, MutexGuard<'a, T>) {
        debug_pop(self.mutex.level);
        let guard = self.guard.take().expect("cannot wait on a reentrant recursive guard");
        (self.mutex, guard)
    }
}

/// A condition variable that parks on a `NamedMutex`'s guard, per spec.md
/// §4.2: unlock the guard, park on a sequence counter, re-lock on wake.
/// Spurious wakeups are permitted; callers must loop on their predicate.
pub struct NamedCondvar {
    inner: Condvar,
}

pub enum WaitResult {
    Signaled,
    TimedOut,
}

impl Default for NamedCondvar {
    fn default() -> Self {
        Self::new()
    }
}

impl NamedCondvar {
    pub fn new() -> Self {
        NamedCondvar { inner: Condvar::new() }
    }

    /// Consumes the guard, waits, and returns a fresh guard over the same
    /// mutex — callers must still loop on their predicate, as spurious
    /// wakeups are permitted.
    pub fn wait<'a, T>(&self, guard: NamedMutexGuard<'a, T>) -> NamedMutexGuard<'a, T> {
        let (mutex, std_guard) = guard.into_std_guard();
        let std_guard = match self.inner.wait(std_guard) {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_push(mutex.level);
        NamedMutexGuard { mutex, guard: Some(std_guard), reentrant: None }
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: NamedMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (NamedMutexGuard<'a, T>, WaitResult) {
        let (mutex, std_guard) = guard.into_std_guard();
        let (std_guard, timeout_result) = match self.inner.wait_timeout(std_guard, timeout) {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_push(mutex.level);
        let result = if timeout_result.timed_out() {
            WaitResult::TimedOut
        } else {
            WaitResult::Signaled
        };
        (NamedMutexGuard { mutex, guard: Some(std_guard), reentrant: None }, result)
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

/// A named, level-ordered reader-writer lock. Used for the thread-list
/// lock: root/object visitors take a read lock to walk the live thread
/// list while mutators register/unregister under the write lock (spec.md
/// §5: "Root sets / JNI tables: visitor traversal requires the thread list
/// to be pinned against modification").
pub struct NamedRwMutex<T> {
    name: &'static str,
    level: LockLevel,
    inner: std::sync::RwLock<T>,
}

pub struct NamedRwReadGuard<'a, T> {
    level: LockLevel,
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct NamedRwWriteGuard<'a, T> {
    level: LockLevel,
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> NamedRwMutex<T> {
    pub fn new(name: &'static str, level: LockLevel, value: T) -> Self {
        NamedRwMutex { name, level, inner: std::sync::RwLock::new(value) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn read(&self) -> NamedRwReadGuard<'_, T> {
        debug_check_acquire(self.level);
        let guard = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_push(self.level);
        NamedRwReadGuard { level: self.level, guard }
    }

    pub fn write(&self) -> NamedRwWriteGuard<'_, T> {
        debug_check_acquire(self.level);
        let guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_push(self.level);
        NamedRwWriteGuard { level: self.level, guard }
    }
}

impl<'a, T> std::ops::Deref for NamedRwReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> Drop for NamedRwReadGuard<'a, T> {
    fn drop(&mut self) {
        debug_pop(self.level);
    }
}

impl<'a, T> std::ops::Deref for NamedRwWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> std::ops::DerefMut for NamedRwWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for NamedRwWriteGuard<'a, T> {
    fn drop(&mut self) {
        debug_pop(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn basic_lock_unlock() {
        let m = NamedMutex::new("test", LockLevel::Heap, 0usize);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn detects_inverted_order() {
        let heap = NamedMutex::new("heap", LockLevel::Heap, ());
        let logging = NamedMutex::new("logging", LockLevel::Logging, ());
        let _g1 = heap.lock();
        let _g2 = logging.lock();
    }

    #[test]
    fn allows_correct_order() {
        let logging = NamedMutex::new("logging", LockLevel::Logging, ());
        let heap = NamedMutex::new("heap", LockLevel::Heap, ());
        let _g1 = logging.lock();
        let _g2 = heap.lock();
    }

    #[test]
    fn condvar_wakes_waiter() {
        let pair = Arc::new((NamedMutex::new("cv", LockLevel::Heap, false), NamedCondvar::new()));
        let pair2 = pair.clone();
        let handle = thread::spawn(move || {
            let (mutex, cv) = &*pair2;
            let mut started = mutex.lock();
            while !*started {
                started = cv.wait(started);
            }
        });
        thread::sleep(Duration::from_millis(20));
        {
            let (mutex, cv) = &*pair;
            let mut started = mutex.lock();
            *started = true;
            cv.notify_one();
        }
        handle.join().unwrap();
    }

    #[test]
    fn assert_quiescent_passes_when_unlocked() {
        let m = NamedMutex::new("quiet", LockLevel::Heap, ());
        m.assert_quiescent();
    }

    #[test]
    fn recursive_mutex_allows_same_thread_reacquire() {
        let m = NamedMutex::new_recursive("recursive", LockLevel::Heap, 0usize);
        let outer = m.lock();
        assert_eq!(*outer, 0);
        {
            let mut inner = m.lock();
            *inner += 1;
        }
        // Releasing the inner, reentrant guard must not have unlocked
        // `inner`: the outer guard can still see (and mutate) the value.
        assert_eq!(*outer, 1);
        drop(outer);
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn recursive_mutex_does_not_block_a_non_owning_thread_until_fully_released() {
        let m = Arc::new(NamedMutex::new_recursive("recursive", LockLevel::Heap, 0usize));
        let outer = m.lock();
        let _inner = m.lock();

        let m2 = m.clone();
        let handle = thread::spawn(move || {
            *m2.lock() += 10;
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(m.num_contenders(), 1, "other thread must block while either guard is held");

        drop(_inner);
        drop(outer);
        handle.join().unwrap();
        assert_eq!(*m.lock(), 10);
    }
}
