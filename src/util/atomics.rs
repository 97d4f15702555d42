//! Quasi-Atomic 64-bit operations (spec.md §4.1).
//!
//! `Quasi64` gives linearizable `read`/`write`/`cas` on a single 64-bit
//! cell. On platforms with native 64-bit atomics this is a thin wrapper
//! over [`portable_atomic::AtomicU64`]; where the platform lacks them,
//! `portable-atomic` itself falls back to a lock internally, and we mirror
//! the source's *own* fallback — a small, fixed-size array of stripe
//! mutexes indexed by address — so [`uses_mutex_fallback`] reports
//! degenerate contention risk the same way `dvmQuasiAtomicsUseMutexes`
//! (ART: `atomic.cc`) does.
//!
//! Contract (unchanged from spec.md): concurrent `read`/`write`/`cas` on
//! the *same* address are linearizable; mixing with ordinary loads/stores
//! on that address is undefined; concurrent operations on *different*
//! addresses never block each other beyond stripe collisions.

use crate::util::address::Address;
use crate::util::constants::QUASI_ATOMIC_STRIPE_COUNT;
use portable_atomic::AtomicU64;
use spin::Mutex as SpinMutex;

/// Stripe mutex table used only when the platform cannot give us native
/// 64-bit atomic load/store/CAS (the `portable-atomic` crate reports this
/// for us; on every mainstream target we use the lock-free path).
struct StripeTable {
    stripes: Vec<SpinMutex<()>>,
}

impl StripeTable {
    fn new(n: usize) -> Self {
        StripeTable { stripes: (0..n).map(|_| SpinMutex::new(())).collect() }
    }

    /// Index a stripe by address. Computed in `u64` rather than truncated
    /// to `u32` first — spec.md §9 Open Questions flags the source's
    /// `unsigned`-truncated version as a potential distribution bias on
    /// platforms with >32-bit pointers; we intentionally do not reproduce
    /// that truncation (see DESIGN.md Open Question 1).
    fn index_for(&self, addr: Address) -> usize {
        ((addr.as_usize() as u64 >> 3) % self.stripes.len() as u64) as usize
    }

    fn lock_for(&self, addr: Address) -> spin::MutexGuard<'_, ()> {
        self.stripes[self.index_for(addr)].lock()
    }
}

lazy_static::lazy_static! {
    static ref STRIPES: StripeTable = StripeTable::new(QUASI_ATOMIC_STRIPE_COUNT);
}

/// Whether `Quasi64` operations on this platform are backed by the stripe
/// mutex fallback rather than a native atomic instruction. Higher layers
/// can use this to decide whether degenerate contention (many cells
/// hashing to one stripe) is a real risk.
pub fn long_atomics_use_mutexes() -> bool {
    !cfg!(target_has_atomic = "64")
}

/// A 64-bit cell with linearizable quasi-atomic access.
#[repr(transparent)]
pub struct Quasi64 {
    cell: AtomicU64,
}

impl Quasi64 {
    pub const fn new(value: u64) -> Self {
        Quasi64 { cell: AtomicU64::new(value) }
    }

    /// Reads the cell. `addr` identifies the cell for the stripe-mutex
    /// fallback path and must be the same value used for every `read`/
    /// `write`/`cas` on this cell.
    pub fn read(&self, addr: Address) -> u64 {
        if long_atomics_use_mutexes() {
            let _guard = STRIPES.lock_for(addr);
            self.cell.load(portable_atomic::Ordering::SeqCst)
        } else {
            self.cell.load(portable_atomic::Ordering::SeqCst)
        }
    }

    pub fn write(&self, addr: Address, value: u64) {
        if long_atomics_use_mutexes() {
            let _guard = STRIPES.lock_for(addr);
            self.cell.store(value, portable_atomic::Ordering::SeqCst);
        } else {
            self.cell.store(value, portable_atomic::Ordering::SeqCst);
        }
    }

    /// Compare-and-swap: if the cell holds `old`, replaces it with `new`
    /// and returns `true`; otherwise leaves it untouched and returns
    /// `false`.
    pub fn cas(&self, addr: Address, old: u64, new: u64) -> bool {
        if long_atomics_use_mutexes() {
            let _guard = STRIPES.lock_for(addr);
            if self.cell.load(portable_atomic::Ordering::SeqCst) == old {
                self.cell.store(new, portable_atomic::Ordering::SeqCst);
                true
            } else {
                false
            }
        } else {
            self.cell
                .compare_exchange(
                    old,
                    new,
                    portable_atomic::Ordering::SeqCst,
                    portable_atomic::Ordering::SeqCst,
                )
                .is_ok()
        }
    }

    /// Publishes `value` so a concurrent reader observes a non-zero value
    /// as soon as this call returns — used for JDWP's `lastActivityWhen`
    /// (spec.md §5).
    pub fn swap(&self, addr: Address, value: u64) -> u64 {
        if long_atomics_use_mutexes() {
            let _guard = STRIPES.lock_for(addr);
            self.cell.swap(value, portable_atomic::Ordering::SeqCst)
        } else {
            self.cell.swap(value, portable_atomic::Ordering::SeqCst)
        }
    }
}
