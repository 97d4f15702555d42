//! Heap Source: virtual-memory reservation + per-heap free lists
//! (spec.md §4.5).
//!
//! Owns a contiguous reservation `[base, base+length)` split into at most
//! two sub-heaps: `heaps[0]` is the active heap new allocations are served
//! from; `heaps[1]`, when present, is the immutable zygote heap shared
//! post-fork (spec.md §3/§4.5's `startupBeforeFork`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::gc::daemon::GcDaemonHandle;
use crate::util::address::Address;
use crate::util::bitmap::Bitmap;
use crate::util::constants::{CONCURRENT_MIN_FREE, CONCURRENT_START_BYTES};
use crate::util::error::{HeapError, HeapResult};
use crate::util::mutex::{LockLevel, NamedMutex};

/// A single sub-heap: one backing allocator, its own growth bookkeeping.
pub struct SubHeap {
    base: Address,
    limit: Address,
    /// Current break: `[base, brk)` is committed, `[brk, limit)` is
    /// reserved but not yet backed (spec.md §3 invariant).
    brk: AtomicUsize,
    maximum_size: usize,
    concurrent_start_bytes: AtomicUsize,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    /// `free_offsets` is a simple sorted free list of `(offset, len)` pairs
    /// within `[base, brk)`; a bump pointer serves everything past the
    /// highest freed-and-coalesced region. This stands in for the
    /// `dlmalloc`-shaped native allocator spec.md §1 names as a
    /// collaborator: a real embedding would delegate to `NativeHeap`
    /// instead of this in-crate free list.
    free_list: std::sync::Mutex<Vec<(usize, usize)>>,
    is_zygote: bool,
    frozen: AtomicBool,
}

impl SubHeap {
    fn new(base: Address, initial_size: usize, maximum_size: usize, is_zygote: bool) -> SubHeap {
        SubHeap {
            base,
            limit: base.plus(maximum_size),
            brk: AtomicUsize::new(initial_size),
            maximum_size,
            concurrent_start_bytes: AtomicUsize::new(CONCURRENT_START_BYTES),
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            free_list: std::sync::Mutex::new(Vec::new()),
            is_zygote,
            frozen: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn brk(&self) -> Address {
        self.base.plus(self.brk.load(Ordering::Acquire))
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Acquire)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Acquire)
    }

    pub fn is_zygote(&self) -> bool {
        self.is_zygote
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.brk()
    }

    /// First-fit allocation out of the free list, falling back to the bump
    /// cursor. Returns the allocated address and the rounded-up size.
    fn try_alloc(&self, requested: usize) -> Option<(Address, usize)> {
        let size = requested.div_ceil(8) * 8;
        let mut free = self.free_list.lock().unwrap();
        if let Some(pos) = free.iter().position(|&(_, len)| len >= size) {
            let (offset, len) = free.remove(pos);
            if len > size {
                free.push((offset + size, len - size));
            }
            return Some((self.base.plus(offset), size));
        }
        drop(free);
        // Bump-allocate past the current break, up to the sub-heap's hard
        // maximum (the committed region can always grow to fill the
        // reservation; `HeapSource::alloc`'s soft-limit check is what
        // actually governs whether growth is allowed at a given point).
        let offset = self
            .brk
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur + size <= self.maximum_size {
                    Some(cur + size)
                } else {
                    None
                }
            })
            .ok()?;
        Some((self.base.plus(offset), size))
    }

    fn free(&self, addr: Address, size: usize) -> usize {
        if self.is_zygote {
            // Zygote sub-heap is immutable post-fork: only accounting
            // updates (spec.md §4.5 `freeList`), no actual reclaim.
            return size;
        }
        let offset = addr.diff(self.base);
        self.free_list.lock().unwrap().push((offset, size));
        size
    }
}

/// A collection spec (spec.md §3's `GcSpec`).
#[derive(Copy, Clone, Debug)]
pub struct GcSpec {
    pub is_partial: bool,
    pub is_concurrent: bool,
    pub do_preserve: bool,
    pub reason: &'static str,
}

impl GcSpec {
    pub const FOR_MALLOC: GcSpec = GcSpec { is_partial: true, is_concurrent: false, do_preserve: true, reason: "GC_FOR_MALLOC" };
    pub const CONCURRENT: GcSpec = GcSpec { is_partial: true, is_concurrent: true, do_preserve: true, reason: "GC_CONCURRENT" };
    pub const EXPLICIT: GcSpec = GcSpec { is_partial: false, is_concurrent: true, do_preserve: true, reason: "GC_EXPLICIT" };
    pub const BEFORE_OOM: GcSpec = GcSpec { is_partial: false, is_concurrent: false, do_preserve: false, reason: "GC_BEFORE_OOM" };
}

/// Growth policy inputs/outputs (spec.md §4.5 `growForUtilization`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GrowthResult {
    pub ideal_size: usize,
    pub soft_limit: usize,
    pub concurrent_start_bytes: usize,
}

pub struct HeapSource {
    base: Address,
    length: usize,
    heaps: Vec<SubHeap>,
    pub live_bits: Bitmap,
    pub mark_bits: Bitmap,
    target_utilization: u32,
    min_free: usize,
    max_free: usize,
    growth_limit: std::sync::atomic::AtomicUsize,
    /// `SIZE_MAX` encoded as `usize::MAX`: "no soft limit" (spec.md §3).
    soft_limit: AtomicUsize,
    native_bytes_allocated: AtomicUsize,
    native_footprint_gc_watermark: AtomicUsize,
    native_footprint_limit: AtomicUsize,
    gc_running: AtomicBool,
    heap_lock: NamedMutex<()>,
    /// Set via [`HeapSource::set_gc_daemon`]; `alloc` signals this handle
    /// instead of only logging once `concurrentStartBytes` is crossed.
    /// `None` until a daemon is wired up (e.g. in tests that never spawn
    /// one).
    gc_daemon: spin::Mutex<Option<GcDaemonHandle>>,
}

impl HeapSource {
    pub fn new(base: Address, initial_size: usize, growth_limit: usize, maximum_size: usize) -> HeapSource {
        assert!(initial_size <= growth_limit && growth_limit <= maximum_size);
        let length = maximum_size;
        let active = SubHeap::new(base, initial_size, maximum_size, false);
        HeapSource {
            base,
            length,
            heaps: vec![active],
            live_bits: Bitmap::new(base, length),
            mark_bits: Bitmap::new(base, length),
            target_utilization: 512,
            min_free: 2 << 20,
            max_free: 8 << 20,
            growth_limit: AtomicUsize::new(growth_limit),
            soft_limit: AtomicUsize::new(usize::MAX),
            native_bytes_allocated: AtomicUsize::new(0),
            native_footprint_gc_watermark: AtomicUsize::new(2 << 20),
            native_footprint_limit: AtomicUsize::new(16 << 20),
            gc_running: AtomicBool::new(false),
            heap_lock: NamedMutex::new("HeapSource", LockLevel::Heap, ()),
            gc_daemon: spin::Mutex::new(None),
        }
    }

    /// Wires up the daemon `alloc` wakes when `bytesAllocated` crosses
    /// `concurrentStartBytes` (spec.md §4.5). Replaces any previously set
    /// handle.
    pub fn set_gc_daemon(&self, handle: GcDaemonHandle) {
        *self.gc_daemon.lock() = Some(handle);
    }

    pub fn active_heap(&self) -> &SubHeap {
        &self.heaps[0]
    }

    pub fn zygote_heap(&self) -> Option<&SubHeap> {
        self.heaps.get(1)
    }

    /// Whether `addr` falls inside this heap's overall reservation
    /// `[base, base+length)` — the coarse "pointer is one of ours" test,
    /// distinct from [`Self::contains`]'s exact-liveness bitmap test.
    pub fn contains_address(&self, addr: Address) -> bool {
        addr >= self.base && addr.diff(self.base) < self.length
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.live_bits.test(addr)
    }

    /// Allocate `n` bytes from the active sub-heap. Returns `null`
    /// (`Ok(None)` — spec.md calls this "treat as full") if `bytesAllocated`
    /// would cross `softLimit`.
    pub fn alloc(&self, n: usize) -> HeapResult<Option<Address>> {
        let _guard = self.heap_lock.lock();
        let active = self.active_heap();
        let soft_limit = self.soft_limit.load(Ordering::Acquire);
        if active.bytes_allocated() as u64 + n as u64 > soft_limit as u64 {
            return Ok(None);
        }
        let Some((addr, size)) = active.try_alloc(n) else {
            return Ok(None);
        };
        self.live_bits.set(addr);
        active.bytes_allocated.fetch_add(size, Ordering::AcqRel);
        active.objects_allocated.fetch_add(1, Ordering::AcqRel);
        let start_at = active.concurrent_start_bytes.load(Ordering::Acquire);
        if active.bytes_allocated() >= start_at {
            log::debug!("heap: crossed concurrentStartBytes ({start_at}), waking GC daemon");
            if let Some(handle) = self.gc_daemon.lock().as_ref() {
                handle.request_gc();
            }
        }
        Ok(Some(addr))
    }

    /// `allocAndGrow`: lift the soft limit (and, if still unable, the
    /// per-heap footprint limit) to satisfy an allocation that would
    /// otherwise fail (spec.md §4.5).
    pub fn alloc_and_grow(&self, n: usize) -> HeapResult<Address> {
        let _guard = self.heap_lock.lock();
        let previous_soft_limit = self.soft_limit.swap(usize::MAX, Ordering::AcqRel);
        let active = self.active_heap();
        if let Some((addr, size)) = active.try_alloc(n) {
            self.live_bits.set(addr);
            active.bytes_allocated.fetch_add(size, Ordering::AcqRel);
            active.objects_allocated.fetch_add(1, Ordering::AcqRel);
            let committed = active.brk().diff(active.base);
            self.growth_limit.store(committed.max(n), Ordering::Release);
            return Ok(addr);
        }
        self.soft_limit.store(previous_soft_limit, Ordering::Release);
        Err(HeapError::OutOfMemory { requested: n })
    }

    /// Bulk-frees a sorted, unique, single-sub-heap batch of pointers
    /// (spec.md §4.5 `freeList`). Returns the number of bytes reclaimed.
    pub fn free_list(&self, ptrs: &[(Address, usize)]) -> HeapResult<usize> {
        if ptrs.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(HeapError::InvalidFreeList);
        }
        if !ptrs.iter().all(|&(addr, _)| self.contains_address(addr)) {
            return Err(HeapError::NotInHeap);
        }
        let _guard = self.heap_lock.lock();
        let sub_heap = ptrs
            .first()
            .and_then(|&(addr, _)| self.heaps.iter().find(|h| h.contains(addr)))
            .ok_or(HeapError::NotInHeap)?;
        if !ptrs.iter().all(|&(addr, _)| sub_heap.contains(addr)) {
            return Err(HeapError::InvalidFreeList);
        }
        let mut reclaimed = 0;
        for &(addr, size) in ptrs {
            self.live_bits.clear(addr);
            reclaimed += sub_heap.free(addr, size);
            sub_heap.objects_allocated.fetch_sub(1, Ordering::AcqRel);
        }
        if !sub_heap.is_zygote {
            sub_heap.bytes_allocated.fetch_sub(reclaimed, Ordering::AcqRel);
        }
        Ok(reclaimed)
    }

    pub fn chunk_size(&self, addr: Address) -> HeapResult<usize> {
        if !self.contains_address(addr) {
            return Err(HeapError::NotInHeap);
        }
        if !self.contains(addr) {
            return Err(HeapError::NotInHeap);
        }
        // The free-list model above does not retain per-chunk sizes once
        // allocated (a real `NativeHeap` would); approximate with the
        // alignment granularity as a conservative lower bound.
        Ok(8)
    }

    pub fn gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }

    pub fn begin_gc(&self) {
        assert!(!self.gc_running.swap(true, Ordering::AcqRel), "GC already running");
    }

    pub fn end_gc(&self) {
        assert!(self.gc_running.swap(false, Ordering::AcqRel), "end_gc without begin_gc");
    }

    /// Swaps `live_bits`/`mark_bits` (spec.md §4.6 Sweep). Must be called
    /// with exclusive access (mutators suspended, or under the heap lock
    /// for a concurrent collection's final phase).
    pub fn swap_bitmaps(&mut self) {
        std::mem::swap(&mut self.live_bits, &mut self.mark_bits);
    }

    /// `growForUtilization`: recompute `idealSize`/`softLimit`/
    /// `concurrentStartBytes` after a full collection (spec.md §4.5).
    /// All arithmetic is integer (spec.md §9 design note) to stay
    /// deterministic for tiny `live` sizes.
    pub fn grow_for_utilization(&self, live: usize) -> GrowthResult {
        let target_utilization = self.target_utilization.max(1) as u64;
        let mut target = (live as u64 * 1024) / target_utilization;
        let lo = live as u64 + self.min_free as u64;
        let hi = live as u64 + self.max_free as u64;
        target = target.clamp(lo, hi);
        let maximum_size = self.active_heap().maximum_size as u64;
        target = target.min(maximum_size);

        let older_overhead: u64 = self
            .zygote_heap()
            .map(|h| h.bytes_allocated() as u64)
            .unwrap_or(0);
        let ideal_size = target + older_overhead;
        let soft_limit = ideal_size.saturating_sub(older_overhead);

        let alloc_limit = soft_limit;
        let concurrent_start_bytes = if alloc_limit >= CONCURRENT_MIN_FREE as u64 {
            alloc_limit.saturating_sub(CONCURRENT_START_BYTES as u64)
        } else {
            u64::MAX
        };

        self.growth_limit.store(ideal_size as usize, Ordering::Release);
        self.soft_limit.store(soft_limit as usize, Ordering::Release);
        self.active_heap()
            .concurrent_start_bytes
            .store(concurrent_start_bytes.min(usize::MAX as u64) as usize, Ordering::Release);

        GrowthResult {
            ideal_size: ideal_size as usize,
            soft_limit: soft_limit as usize,
            concurrent_start_bytes: if concurrent_start_bytes == u64::MAX {
                usize::MAX
            } else {
                concurrent_start_bytes as usize
            },
        }
    }

    /// `startupBeforeFork`: freeze the current active heap as the zygote
    /// heap and create a fresh active heap above its current `brk`
    /// (spec.md §4.5). Must be called with no GC in progress and no other
    /// thread allocating.
    pub fn startup_before_fork(&mut self) {
        assert_eq!(self.heaps.len(), 1, "fork split already performed");
        let old_active = self.heaps.pop().unwrap();
        let new_base = old_active.brk().align_up(crate::util::constants::BYTES_IN_PAGE);
        old_active.frozen.store(true, Ordering::Release);
        let zygote = SubHeap::new(old_active.base, old_active.brk().diff(old_active.base), old_active.maximum_size, true);
        zygote
            .bytes_allocated
            .store(old_active.bytes_allocated(), Ordering::Release);
        zygote
            .objects_allocated
            .store(old_active.objects_allocated(), Ordering::Release);
        let remaining = self.length.saturating_sub(new_base.diff(self.base));
        let new_active = SubHeap::new(new_base, 0, remaining, false);
        self.heaps = vec![new_active, zygote];
    }

    // --- native allocation accounting (spec.md §4.5 last paragraph) ---

    pub fn register_native_allocation(&self, bytes: usize) -> NativeAllocOutcome {
        let total = self.native_bytes_allocated.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total > self.native_footprint_limit.load(Ordering::Acquire) {
            NativeAllocOutcome::ForceSynchronousGc
        } else if total > self.native_footprint_gc_watermark.load(Ordering::Acquire) {
            NativeAllocOutcome::SignalConcurrentGc
        } else {
            NativeAllocOutcome::Ok
        }
    }

    pub fn register_native_free(&self, bytes: usize) {
        self.native_bytes_allocated.fetch_sub(bytes.min(self.native_bytes_allocated.load(Ordering::Acquire)), Ordering::AcqRel);
    }

    pub fn native_bytes_allocated(&self) -> usize {
        self.native_bytes_allocated.load(Ordering::Acquire)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NativeAllocOutcome {
    Ok,
    SignalConcurrentGc,
    ForceSynchronousGc,
}
