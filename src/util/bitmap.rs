//! Heap Bitmap: one bit per `ALIGN`-aligned slot of a contiguous address
//! range (spec.md §4.3).
//!
//! Words are packed big-bit-first (the most significant bit covers the
//! lowest address in the word) so that `leading_zeros` gives the next set
//! bit in increasing address order, matching the source's `CLZ`-based
//! `walk`.

use crate::util::address::Address;
use crate::util::constants::{ALIGN, BITS_IN_WORD, LOG_ALIGN};
use spin::Mutex as SpinMutex;

#[inline(always)]
fn word_and_bit(base: Address, addr: Address) -> (usize, u32) {
    let index = addr.diff(base) >> LOG_ALIGN;
    (index / BITS_IN_WORD, (index % BITS_IN_WORD) as u32)
}

#[inline(always)]
fn mask_for(bit: u32) -> usize {
    // Bit 0 (MSB) covers the lowest address in the word.
    1usize << (BITS_IN_WORD as u32 - 1 - bit)
}

/// A bitmap covering `[base, base + max_size)` at [`ALIGN`]-byte
/// granularity.
pub struct Bitmap {
    base: Address,
    max_size: usize,
    words: Vec<usize>,
    /// Highest address ever `set`; `None` when empty (spec.md: "below base
    /// when empty").
    max: SpinMutex<Option<Address>>,
}

impl Bitmap {
    pub fn new(base: Address, max_size: usize) -> Bitmap {
        let num_slots = max_size.div_ceil(ALIGN);
        let num_words = num_slots.div_ceil(BITS_IN_WORD).max(1);
        Bitmap {
            base,
            max_size,
            words: vec![0usize; num_words],
            max: SpinMutex::new(None),
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Highest address ever `set` since the last `zero()`. `None` if the
    /// bitmap has never had a bit set.
    pub fn max(&self) -> Option<Address> {
        *self.max.lock()
    }

    fn bound_check(&self, addr: Address) {
        debug_assert!(
            addr >= self.base && addr.diff(self.base) < self.max_size,
            "address {addr:?} out of bitmap range [{:?}, {:?})",
            self.base,
            self.base.plus(self.max_size)
        );
        debug_assert!(addr.is_aligned_to(ALIGN), "address {addr:?} not {ALIGN}-byte aligned");
    }

    #[inline]
    fn word_ptr(&self, word_index: usize) -> &std::sync::atomic::AtomicUsize {
        unsafe { &*(self.words.as_ptr().add(word_index) as *const std::sync::atomic::AtomicUsize) }
    }

    pub fn set(&self, addr: Address) {
        self.bound_check(addr);
        let (word, bit) = word_and_bit(self.base, addr);
        self.word_ptr(word).fetch_or(mask_for(bit), std::sync::atomic::Ordering::AcqRel);
        let mut max = self.max.lock();
        if max.map_or(true, |m| addr > m) {
            *max = Some(addr);
        }
    }

    /// Sets the bit and returns whether it was already set — used by the
    /// marker to decide whether a newly-gray object needs to be pushed on
    /// the mark stack (spec.md §4.3).
    pub fn set_and_return_old(&self, addr: Address) -> bool {
        self.bound_check(addr);
        let (word, bit) = word_and_bit(self.base, addr);
        let mask = mask_for(bit);
        let old = self.word_ptr(word).fetch_or(mask, std::sync::atomic::Ordering::AcqRel);
        let mut max = self.max.lock();
        if max.map_or(true, |m| addr > m) {
            *max = Some(addr);
        }
        old & mask != 0
    }

    pub fn clear(&self, addr: Address) {
        self.bound_check(addr);
        let (word, bit) = word_and_bit(self.base, addr);
        self.word_ptr(word).fetch_and(!mask_for(bit), std::sync::atomic::Ordering::AcqRel);
    }

    pub fn test(&self, addr: Address) -> bool {
        self.bound_check(addr);
        let (word, bit) = word_and_bit(self.base, addr);
        self.word_ptr(word).load(std::sync::atomic::Ordering::Acquire) & mask_for(bit) != 0
    }

    /// Resets the bitmap to empty. In a real VM this would `madvise`
    /// the backing pages away; here the pages are ordinary heap memory, so
    /// we just zero the words.
    pub fn zero(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
        *self.max.lock() = None;
    }

    /// Invokes `cb(obj)` for every set bit in strictly increasing address
    /// order, up to and including `max()`. `cb` must not modify this
    /// bitmap.
    pub fn walk(&self, mut cb: impl FnMut(Address)) {
        let Some(max) = self.max() else { return };
        let max_word = word_and_bit(self.base, max).0;
        for (i, &word) in self.words.iter().enumerate().take(max_word + 1) {
            let mut remaining = word;
            while remaining != 0 {
                let bit = remaining.leading_zeros();
                let addr = self.base.plus((i * BITS_IN_WORD + bit as usize) * ALIGN);
                cb(addr);
                remaining &= !mask_for(bit);
            }
        }
    }

    /// Like [`Self::walk`], but `cb` additionally receives `finger = base +
    /// ALIGN*(i+1)` where `i` is the just-visited bit's global index. `cb`
    /// may set additional bits (addresses `>= finger` will still be
    /// visited by this traversal; addresses `< finger` will not) and may
    /// extend `max()`. Used for recursive marking (spec.md §4.3/§4.6).
    pub fn scan_walk(&self, mut cb: impl FnMut(Address, Address)) {
        let mut word_index = 0;
        loop {
            let Some(max) = self.max() else { break };
            let max_word = word_and_bit(self.base, max).0;
            if word_index > max_word {
                break;
            }
            // Re-read the word each iteration: `cb` may have set further
            // bits in it.
            let word = self.word_ptr(word_index).load(std::sync::atomic::Ordering::Acquire);
            let mut remaining = word;
            let mut visited_mask = 0usize;
            while remaining & !visited_mask != 0 {
                let live = remaining & !visited_mask;
                let bit = live.leading_zeros();
                let global_index = word_index * BITS_IN_WORD + bit as usize;
                let addr = self.base.plus(global_index * ALIGN);
                let finger = self.base.plus((global_index + 1) * ALIGN);
                cb(addr, finger);
                visited_mask |= mask_for(bit);
                remaining = self.word_ptr(word_index).load(std::sync::atomic::Ordering::Acquire);
            }
            word_index += 1;
        }
    }

    /// Computes `live AND NOT mark` over `[lo, hi)` and invokes `cb` once
    /// per word's worth of set addresses (spec.md §4.3/§8 scenario 6): a
    /// batch never spans more addresses than fit in one bitmap word, so a
    /// caller can size a fixed buffer to `BITS_IN_WORD` pointers.
    pub fn sweep_walk(live: &Bitmap, mark: &Bitmap, lo: Address, hi: Address, mut cb: impl FnMut(&[Address])) {
        assert_eq!(live.base, mark.base, "live/mark bitmaps must share a base");
        assert!(lo <= hi);
        let (lo_word, _) = word_and_bit(live.base, lo);
        let hi_word = if hi <= live.base {
            0
        } else {
            word_and_bit(live.base, hi.plus(ALIGN - 1).align_down(ALIGN)).0
        };
        let mut buf = Vec::with_capacity(BITS_IN_WORD);
        for i in lo_word..=hi_word.min(live.words.len().saturating_sub(1)) {
            if i >= live.words.len() || i >= mark.words.len() {
                break;
            }
            let live_word = live.words[i];
            let mark_word = mark.words[i];
            let garbage = live_word & !mark_word;
            if garbage == 0 {
                continue;
            }
            buf.clear();
            let mut remaining = garbage;
            while remaining != 0 {
                let bit = remaining.leading_zeros();
                let addr = live.base.plus((i * BITS_IN_WORD + bit as usize) * ALIGN);
                if addr >= lo && addr < hi {
                    buf.push(addr);
                }
                remaining &= !mask_for(bit);
            }
            if !buf.is_empty() {
                cb(&buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: usize) -> Address {
        unsafe { Address::from_usize(v) }
    }

    #[test]
    fn set_test_clear() {
        let bm = Bitmap::new(addr(0x1000), 0x10000);
        assert!(!bm.test(addr(0x1008)));
        bm.set(addr(0x1008));
        assert!(bm.test(addr(0x1008)));
        bm.clear(addr(0x1008));
        assert!(!bm.test(addr(0x1008)));
    }

    #[test]
    fn set_and_return_old() {
        let bm = Bitmap::new(addr(0x1000), 0x10000);
        assert!(!bm.set_and_return_old(addr(0x1000)));
        assert!(bm.set_and_return_old(addr(0x1000)));
    }

    #[test]
    fn max_tracks_highest_set_address() {
        let bm = Bitmap::new(addr(0x1000), 0x10000);
        assert_eq!(bm.max(), None);
        bm.set(addr(0x1008));
        bm.set(addr(0x1000));
        assert_eq!(bm.max(), Some(addr(0x1008)));
    }

    #[test]
    fn walk_visits_in_increasing_order() {
        let bm = Bitmap::new(addr(0x1000), 0x10000);
        bm.set(addr(0x1400));
        bm.set(addr(0x1000));
        bm.set(addr(0x1008));
        let mut seen = vec![];
        bm.walk(|a| seen.push(a));
        assert_eq!(seen, vec![addr(0x1000), addr(0x1008), addr(0x1400)]);
    }

    #[test]
    fn scan_walk_can_extend_while_iterating() {
        let bm = Bitmap::new(addr(0x1000), 0x10000);
        bm.set(addr(0x1000));
        let mut seen = vec![];
        bm.scan_walk(|a, finger| {
            seen.push(a);
            if a == addr(0x1000) {
                bm.set(addr(0x1008)); // >= finger: will be visited
                bm.set(finger.plus(1000).align_down(8)); // also >= finger
            }
        });
        assert!(seen.contains(&addr(0x1000)));
        assert!(seen.contains(&addr(0x1008)));
    }

    #[test]
    fn zero_clears_bits_and_max() {
        let mut bm = Bitmap::new(addr(0x1000), 0x10000);
        bm.set(addr(0x1008));
        bm.zero();
        assert!(!bm.test(addr(0x1008)));
        assert_eq!(bm.max(), None);
    }

    #[test]
    fn sweep_walk_matches_scenario_6() {
        // live = {0x1000, 0x1008, 0x2000}, mark = {0x1000, 0x2000}
        // over [0x1000, 0x2008) -> emits {0x1008} in one batch.
        let live = Bitmap::new(addr(0x1000), 0x10000);
        let mark = Bitmap::new(addr(0x1000), 0x10000);
        for a in [0x1000, 0x1008, 0x2000] {
            live.set(addr(a));
        }
        for a in [0x1000, 0x2000] {
            mark.set(addr(a));
        }
        let mut batches = vec![];
        Bitmap::sweep_walk(&live, &mark, addr(0x1000), addr(0x2008), |batch| {
            batches.push(batch.to_vec());
        });
        assert_eq!(batches, vec![vec![addr(0x1008)]]);
    }
}
