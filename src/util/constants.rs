//! Crate-wide sizing constants.

/// Minimum alignment of any managed allocation. The heap bitmap is indexed
/// at this granularity (spec.md §3: `ALIGN = 8`).
pub const ALIGN: usize = 8;
pub const LOG_ALIGN: usize = 3;
static_assertions::const_assert_eq!(1 << LOG_ALIGN, ALIGN);

pub const BITS_IN_BYTE: usize = 8;
pub const BYTES_IN_WORD: usize = std::mem::size_of::<usize>();
pub const BITS_IN_WORD: usize = BYTES_IN_WORD * BITS_IN_BYTE;

pub const BYTES_IN_PAGE: usize = 4096;

/// Default card size. The source tries 128 or 512; 512 keeps the card
/// table's working set small.
pub const CARD_SIZE: usize = 512;
pub const LOG_CARD_SIZE: usize = 9;
static_assertions::const_assert_eq!(1 << LOG_CARD_SIZE, CARD_SIZE);

/// Fixed block size used by the mostly-copying engine's block space table
/// (spec.md §4.7).
pub const BLOCK_SIZE: usize = 512;
pub const LOG_BLOCK_SIZE: usize = 9;
static_assertions::const_assert_eq!(1 << LOG_BLOCK_SIZE, BLOCK_SIZE);

/// `targetUtilization` is expressed as a ratio times this scale (spec.md
/// §3: `∈ [1, 1024]`).
pub const UTILIZATION_SCALE: u32 = 1024;

/// `allocLimit − CONCURRENT_START` bound used to recompute
/// `concurrentStartBytes` after growth (spec.md §4.5).
pub const CONCURRENT_START_BYTES: usize = 128 * 1024;
/// Minimum amount of headroom required for concurrent GC to remain enabled
/// (spec.md §4.5: "disables concurrent GC in tight conditions").
pub const CONCURRENT_MIN_FREE: usize = 256 * 1024;

/// Relative wait used by the GC daemon's idle loop (spec.md §5).
pub const HEAP_TRIM_IDLE_TIME_MS: u64 = 5_000;

/// Minimum number of stripe mutexes backing the quasi-atomic 64-bit
/// fallback path (spec.md §4.1: "≥ 32").
pub const QUASI_ATOMIC_STRIPE_COUNT: usize = 32;
