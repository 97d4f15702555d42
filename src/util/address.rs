//! A raw address into the managed heap reservation.
//!
//! Modeled after the teacher's `Address` newtype: a `usize` wrapper with
//! const-fn arithmetic so it can be used in `const` contexts (bitmap base
//! addresses, card-table biases) while still reading as a pointer type
//! rather than a bare integer everywhere in the crate.

use std::fmt;
use std::ops::{Add, Sub};

/// An address in the managed heap's virtual address space.
///
/// `Address` is not necessarily aligned or in-bounds; callers that need
/// that guarantee should use [`Address::is_aligned_to`] or the owning
/// reservation's `contains` check.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Address = Address(0);

    /// # Safety
    /// The caller must ensure `addr` is meaningful as an address (this
    /// constructor performs no validation).
    pub const unsafe fn from_usize(addr: usize) -> Address {
        Address(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    pub const fn align_down(self, align: usize) -> Address {
        Address(self.0 & !(align - 1))
    }

    pub const fn align_up(self, align: usize) -> Address {
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// `self + offset`, as a `const fn` (the `Add` impl cannot be `const`).
    pub const fn plus(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    /// `self - other`, saturating at zero. Used for index computation into
    /// bitmaps and card tables where `self` is always expected to be `>=
    /// other` in valid use.
    pub const fn diff(self, other: Address) -> usize {
        self.0.saturating_sub(other.0)
    }
}

impl Add<usize> for Address {
    type Output = Address;
    fn add(self, rhs: usize) -> Address {
        Address(self.0 + rhs)
    }
}

impl Sub<usize> for Address {
    type Output = Address;
    fn sub(self, rhs: usize) -> Address {
        Address(self.0 - rhs)
    }
}

impl Sub<Address> for Address {
    type Output = usize;
    fn sub(self, rhs: Address) -> usize {
        self.0 - rhs.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// An opaque handle to a managed object: the address of its header.
///
/// Distinct from [`Address`] so that "an address" and "an object pointer"
/// cannot be confused at the type level, mirroring how the source
/// distinguishes `void*` heap addresses from `Object*`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ObjectReference(usize);

impl ObjectReference {
    pub const NULL: ObjectReference = ObjectReference(0);

    pub fn from_address(addr: Address) -> ObjectReference {
        ObjectReference(addr.as_usize())
    }

    pub fn to_address(self) -> Address {
        unsafe { Address::from_usize(self.0) }
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object@0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_down() {
        let a = unsafe { Address::from_usize(0x1003) };
        assert_eq!(a.align_down(8).as_usize(), 0x1000);
        assert_eq!(a.align_up(8).as_usize(), 0x1008);
        assert!(a.align_down(8).is_aligned_to(8));
    }

    #[test]
    fn diff_and_arith() {
        let base = unsafe { Address::from_usize(0x1000) };
        let p = base.plus(0x100);
        assert_eq!(p.diff(base), 0x100);
        assert_eq!(p - base, 0x100);
        assert_eq!(base + 0x100, p);
    }

    #[test]
    fn object_reference_roundtrip() {
        let addr = unsafe { Address::from_usize(0x4000) };
        let obj = ObjectReference::from_address(addr);
        assert!(!obj.is_null());
        assert_eq!(obj.to_address(), addr);
        assert!(ObjectReference::NULL.is_null());
    }
}
