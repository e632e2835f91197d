//! Physical and Virtual Address Types
//!
//! `#[repr(transparent)]` wrappers around `u64` that keep physical and virtual
//! addresses apart at compile time. Arithmetic is checked: an address that
//! would wrap is reported as `None` rather than silently folded back into the
//! address space.

use core::fmt;

/// Physical memory address (as seen by the MMU and by bus masters).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// Virtual memory address (as used by CPU instructions).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

macro_rules! impl_addr {
    ($ty:ident, $debug:literal, $display:literal) => {
        impl $ty {
            /// Create a new address.
            #[inline]
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Get the raw address value.
            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Check if this address is null (zero).
            #[inline]
            #[must_use]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Check if this address is aligned to `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn is_aligned(self, align: u64) -> bool {
                self.0 & (align - 1) == 0
            }

            /// Align down to `align` (a power of two).
            #[inline]
            #[must_use]
            pub const fn align_down(self, align: u64) -> Self {
                Self(self.0 & !(align - 1))
            }

            /// Add `offset`, returning `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, offset: u64) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Distance from `base` to this address, `None` if below `base`.
            #[inline]
            #[must_use]
            pub const fn checked_offset_from(self, base: Self) -> Option<u64> {
                self.0.checked_sub(base.0)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $debug, self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $display, self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<u64> for $ty {
            #[inline]
            fn from(addr: u64) -> Self {
                Self(addr)
            }
        }

        impl From<$ty> for u64 {
            #[inline]
            fn from(addr: $ty) -> Self {
                addr.0
            }
        }
    };
}

impl_addr!(PhysAddr, "PhysAddr({:#018x})", "PA:{:#018x}");
impl_addr!(VirtAddr, "VirtAddr({:#018x})", "VA:{:#018x}");

impl VirtAddr {
    /// Convert to a raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mutable raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_overflow() {
        let pa = PhysAddr::new(u64::MAX - 1);
        assert_eq!(pa.checked_add(1), Some(PhysAddr::new(u64::MAX)));
        assert_eq!(pa.checked_add(2), None);
    }

    #[test]
    fn test_alignment() {
        let va = VirtAddr::new(0xFFFF_8000_0000_1234);
        assert!(!va.is_aligned(0x1000));
        assert_eq!(va.align_down(0x1000), VirtAddr::new(0xFFFF_8000_0000_1000));
    }

    #[test]
    fn test_offset_from() {
        let base = PhysAddr::new(0x4000_0000);
        assert_eq!(PhysAddr::new(0x4000_1000).checked_offset_from(base), Some(0x1000));
        assert_eq!(PhysAddr::new(0x3FFF_F000).checked_offset_from(base), None);
    }
}
