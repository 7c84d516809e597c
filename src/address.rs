use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Identifies one address space of the inferior. Separate processes, and
/// separate emulated domains inside one process, get distinct ids.
///
/// Two [`TargetAddress`] values can only be compared when they carry the
/// same `AddressSpace`; ordering across spaces is meaningless.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpace(pub u32);

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressSpace({})", self.0)
    }
}

/// An address in the inferior, tagged with the address space it belongs to.
///
/// There is deliberately no "null address" value; absence is expressed with
/// `Option<TargetAddress>`, which keeps a genuine address zero representable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    space: AddressSpace,
    value: u64,
}

impl TargetAddress {
    #[inline]
    pub const fn new(space: AddressSpace, value: u64) -> Self {
        Self { space, value }
    }

    #[inline]
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Byte distance `self - origin`. Returns `None` when the two addresses
    /// live in different spaces or the distance does not fit an `i64`.
    pub fn checked_offset_from(&self, origin: TargetAddress) -> Option<i64> {
        if self.space != origin.space {
            return None;
        }
        let (diff, overflow) = self.value.overflowing_sub(origin.value);
        let diff = diff as i64;
        // A negative result must come from an actual wrap-around and
        // vice versa, otherwise the distance exceeds 63 bits.
        if (diff < 0) != overflow {
            return None;
        }
        Some(diff)
    }

    /// Displaces this address by a signed byte count, staying in the same
    /// address space. Returns `None` on address arithmetic overflow.
    pub fn checked_add_signed(&self, offset: i64) -> Option<Self> {
        self.value
            .checked_add_signed(offset)
            .map(|value| Self::new(self.space, value))
    }

    pub fn wrapping_add_signed(&self, offset: i64) -> Self {
        Self::new(self.space, self.value.wrapping_add_signed(offset))
    }

    /// Aligns the address downwards to a multiple of `align` (a power of two).
    pub fn align_down(&self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two());
        Self::new(self.space, self.value & !(align - 1))
    }
}

impl PartialOrd for TargetAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.space != other.space {
            return None;
        }
        self.value.partial_cmp(&other.value)
    }
}

impl Add<u64> for TargetAddress {
    type Output = TargetAddress;

    fn add(self, rhs: u64) -> TargetAddress {
        TargetAddress::new(self.space, self.value.wrapping_add(rhs))
    }
}

impl Sub<u64> for TargetAddress {
    type Output = TargetAddress;

    fn sub(self, rhs: u64) -> TargetAddress {
        TargetAddress::new(self.space, self.value.wrapping_sub(rhs))
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.value)
    }
}

impl fmt::Debug for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetAddress({}:{:#x})", self.space.0, self.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const S0: AddressSpace = AddressSpace(0);
    const S1: AddressSpace = AddressSpace(1);

    #[test]
    fn ordering_within_one_space() {
        let low = TargetAddress::new(S0, 0x1000);
        let high = TargetAddress::new(S0, 0x2000);
        assert!(low < high);
        assert!(high > low);
        assert_eq!(low.partial_cmp(&low), Some(Ordering::Equal));
    }

    #[test]
    fn ordering_across_spaces_is_undefined() {
        let a = TargetAddress::new(S0, 0x1000);
        let b = TargetAddress::new(S1, 0x2000);
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!(a < b));
        assert!(!(a > b));
        assert_ne!(a, b);
    }

    #[test]
    fn offset_from() {
        let a = TargetAddress::new(S0, 0x1000);
        let b = TargetAddress::new(S0, 0x1040);
        assert_eq!(b.checked_offset_from(a), Some(0x40));
        assert_eq!(a.checked_offset_from(b), Some(-0x40));
        assert_eq!(a.checked_offset_from(TargetAddress::new(S1, 0)), None);
    }

    #[test]
    fn signed_displacement() {
        let a = TargetAddress::new(S0, 0x1000);
        assert_eq!(a.checked_add_signed(-0x10), Some(TargetAddress::new(S0, 0xff0)));
        assert_eq!(a.checked_add_signed(8), Some(a + 8));
        assert_eq!(TargetAddress::new(S0, 2).checked_add_signed(-4), None);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(TargetAddress::new(S0, 0xdeadbeef).to_string(), "0xdeadbeef");
    }
}
