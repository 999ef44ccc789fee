use crate::{MemoryAddress, MemoryAddressOffset, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S> fmt::Display for MemoryPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        let value = addr.as_u32() & !(S::SIZE - 1);
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: u32) -> Self {
        Self::from_addr(MemoryAddress::new(addr))
    }

    /// Create from a raw value that must already be aligned.
    /// Panics in debug if unaligned (no runtime cost in release).
    #[inline]
    #[must_use]
    pub fn new_aligned(addr: MemoryAddress) -> Self {
        debug_assert_eq!(addr.as_u32() & (S::SIZE - 1), 0, "unaligned page address");
        Self::from_addr(addr)
    }

    /// The page with number `index`, i.e. base `index << S::SHIFT`.
    ///
    /// Indices past the 32-bit space wrap; callers stay below `2^(32 - S::SHIFT)`.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        debug_assert!((index as u64) < (1u64 << (32 - S::SHIFT)));
        Self {
            value: index << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    /// Page number of this page (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.value >> S::SHIFT
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress::new(self.value + off.as_u32())
    }

    /// The page `count` pages further on, or `None` past the end of the 32-bit space.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, count: u32) -> Option<Self> {
        let Some(delta) = count.checked_mul(S::SIZE) else {
            return None;
        };
        match self.value.checked_add(delta) {
            Some(value) => Some(Self {
                value,
                _phantom: PhantomData,
            }),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryPage<{}>(0x{:08X})",
            core::any::type_name::<S>(),
            self.value
        )
    }
}

impl<S: PageSize> From<MemoryAddress> for MemoryPage<S> {
    #[inline]
    fn from(addr: MemoryAddress) -> Self {
        Self::from_addr(addr)
    }
}
