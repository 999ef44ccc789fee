use crate::{MemoryAddressOffset, MemoryPage, PageSize, VirtualAddress};
use core::fmt;

/// Virtual memory page base for size `S`.
///
/// A `VirtualPage<S>` represents the **page-aligned base** of a virtual page of
/// size `S` (`S::SIZE` bytes). It is a thin wrapper over [`MemoryPage<S>`] with
/// virtual-address intent.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xE000_0042);
/// let vp = va.page::<Size4K>();
/// assert_eq!(vp.base().as_u32(), 0xE000_0000);
/// assert_eq!(va.page::<Size4M>().index(), 0x380);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(MemoryPage::<S>::containing(addr.as_u32()))
    }

    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(MemoryPage::from_index(index))
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0.index()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, count: u32) -> Option<Self> {
        match self.0.checked_add_pages(count) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S> fmt::Display for VirtualPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPage<{}>({:#010X})",
            core::any::type_name::<S>(),
            self.0.base().as_u32()
        )
    }
}

impl<S: PageSize> TryFrom<VirtualAddress> for VirtualPage<S> {
    type Error = VirtualAddress;

    /// Accepts only page-aligned addresses; hands the address back otherwise.
    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, VirtualAddress> {
        if va.is_aligned::<S>() {
            Ok(va.page())
        } else {
            Err(va)
        }
    }
}

impl<S> From<MemoryPage<S>> for VirtualPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
