use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<Size4K>` is a **frame**: the unit the physical memory
/// manager hands out. It is a thin wrapper over [`MemoryPage<S>`] with
/// physical-address intent.
///
/// ### Semantics
/// - `base()` returns the page base as a [`PhysicalAddress`].
/// - `index()` / `from_index()` convert between the base and the frame number
///   (`address >> S::SHIFT`), the form used by bitmaps and page table entries.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalPage::<Size4K>::from_index(0x123);
/// assert_eq!(frame.base().as_u32(), 0x0012_3000);
/// assert_eq!(PhysicalAddress::new(0x0012_3456).page::<Size4K>(), frame);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self::from_page(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
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
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
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

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>({:#010X})",
            core::any::type_name::<S>(),
            self.0.base().as_u32()
        )
    }
}

impl<S> From<MemoryPage<S>> for PhysicalPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
