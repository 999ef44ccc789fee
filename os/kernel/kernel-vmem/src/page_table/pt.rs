//! # i386 Page Table
//!
//! - [`TableIndex`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a page table entry mapping one 4 KiB page.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! After modifying active mappings, the caller must perform any required TLB
//! maintenance.

use crate::PageFlags;
use crate::page_table::ENTRIES;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Index into a Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Extract bits `[21:12]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Page table entry (PTE).
#[doc(alias = "PTE")]
#[bitfield(u32)]
pub struct PtEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User (bit 2).
    pub user: bool,
    /// Write-Through (bit 3).
    pub write_through: bool,
    /// Cache Disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (bit 6), set by the CPU on first write.
    pub dirty: bool,
    /// PAT selector (bit 7).
    pub pat: bool,
    /// Global (bit 8).
    pub global: bool,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// Page frame number (bits 12..31).
    #[bits(20)]
    page_frame: u32,
}

impl PtEntry {
    /// Present entry mapping `frame` with the given permissions.
    #[inline]
    #[must_use]
    pub const fn page(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable)
            .with_user(!flags.kernel)
            .with_write_through(flags.write_through)
            .with_cache_disable(flags.cache_disable)
            .with_page_frame(frame.index())
    }

    /// Mapped frame; meaningful only when present.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.page_frame())
    }
}

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::new(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Whether this table and `other` hold the same raw entries.
    #[must_use]
    pub fn same_entries(&self, other: &Self) -> bool {
        self.entries
            .iter()
            .zip(other.entries.iter())
            .all(|(a, b)| a.into_bits() == b.into_bits())
    }
}

const _: () = {
    assert!(size_of::<PtEntry>() == 4);
    assert!(size_of::<PageTable>() == 4096);
};

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pte_bit_positions() {
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x5555_0000));
        let e = PtEntry::page(frame, PageFlags::USER_RW);
        assert_eq!(e.into_bits(), 0x5555_0007);
        assert_eq!(e.frame(), frame);

        assert_eq!(PtEntry::new().with_dirty(true).into_bits(), 1 << 6);
        assert_eq!(PtEntry::new().with_pat(true).into_bits(), 1 << 7);
        assert_eq!(PtEntry::new().with_global(true).into_bits(), 1 << 8);
    }

    #[test]
    fn kernel_read_only_entry() {
        let frame = PhysicalPage::<Size4K>::from_index(0x123);
        let flags = PageFlags {
            writable: false,
            ..PageFlags::KERNEL_RW
        };
        let e = PtEntry::page(frame, flags);
        assert!(e.present());
        assert!(!e.writable());
        assert!(!e.user());
        assert_eq!(e.into_bits() >> 12, 0x123);
    }
}
