//! # i386 Page Directory
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a directory entry pointing to a page table. The kernel never
//!   sets `PS`, so every present entry is a table reference.
//! - [`PageDirectory`]: the 4 KiB-aligned array of 1024 entries read by the MMU.
//! - [`TableRefs`]: a parallel array holding the *virtual* address of each
//!   page table, so software can reach a table without a physical mapping.
//!
//! ## Invariants
//!
//! - `entries[i].present() == (tables[i] != 0)` for every directory that goes
//!   through [`Paging`](crate::Paging).
//! - Both arrays occupy exactly one page.

use crate::page_table::ENTRIES;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

impl DirectoryIndex {
    /// Extract bits `[31:22]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> 22) as u16)
    }

    /// Construct from a raw index.
    ///
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

    /// First virtual address covered by this directory slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

/// Page directory entry (PDE), non-PAE, `PS=0`.
#[doc(alias = "PDE")]
#[bitfield(u32)]
pub struct PdEntry {
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
    /// Accessed (bit 5).
    pub accessed: bool,
    /// Reserved (bit 6).
    #[bits(1)]
    __reserved: u8,
    /// Page Size (bit 7): always 0, the entry references a page table.
    pub page_size: bool,
    /// Ignored (bit 8).
    #[bits(1)]
    __ignored: u8,
    /// OS-available (bits 9..11).
    #[bits(3)]
    pub os_available: u8,
    /// Page table frame number (bits 12..31).
    #[bits(20)]
    table_frame: u32,
}

impl PdEntry {
    /// Present, writable entry pointing at the page table in `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_table_frame(frame.index())
    }

    /// Physical frame of the referenced page table.
    #[inline]
    #[must_use]
    pub const fn table_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.table_frame())
    }
}

/// The hardware page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PageDirectory {
    /// A directory with no present entries.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::new(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}

/// Virtual addresses of the page tables referenced by a [`PageDirectory`].
///
/// Slot `i` is 0 when directory entry `i` is not present.
#[repr(C, align(4096))]
pub struct TableRefs {
    tables: [u32; ENTRIES],
}

impl TableRefs {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            tables: [0; ENTRIES],
        }
    }

    /// Virtual page of the table in slot `i`, if any.
    #[inline]
    #[must_use]
    pub fn get(&self, i: DirectoryIndex) -> Option<VirtualPage<Size4K>> {
        match self.tables[i.as_usize()] {
            0 => None,
            va => Some(VirtualPage::containing_address(VirtualAddress::new(va))),
        }
    }

    #[inline]
    pub fn set(&mut self, i: DirectoryIndex, table: Option<VirtualPage<Size4K>>) {
        self.tables[i.as_usize()] = table.map_or(0, |t| t.base().as_u32());
    }
}

const _: () = {
    assert!(size_of::<PdEntry>() == 4);
    assert!(size_of::<PageDirectory>() == 4096);
    assert!(size_of::<TableRefs>() == 4096);
};
