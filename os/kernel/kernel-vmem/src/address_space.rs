//! # Address Space (i386, directory-rooted)
//!
//! An address space is a page directory plus its [`TableRefs`](crate::page_table::pd::TableRefs)
//! shadow, both addressed virtually. The directory's physical address is only
//! needed when it is loaded into CR3, see [`Paging::switch_page_directory`](crate::Paging::switch_page_directory).

use crate::page_table::pt::PtEntry;
use core::fmt;
use kernel_memory_addresses::{Size4K, VirtualPage};

/// Handle to one page directory and its table shadow.
///
/// The handle is a plain pair of page addresses; the memory it names is
/// owned by whoever allocated it and is never released.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct AddressSpace {
    directory: VirtualPage<Size4K>,
    tables: VirtualPage<Size4K>,
}

impl AddressSpace {
    #[inline]
    #[must_use]
    pub const fn new(directory: VirtualPage<Size4K>, tables: VirtualPage<Size4K>) -> Self {
        Self { directory, tables }
    }

    /// Page holding the hardware [`PageDirectory`](crate::page_table::pd::PageDirectory).
    #[inline]
    #[must_use]
    pub const fn directory(&self) -> VirtualPage<Size4K> {
        self.directory
    }

    /// Page holding the [`TableRefs`](crate::page_table::pd::TableRefs).
    #[inline]
    #[must_use]
    pub const fn tables(&self) -> VirtualPage<Size4K> {
        self.tables
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AddressSpace(dir={}, tables={})",
            self.directory.base(),
            self.tables.base()
        )
    }
}

/// Permissions of a mapping.
///
/// `kernel` selects supervisor-only pages in kernel space; otherwise the
/// page is user-accessible and must lie in user space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct PageFlags {
    pub kernel: bool,
    pub writable: bool,
    pub write_through: bool,
    pub cache_disable: bool,
}

impl PageFlags {
    /// Supervisor, read/write, write-back.
    pub const KERNEL_RW: Self = Self {
        kernel: true,
        writable: true,
        write_through: false,
        cache_disable: false,
    };

    /// User, read/write, write-back.
    pub const USER_RW: Self = Self {
        kernel: false,
        writable: true,
        write_through: false,
        cache_disable: false,
    };

    /// Permissions encoded in a present entry.
    #[inline]
    #[must_use]
    pub const fn from_entry(e: PtEntry) -> Self {
        Self {
            kernel: !e.user(),
            writable: e.writable(),
            write_through: e.write_through(),
            cache_disable: e.cache_disable(),
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::KERNEL_RW
    }
}
