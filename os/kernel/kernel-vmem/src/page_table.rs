//! # Memory Page Table
//!
//! i386 two-level paging without PAE: a 32-bit virtual address splits into
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! Each level holds 1024 four-byte entries in one 4 KiB page.

pub mod pd;
pub mod pt;

use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in a page directory or a page table.
pub const ENTRIES: usize = 1024;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xC040_1234);
        let (di, ti) = split_indices(va);
        assert_eq!(di.as_usize(), 0x301);
        assert_eq!(ti.as_usize(), 0x001);

        let (di, ti) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!(di.as_usize(), ENTRIES - 1);
        assert_eq!(ti.as_usize(), ENTRIES - 1);
    }
}
