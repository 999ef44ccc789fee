//! # Memory Layout
//!
//! Fixed virtual and physical layout of the i386 kernel.
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ (null page, never mapped)    │
//! 0x0000_1000 ├──────────────────────────────┤ USER_SPACE_BASE
//!             │         User Space           │
//! 0xC000_0000 ├──────────────────────────────┤ KERNEL_SPACE_BASE
//!             │ Lower memory window (1 MiB)  │ → physical 0x0000_0000
//! 0xC010_0000 ├──────────────────────────────┤ KERNEL_BASE
//!             │ Kernel image, placement buf  │ → physical 0x0010_0000
//!             ├──────────────────────────────┤
//!             │            ...               │
//! 0xE000_0000 ├──────────────────────────────┤ KERNEL_HEAP_BASE
//!             │ Kernel heap (64 MiB)         │
//! 0xE400_0000 ├──────────────────────────────┤
//!             │            ...               │
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Size of a page and of a frame.
pub const PAGE_SIZE: u32 = 4096;

/// First user-space virtual address; page 0 stays unmapped to catch null dereferences.
pub const USER_SPACE_BASE: u32 = 0x0000_1000;

/// Size of the user-space zone.
pub const USER_SPACE_SIZE: u32 = 0xBFFF_F000;

/// Start of the higher half shared by every address space.
pub const KERNEL_SPACE_BASE: u32 = 0xC000_0000;

/// Size of the kernel-space zone.
pub const KERNEL_SPACE_SIZE: u32 = 0x3FFF_FFFF;

/// Where the first physical MiB (BIOS data, VGA, ROMs) appears in kernel space.
pub const LOWER_MEMORY_VIRTUAL_BASE: u32 = KERNEL_SPACE_BASE;

/// Size of the lower-memory window.
pub const LOWER_MEMORY_SIZE: u32 = 0x0010_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u32 = 0xC010_0000;

/// Where the boot loader places the kernel image in *physical* memory (LMA).
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Base of the kernel heap region.
pub const KERNEL_HEAP_BASE: u32 = 0xE000_0000;

/// Size of the kernel heap region; the heap never grows past it.
pub const KERNEL_HEAP_SIZE: u32 = 0x0400_0000;

/// Capacity of the boot-time placement buffer.
pub const PLACEMENT_MEMORY_SIZE: u32 = 0x0010_0000;

/// Legacy VGA frame buffer window.
pub const VGA_MEMORY_BASE: u32 = 0x000A_0000;

/// Size of the legacy VGA window (`0xA0000..0xC0000`).
pub const VGA_MEMORY_SIZE: u32 = 0x0002_0000;

/// Video BIOS ROM.
pub const VIDEO_BIOS_BASE: u32 = 0x000C_0000;

/// Size of the video BIOS ROM.
pub const VIDEO_BIOS_SIZE: u32 = 0x8000;

/// A fixed virtual zone, `[base, base + size)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VirtualZone {
    pub base: u32,
    pub size: u32,
}

/// Zone for user mappings.
pub const USER_ZONE: VirtualZone = VirtualZone::new(USER_SPACE_BASE, USER_SPACE_SIZE);

/// Zone for kernel mappings.
pub const KERNEL_ZONE: VirtualZone = VirtualZone::new(KERNEL_SPACE_BASE, KERNEL_SPACE_SIZE);

impl VirtualZone {
    #[must_use]
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// Exclusive end; may be `2^32`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base as u64 && va.as_u64() < self.end()
    }

    /// Whether `[start, start + len)` lies entirely inside the zone.
    #[must_use]
    pub const fn contains_range(&self, start: VirtualAddress, len: u64) -> bool {
        let start = start.as_u64();
        start >= self.base as u64 && start + len <= self.end()
    }
}

/// Translation used before paging is enabled: higher-half addresses sit at a
/// fixed offset from physical memory, everything below is identity.
#[must_use]
pub const fn bootstrap_virtual_to_physical(va: VirtualAddress) -> PhysicalAddress {
    let va = va.as_u32();
    if va >= KERNEL_SPACE_BASE {
        PhysicalAddress::new(va - KERNEL_SPACE_BASE)
    } else {
        PhysicalAddress::new(va)
    }
}

/// Inverse of [`bootstrap_virtual_to_physical`] for memory in the first GiB.
#[must_use]
pub const fn bootstrap_physical_to_virtual(pa: PhysicalAddress) -> Option<VirtualAddress> {
    match pa.as_u32().checked_add(KERNEL_SPACE_BASE) {
        Some(va) => Some(VirtualAddress::new(va)),
        None => None,
    }
}

const _: () = {
    assert!(USER_SPACE_BASE % PAGE_SIZE == 0);
    assert!(USER_SPACE_BASE as u64 + USER_SPACE_SIZE as u64 == KERNEL_SPACE_BASE as u64);
    assert!(KERNEL_BASE - KERNEL_SPACE_BASE == PHYS_LOAD);
    assert!(LOWER_MEMORY_VIRTUAL_BASE + LOWER_MEMORY_SIZE == KERNEL_BASE);
    assert!(KERNEL_HEAP_BASE % (4 * 1024 * 1024) == 0);
    assert!(KERNEL_HEAP_SIZE % PAGE_SIZE == 0);
    assert!(KERNEL_HEAP_BASE > KERNEL_BASE);
    assert!(VGA_MEMORY_BASE + VGA_MEMORY_SIZE == VIDEO_BIOS_BASE);
    assert!(VIDEO_BIOS_BASE + VIDEO_BIOS_SIZE <= LOWER_MEMORY_SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_do_not_overlap() {
        assert!(USER_ZONE.end() <= u64::from(KERNEL_ZONE.base));
        assert!(!USER_ZONE.contains(VirtualAddress::new(0)));
        assert!(USER_ZONE.contains(VirtualAddress::new(USER_SPACE_BASE)));
        assert!(KERNEL_ZONE.contains(VirtualAddress::new(KERNEL_HEAP_BASE)));
        assert!(!KERNEL_ZONE.contains(VirtualAddress::new(0xBFFF_FFFF)));
    }

    #[test]
    fn range_checks_use_wide_arithmetic() {
        let last_page = VirtualAddress::new(0xFFFF_E000);
        assert!(KERNEL_ZONE.contains_range(last_page, 0x1000));
        assert!(!KERNEL_ZONE.contains_range(last_page, 0x2000));
        assert!(!USER_ZONE.contains_range(VirtualAddress::new(0xBFFF_F000), 0x2000));
    }

    #[test]
    fn bootstrap_translation() {
        assert_eq!(
            bootstrap_virtual_to_physical(VirtualAddress::new(KERNEL_BASE)),
            PhysicalAddress::new(PHYS_LOAD)
        );
        assert_eq!(
            bootstrap_virtual_to_physical(VirtualAddress::new(0x0000_8000)),
            PhysicalAddress::new(0x0000_8000)
        );
        assert_eq!(
            bootstrap_physical_to_virtual(PhysicalAddress::new(PHYS_LOAD)),
            Some(VirtualAddress::new(KERNEL_BASE))
        );
        assert_eq!(
            bootstrap_physical_to_virtual(PhysicalAddress::new(0x4000_0000)),
            None
        );
    }
}
