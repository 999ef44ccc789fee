//! # Kernel Boot Information
//!
//! What the boot path hands to the memory core: the firmware memory map and
//! the placement of the kernel image.

use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Region type as reported by a Multiboot memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryRegionKind {
    /// Usable RAM.
    Available,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables; reclaimable once parsed, treated as unavailable here.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    BadMemory,
    /// Any type code this kernel does not know.
    Unknown(u32),
}

impl MemoryRegionKind {
    /// Decode a Multiboot `type` field.
    #[must_use]
    pub const fn from_multiboot(code: u32) -> Self {
        match code {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            other => Self::Unknown(other),
        }
    }

    /// Rank used when two reported regions overlap: the higher rank wins.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Available => 0,
            Self::AcpiReclaimable => 1,
            Self::AcpiNvs => 2,
            Self::Reserved | Self::Unknown(_) => 3,
            Self::BadMemory => 4,
        }
    }

    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

/// One entry of the boot memory map.
///
/// Base and length are 64-bit as in the Multiboot structure; anything beyond
/// the 32-bit physical range is clipped by the consumer.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Available)
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Reserved)
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion({:#010X}..{:#010X}, {:?})",
            self.base,
            self.end(),
            self.kind
        )
    }
}

/// Where the kernel image was loaded and where it runs.
///
/// The end addresses are exclusive; the linker symbols `kernel_physical_end`
/// and `kernel_virtual_end` map directly to them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub physical_start: PhysicalAddress,
    pub physical_end: PhysicalAddress,
    pub virtual_start: VirtualAddress,
    pub virtual_end: VirtualAddress,
}

impl KernelImage {
    /// Image of `size` bytes loaded at `physical_start` and linked at `virtual_start`.
    #[must_use]
    pub const fn new(
        physical_start: PhysicalAddress,
        virtual_start: VirtualAddress,
        size: u32,
    ) -> Self {
        Self {
            physical_start,
            physical_end: PhysicalAddress::new(physical_start.as_u32() + size),
            virtual_start,
            virtual_end: VirtualAddress::new(virtual_start.as_u32() + size),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.virtual_end.as_u32() - self.virtual_start.as_u32()
    }

    /// Distance between the link address and the load address.
    #[must_use]
    pub const fn virtual_offset(&self) -> u32 {
        self.virtual_start
            .as_u32()
            .wrapping_sub(self.physical_start.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiboot_codes() {
        assert_eq!(MemoryRegionKind::from_multiboot(1), MemoryRegionKind::Available);
        assert_eq!(MemoryRegionKind::from_multiboot(5), MemoryRegionKind::BadMemory);
        assert_eq!(MemoryRegionKind::from_multiboot(9), MemoryRegionKind::Unknown(9));
        assert!(
            MemoryRegionKind::Reserved.precedence() > MemoryRegionKind::Available.precedence()
        );
        assert_eq!(
            MemoryRegionKind::Unknown(7).precedence(),
            MemoryRegionKind::Reserved.precedence()
        );
    }

    #[test]
    fn region_end_saturates() {
        let r = MemoryRegion::available(u64::MAX - 1, 16);
        assert_eq!(r.end(), u64::MAX);
    }

    #[test]
    fn kernel_image_geometry() {
        let image = KernelImage::new(
            PhysicalAddress::new(0x0010_0000),
            VirtualAddress::new(0xC010_0000),
            0x0020_0000,
        );
        assert_eq!(image.size(), 0x0020_0000);
        assert_eq!(image.physical_end, PhysicalAddress::new(0x0030_0000));
        assert_eq!(image.virtual_offset(), 0xC000_0000);
    }
}
