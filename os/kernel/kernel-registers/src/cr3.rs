#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: Page Directory Base Register (non-PAE paging).
///
/// Holds the physical base address of the active page directory and the
/// cache-control flags used when the CPU walks it.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 (PWT): Page-level Write-Through for the directory.
    pub pwt: bool,

    /// Bit 4 (PCD): Page-level Cache Disable for the directory.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31: Page directory physical base >> 12.
    ///
    /// `directory_phys = directory_base_4k << 12`.
    #[bits(20)]
    directory_base_4k: u32,
}

impl Cr3 {
    /// Create a `Cr3` value from a page directory physical base and flags.
    ///
    /// `directory_phys` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_directory_phys(directory_phys: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert_eq!(
            directory_phys.as_u32() & 0xFFF,
            0,
            "page directory base must be 4K-aligned"
        );
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_directory_base_4k(directory_phys.as_u32() >> 12)
    }

    /// Full physical address of the page directory.
    #[must_use]
    pub fn directory_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory_base_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_base_round_trip() {
        let cr3 = Cr3::from_directory_phys(PhysicalAddress::new(0x0012_3000), false, true);
        assert_eq!(cr3.directory_phys(), PhysicalAddress::new(0x0012_3000));
        assert_eq!(cr3.into_bits(), 0x0012_3010);
    }
}
