#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4: Control Register 4 (32-bit).
///
/// The paging code only cares about `PSE`, which must stay clear so that
/// every directory entry refers to a page table.
#[bitfield(u32, order = Lsb)]
pub struct Cr4 {
    /// Bit 0 (VME): Virtual-8086 Mode Extensions.
    pub vme: bool,

    /// Bit 1 (PVI): Protected-Mode Virtual Interrupts.
    pub pvi: bool,

    /// Bit 2 (TSD): Time Stamp Disable.
    pub tsd: bool,

    /// Bit 3 (DE): Debugging Extensions.
    pub de: bool,

    /// Bit 4 (PSE): Page Size Extensions.
    ///
    /// When set, a directory entry with `PS=1` maps a 4 MiB page directly.
    pub pse: bool,

    /// Bit 5 (PAE): Physical Address Extension.
    pub pae: bool,

    /// Bit 6 (MCE): Machine-Check Enable.
    pub mce: bool,

    /// Bit 7 (PGE): Page Global Enable.
    pub pge: bool,

    /// Bit 8 (PCE): Performance-Monitoring Counter Enable.
    pub pce: bool,

    /// Bit 9 (OSFXSR): OS supports FXSAVE/FXRSTOR.
    pub osfxsr: bool,

    /// Bit 10 (OSXMMEXCPT): OS supports unmasked SIMD exceptions.
    pub osxmmexcpt: bool,

    /// Bit 11 (UMIP): User-Mode Instruction Prevention.
    pub umip: bool,

    /// Bit 12: Reserved.
    #[bits(default = false)]
    _reserved_12: bool,

    /// Bit 13 (VMXE): VMX Enable.
    pub vmxe: bool,

    /// Bit 14 (SMXE): SMX Enable.
    pub smxe: bool,

    /// Bit 15: Reserved.
    #[bits(default = false)]
    _reserved_15: bool,

    /// Bit 16: FSGSBASE.
    pub fsgsbase: bool,

    /// Bit 17: PCIDE.
    pub pcide: bool,

    /// Bit 18: OSXSAVE.
    pub osxsave: bool,

    /// Bit 19: Reserved.
    #[bits(default = false)]
    _reserved_19: bool,

    /// Bit 20 (SMEP): Supervisor Mode Execution Prevention.
    pub smep: bool,

    /// Bit 21 (SMAP): Supervisor Mode Access Prevention.
    pub smap: bool,

    /// Bit 22 (PKE): Protection Keys Enable.
    pub pke: bool,

    /// Bits 23–31: Reserved.
    #[bits(9, access = RO)]
    pub reserved2: u16,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let mut cr4: u32;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nomem, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pse_is_bit_4() {
        assert_eq!(Cr4::new().with_pse(true).into_bits(), 0x10);
        assert!(!Cr4::from_bits(0x20).pse());
    }
}
