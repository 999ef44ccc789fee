//! # Bare-metal backends
//!
//! [`HardwareMmu`] drives the real control registers; [`DirectMapper`]
//! dereferences kernel virtual addresses directly, which is valid both before
//! paging (the boot path maps the higher half) and after it.

use crate::{Mmu, VirtMapper};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR0/CR3/CR4 and `invlpg` on the executing CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct HardwareMmu;

impl Mmu for HardwareMmu {
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_directory_phys(directory.base(), false, false).store_unsafe() };
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let mut cr4 = Cr4::load_unsafe();
            cr4.set_pse(false);
            cr4.store_unsafe();

            let mut cr0 = Cr0::load_unsafe();
            cr0.set_pg_paging(true);
            cr0.store_unsafe();
        }
    }

    unsafe fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        let va = page.base().as_u32();
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}

/// Uses the virtual address itself as the pointer.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectMapper;

impl VirtMapper for DirectMapper {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *(va.as_u32() as usize as *mut T) }
    }

    unsafe fn virt_to_slice_mut<'a, T>(&self, va: VirtualAddress, len: usize) -> &'a mut [T] {
        unsafe { core::slice::from_raw_parts_mut(va.as_u32() as usize as *mut T, len) }
    }
}
