//! # Global access point
//!
//! The one place the rest of the kernel reaches memory through. A
//! [`GlobalMemory`] wraps the [`MemoryManager`] in a [`SpinLock`] taken with
//! interrupts masked. On a single CPU the lock can only be found held when
//! an interrupt handler re-enters an allocator; that is reported as
//! [`GlobalError::Reentered`] instead of spinning forever.

use crate::manager::{MemoryError, MemoryManager};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, VirtMapper};
use log::warn;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GlobalError {
    #[error("memory manager already installed")]
    AlreadyInstalled,
    #[error("memory manager not installed")]
    NotInstalled,
    #[error("memory manager re-entered")]
    Reentered,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Lock-protected slot for the kernel's [`MemoryManager`].
pub struct GlobalMemory<M: VirtMapper + Copy, U: Mmu + Copy> {
    inner: SpinLock<Option<MemoryManager<M, U>>>,
}

impl<M: VirtMapper + Copy, U: Mmu + Copy> GlobalMemory<M, U> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Hand over the manager. Only the first call succeeds.
    ///
    /// # Errors
    /// [`GlobalError::AlreadyInstalled`] on every later call.
    pub fn install(&self, manager: MemoryManager<M, U>) -> Result<(), GlobalError> {
        let mut slot = self.inner.try_lock_irq().ok_or(GlobalError::Reentered)?;
        if slot.is_some() {
            return Err(GlobalError::AlreadyInstalled);
        }
        *slot = Some(manager);
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.inner.try_lock_irq().is_some_and(|slot| slot.is_some())
    }

    /// Run `f` on the manager with interrupts masked.
    ///
    /// # Errors
    /// - [`GlobalError::NotInstalled`] before [`install`](Self::install).
    /// - [`GlobalError::Reentered`] when called from inside another call.
    pub fn with_memory<R>(
        &self,
        f: impl FnOnce(&mut MemoryManager<M, U>) -> R,
    ) -> Result<R, GlobalError> {
        let Some(mut slot) = self.inner.try_lock_irq() else {
            warn!("memory: re-entered from interrupt context");
            return Err(GlobalError::Reentered);
        };
        let manager = slot.as_mut().ok_or(GlobalError::NotInstalled)?;
        Ok(f(manager))
    }

    pub fn kmalloc(&self, size: u32) -> Option<VirtualAddress> {
        self.with_memory(|m| m.kmalloc(size)).ok().flatten()
    }

    pub fn kmalloc_a(&self, size: u32) -> Option<VirtualAddress> {
        self.with_memory(|m| m.kmalloc_a(size)).ok().flatten()
    }

    pub fn kcalloc(&self, count: u32, size: u32) -> Option<VirtualAddress> {
        self.with_memory(|m| m.kcalloc(count, size)).ok().flatten()
    }

    /// # Errors
    /// See [`MemoryManager::krealloc`] and [`with_memory`](Self::with_memory).
    pub fn krealloc(
        &self,
        ptr: Option<VirtualAddress>,
        size: u32,
    ) -> Result<Option<VirtualAddress>, GlobalError> {
        Ok(self.with_memory(|m| m.krealloc(ptr, size))??)
    }

    /// # Errors
    /// See [`MemoryManager::kfree`] and [`with_memory`](Self::with_memory).
    pub fn kfree(&self, ptr: VirtualAddress) -> Result<(), GlobalError> {
        Ok(self.with_memory(|m| m.kfree(ptr))??)
    }
}

impl<M: VirtMapper + Copy, U: Mmu + Copy> Default for GlobalMemory<M, U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Alignments up to the heap granule come from `kmalloc`, up to a page from
/// `kmalloc_a`; anything larger is refused.
unsafe impl<M: VirtMapper + Copy, U: Mmu + Copy> GlobalAlloc for GlobalMemory<M, U> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Ok(size) = u32::try_from(layout.size()) else {
            return ptr::null_mut();
        };
        let va = match layout.align() {
            0..=16 => self.kmalloc(size),
            17..=4096 => self.kmalloc_a(size),
            _ => None,
        };
        va.map_or(ptr::null_mut(), to_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Ok(size) = u32::try_from(layout.size()) else {
            return ptr::null_mut();
        };
        if layout.align() > 16 {
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
            }
            return ptr;
        }
        self.kcalloc(1, size).map_or(ptr::null_mut(), to_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(va) = to_va(ptr) {
            // Rejected pointers are already logged by the heap.
            let _ = self.kfree(va);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > 16 || new_size == 0 {
            let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                return ptr::null_mut();
            };
            let new = unsafe { self.alloc(new_layout) };
            if !new.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }

        let (Some(va), Ok(size)) = (to_va(ptr), u32::try_from(new_size)) else {
            return ptr::null_mut();
        };
        match self.krealloc(Some(va), size) {
            Ok(Some(moved)) => to_ptr(moved),
            _ => ptr::null_mut(),
        }
    }
}

fn to_ptr(va: VirtualAddress) -> *mut u8 {
    ptr::with_exposed_provenance_mut(va.as_u32() as usize)
}

fn to_va(ptr: *mut u8) -> Option<VirtualAddress> {
    u32::try_from(ptr.expose_provenance())
        .ok()
        .map(VirtualAddress::new)
}

#[cfg(target_arch = "x86")]
pub use self::kernel::{KERNEL_MEMORY, KernelAllocator};

#[cfg(target_arch = "x86")]
mod kernel {
    use super::GlobalMemory;
    use core::alloc::{GlobalAlloc, Layout};
    use kernel_vmem::hardware::{DirectMapper, HardwareMmu};

    /// The kernel's memory, installed once during boot.
    pub static KERNEL_MEMORY: GlobalMemory<DirectMapper, HardwareMmu> = GlobalMemory::new();

    /// `#[global_allocator]` adapter over [`KERNEL_MEMORY`].
    #[derive(Copy, Clone, Debug, Default)]
    pub struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { KERNEL_MEMORY.alloc(layout) }
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { KERNEL_MEMORY.alloc_zeroed(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { KERNEL_MEMORY.dealloc(ptr, layout) }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            unsafe { KERNEL_MEMORY.realloc(ptr, layout, new_size) }
        }
    }
}
