//! # Virtual Memory Support
//!
//! i386 two-level paging (no PAE, 4 KiB pages only) for a higher-half kernel.
//!
//! ## What you get
//! - Typed [`PdEntry`]/[`PtEntry`] bitfields and the page-sized
//!   [`PageDirectory`], [`PageTable`] and [`TableRefs`] structures.
//! - An [`AddressSpace`] handle naming a directory and its table shadow.
//! - [`Paging`], the per-page mapping engine with its one-way
//!   disabled → enabled mode switch.
//! - The seams it is built on: [`FrameAlloc`], [`TableAlloc`],
//!   [`VirtMapper`] and [`Mmu`].
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//!  CR3 ──► Page Directory ──► Page Table ──► 4 KiB frame
//!          (1024 PDEs)        (1024 PTEs)
//!
//!  VA = [PD:10] [PT:10] [Offset:12]
//! ```
//!
//! The CPU only knows physical table addresses, software only virtual ones.
//! Each directory therefore carries a shadow page ([`TableRefs`]) with the
//! virtual address of every table it references.
//!
//! ## Two address modes
//!
//! Before paging is turned on the kernel already runs at its link address in
//! the higher half (the boot path maps it there temporarily). Physical
//! addresses of tables are then computed with
//! [`bootstrap_virtual_to_physical`](kernel_info::memory::bootstrap_virtual_to_physical);
//! after [`Paging::enable`] they come from a walk of the active directory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
#[cfg(target_arch = "x86")]
pub mod hardware;
pub mod page_table;
mod paging;

#[cfg(any(test, feature = "emulator"))]
extern crate alloc;

pub use crate::address_space::{AddressSpace, PageFlags};
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry, TableRefs};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::paging::{MapOutcome, Paging, PagingError, PagingMode};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of physical 4 KiB frames for mapped pages.
pub trait FrameAlloc {
    /// Allocate one frame, `None` when physical memory is exhausted.
    fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Take a specific frame out of circulation (explicit physical mappings).
    fn reserve_frame(&mut self, frame: PhysicalPage<Size4K>);

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&mut self, frame: PhysicalPage<Size4K>);
}

/// Source of page-sized, page-aligned, **zeroed** memory for directories,
/// shadows and page tables.
///
/// The returned page must lie in kernel space and stay reachable through the
/// [`VirtMapper`] in every address space.
pub trait TableAlloc {
    fn alloc_table(&mut self) -> Option<VirtualPage<Size4K>>;
}

/// Turns kernel virtual addresses into references.
///
/// On hardware this is the identity (the address *is* the pointer); the
/// emulator resolves it through its own MMU model.
///
/// # Safety
/// - `va` must be mapped writable in the current address mode.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `va` (no aliasing UB).
pub trait VirtMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;

    /// A slice of `len` elements starting at `va`.
    ///
    /// # Safety
    /// See the trait documentation. Additionally, the range must be
    /// physically contiguous.
    unsafe fn virt_to_slice_mut<'a, T>(&self, va: VirtualAddress, len: usize) -> &'a mut [T];
}

/// The privileged MMU operations paging needs.
pub trait Mmu {
    /// Load `directory` into CR3.
    ///
    /// # Safety
    /// The directory must map the currently executing code and data.
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>);

    /// Set CR0.PG (with CR4.PSE cleared).
    ///
    /// # Safety
    /// A valid directory must be loaded.
    unsafe fn enable_paging(&self);

    /// Drop any cached translation for `page`.
    ///
    /// # Safety
    /// Privileged instruction.
    unsafe fn invalidate_page(&self, page: VirtualPage<Size4K>);
}

impl<T: VirtMapper + ?Sized> VirtMapper for &T {
    #[inline]
    unsafe fn virt_to_mut<'a, U>(&self, va: VirtualAddress) -> &'a mut U {
        unsafe { (**self).virt_to_mut(va) }
    }

    #[inline]
    unsafe fn virt_to_slice_mut<'a, U>(&self, va: VirtualAddress, len: usize) -> &'a mut [U] {
        unsafe { (**self).virt_to_slice_mut(va, len) }
    }
}

impl<T: Mmu + ?Sized> Mmu for &T {
    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { (**self).load_directory(directory) }
    }

    #[inline]
    unsafe fn enable_paging(&self) {
        unsafe { (**self).enable_paging() }
    }

    #[inline]
    unsafe fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        unsafe { (**self).invalidate_page(page) }
    }
}
