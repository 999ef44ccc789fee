//! # MMU emulator
//!
//! A host-side model of an i386 machine's memory: a block of page-aligned
//! "physical RAM" starting at physical address 0, a CR3 and a CR0.PG bit.
//! It implements [`VirtMapper`] and [`Mmu`], so the paging code and everything
//! above it runs unmodified in tests.
//!
//! Before paging is enabled, virtual addresses resolve with the bootstrap
//! rule. Afterwards every access walks the loaded page directory through
//! physical memory exactly like the hardware does; a missing entry panics
//! like a page fault would.

use crate::info::bootstrap_virtual_to_physical;
use crate::page_table::split_indices;
use crate::{Mmu, PdEntry, PtEntry, VirtMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

const FRAME: usize = 4096;

/// Emulated RAM plus the paging registers.
pub struct EmulatedMachine {
    ram: NonNull<u8>,
    size: usize,
    directory: Cell<Option<PhysicalPage<Size4K>>>,
    paging: Cell<bool>,
    invalidations: Cell<usize>,
}

impl EmulatedMachine {
    /// A machine with `bytes` of zeroed RAM, rounded up to whole frames.
    ///
    /// # Panics
    /// If the host cannot provide the memory.
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        let size = bytes.div_ceil(FRAME).max(1) * FRAME;
        let layout = Self::layout(size);
        let ram = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));
        Self {
            ram,
            size,
            directory: Cell::new(None),
            paging: Cell::new(false),
            invalidations: Cell::new(0),
        }
    }

    /// Keep the machine alive for the rest of the process.
    ///
    /// Code that stores its mapper by value (such as a global memory manager)
    /// needs a `'static` handle.
    #[must_use]
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, FRAME).unwrap_or_else(|_| panic!("bad RAM size {size}"))
    }

    /// Installed RAM in bytes.
    #[must_use]
    pub const fn ram_size(&self) -> usize {
        self.size
    }

    /// Frame currently loaded into CR3.
    #[must_use]
    pub fn directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.directory.get()
    }

    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    /// Number of `invlpg` executed so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// Translate like the CPU would, `None` on a (would-be) page fault.
    #[must_use]
    pub fn try_translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.paging.get() {
            return Some(bootstrap_virtual_to_physical(va));
        }

        let root = self.directory.get()?;
        let (di, ti) = split_indices(va);

        let pde = PdEntry::from_bits(self.phys_u32(root.base() + 4 * di.as_usize() as u32)?);
        if !pde.present() {
            return None;
        }
        let table = pde.table_page();
        let pte = PtEntry::from_bits(self.phys_u32(table.base() + 4 * ti.as_usize() as u32)?);
        if !pte.present() {
            return None;
        }
        Some(pte.frame().join(va.offset::<Size4K>()))
    }

    /// Copy `len` bytes of physical memory out.
    ///
    /// # Panics
    /// If the range is not backed by RAM.
    #[must_use]
    pub fn read_phys(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let start = self.host_offset(pa, len);
        unsafe { core::slice::from_raw_parts(self.ram.as_ptr().add(start), len) }.to_vec()
    }

    /// # Panics
    /// If the range is not backed by RAM.
    #[must_use]
    pub fn read_phys_u32(&self, pa: PhysicalAddress) -> u32 {
        let start = self.host_offset(pa, 4);
        unsafe { self.ram.as_ptr().add(start).cast::<u32>().read_unaligned() }
    }

    /// # Panics
    /// If the range is not backed by RAM.
    pub fn write_phys(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let start = self.host_offset(pa, bytes.len());
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ram.as_ptr().add(start), bytes.len());
        }
    }

    fn phys_u32(&self, pa: PhysicalAddress) -> Option<u32> {
        let start = pa.as_u32() as usize;
        if start + 4 > self.size {
            return None;
        }
        Some(unsafe { self.ram.as_ptr().add(start).cast::<u32>().read_unaligned() })
    }

    fn host_offset(&self, pa: PhysicalAddress, len: usize) -> usize {
        let start = pa.as_u32() as usize;
        assert!(
            start + len <= self.size,
            "bus error: {pa} + {len:#x} outside {:#x} bytes of RAM",
            self.size
        );
        start
    }

    fn resolve(&self, va: VirtualAddress) -> PhysicalAddress {
        self.try_translate(va)
            .unwrap_or_else(|| panic!("page fault at {va}"))
    }
}

impl Drop for EmulatedMachine {
    fn drop(&mut self) {
        unsafe { dealloc(self.ram.as_ptr(), Self::layout(self.size)) };
    }
}

impl VirtMapper for EmulatedMachine {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let pa = self.resolve(va);
        let bytes = size_of::<T>();
        if bytes > 0 {
            let last = va
                .checked_add(u32::try_from(bytes - 1).unwrap_or(u32::MAX))
                .unwrap_or_else(|| panic!("{va} + {bytes:#x} wraps"));
            assert_eq!(
                self.resolve(last).as_u32() - pa.as_u32(),
                last.as_u32() - va.as_u32(),
                "object at {va} straddles non-contiguous frames"
            );
        }
        let start = self.host_offset(pa, bytes);
        unsafe { &mut *self.ram.as_ptr().add(start).cast::<T>() }
    }

    unsafe fn virt_to_slice_mut<'a, T>(&self, va: VirtualAddress, len: usize) -> &'a mut [T] {
        let pa = self.resolve(va);
        let bytes = size_of::<T>() * len;
        let mut page = va.align_down::<Size4K>().as_u64() + FRAME as u64;
        while page < va.as_u64() + bytes as u64 {
            #[allow(clippy::cast_possible_truncation)]
            let probe = VirtualAddress::new(page as u32);
            assert_eq!(
                u64::from(self.resolve(probe).as_u32()),
                u64::from(pa.as_u32()) + (page - va.as_u64()),
                "slice at {va} is not physically contiguous"
            );
            page += FRAME as u64;
        }
        let start = self.host_offset(pa, bytes);
        unsafe { core::slice::from_raw_parts_mut(self.ram.as_ptr().add(start).cast::<T>(), len) }
    }
}

impl Mmu for EmulatedMachine {
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        self.host_offset(directory.base(), FRAME);
        self.directory.set(Some(directory));
    }

    unsafe fn enable_paging(&self) {
        assert!(self.directory.get().is_some(), "CR0.PG set without CR3");
        self.paging.set(true);
    }

    unsafe fn invalidate_page(&self, _page: VirtualPage<Size4K>) {
        self.invalidations.set(self.invalidations.get() + 1);
    }
}
