//! # Virtual Memory Manager
//!
//! Region-level operations on top of [`Paging`]: bringing up the kernel
//! address space, mapping and unmapping ranges inside the user or kernel
//! zone, and cloning address spaces.
//!
//! ```text
//!  0x0000_1000 ┌──────────────────────┐
//!              │ user zone            │  private tables per address space
//!  0xC000_0000 ├──────────────────────┤
//!              │ lower 1 MiB window   │
//!  0xC010_0000 │ kernel image         │  tables shared by every address space
//!              │ placement buffer     │
//!              │ ...                  │
//!  0xE000_0000 │ kernel heap          │
//!              └──────────────────────┘
//! ```
//!
//! All operations other than [`Vmm::init`] require paging to be enabled;
//! a [`Vmm`] only exists after `init` succeeded.

use kernel_info::boot::KernelImage;
use kernel_info::memory::{
    KERNEL_ZONE, LOWER_MEMORY_SIZE, LOWER_MEMORY_VIRTUAL_BASE, PAGE_SIZE, USER_ZONE, VirtualZone,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::page_table::ENTRIES;
use kernel_vmem::{
    AddressSpace, DirectoryIndex, FrameAlloc, MapOutcome, Mmu, PageFlags, Paging, PagingError,
    TableAlloc, VirtMapper,
};
use log::{debug, info, warn};

/// Bytes covered by one page table.
const TABLE_SPAN: u64 = ENTRIES as u64 * PAGE_SIZE as u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error("empty range")]
    EmptyRange,
    #[error("range at {0} leaves its virtual zone")]
    ZoneViolation(VirtualAddress),
    #[error("no {pages} consecutive free pages")]
    OutOfVirtualSpace { pages: u32 },
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("page at {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("physical range exceeds the address space")]
    InvalidRange,
}

/// The kernel's virtual memory state.
pub struct Vmm<M: VirtMapper, U: Mmu> {
    paging: Paging<M, U>,
    kernel: AddressSpace,
}

impl<M: VirtMapper, U: Mmu> Vmm<M, U> {
    /// Build the kernel address space and turn paging on.
    ///
    /// Maps the first MiB of physical memory at [`LOWER_MEMORY_VIRTUAL_BASE`]
    /// and `kernel` at its link address. Everything the kernel touches before
    /// the heap exists (placement buffer included) must lie inside `kernel`.
    ///
    /// # Errors
    /// Any [`PagingError`] raised while building the tables.
    pub fn init<F: FrameAlloc, T: TableAlloc>(
        mapper: M,
        mmu: U,
        frames: &mut F,
        tables: &mut T,
        kernel: &KernelImage,
    ) -> Result<Self, VmmError> {
        let mut paging = Paging::new(mapper, mmu);
        let space = paging.create_address_space(tables)?;

        let lower = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(
            LOWER_MEMORY_VIRTUAL_BASE,
        ));
        for i in 0..LOWER_MEMORY_SIZE / PAGE_SIZE {
            paging.allocate_page(
                space,
                VirtualPage::from_index(lower.index() + i),
                Some(PhysicalPage::from_index(i)),
                PageFlags::KERNEL_RW,
                frames,
                tables,
            )?;
        }

        let first = kernel.virtual_start.page::<Size4K>();
        let frame = kernel.physical_start.page::<Size4K>();
        let end = kernel.virtual_end.as_u64().next_multiple_of(u64::from(PAGE_SIZE));
        #[allow(clippy::cast_possible_truncation)]
        let pages = ((end - first.base().as_u64()) / u64::from(PAGE_SIZE)) as u32;
        for i in 0..pages {
            paging.allocate_page(
                space,
                VirtualPage::from_index(first.index() + i),
                Some(PhysicalPage::from_index(frame.index() + i)),
                PageFlags::KERNEL_RW,
                frames,
                tables,
            )?;
        }

        paging.switch_page_directory(space)?;
        paging.enable()?;
        info!(
            "vmm: kernel space {space:?}, {} image pages at {}",
            pages,
            first.base()
        );

        Ok(Self {
            paging,
            kernel: space,
        })
    }

    /// Map `size` bytes in the active address space.
    ///
    /// With `va == None` the first free run of pages in the zone selected by
    /// `flags.kernel` is used. With `pa == None` every page gets a fresh
    /// frame, otherwise frames follow `pa` consecutively. Returns the
    /// page-aligned start of the mapping.
    ///
    /// Either every page is mapped or none is: an explicit range that
    /// overlaps an existing mapping is rejected up front, and a failure half
    /// way through unmaps what this call mapped.
    ///
    /// # Errors
    /// - [`VmmError::EmptyRange`] for `size == 0`.
    /// - [`VmmError::ZoneViolation`] if the range leaves its zone.
    /// - [`VmmError::AlreadyMapped`] if an explicit range is partly mapped.
    /// - [`VmmError::OutOfVirtualSpace`] if no free run is large enough.
    /// - [`VmmError::InvalidRange`] if the physical range passes 4 GiB.
    /// - [`VmmError::Paging`] when frames or table memory run out.
    pub fn map_memory<F: FrameAlloc, T: TableAlloc>(
        &self,
        frames: &mut F,
        tables: &mut T,
        va: Option<VirtualAddress>,
        size: u32,
        pa: Option<PhysicalAddress>,
        flags: PageFlags,
    ) -> Result<VirtualAddress, VmmError> {
        if size == 0 {
            return Err(VmmError::EmptyRange);
        }

        let space = self.active();
        let zone = zone_for(flags);
        let offset = match (va, pa) {
            (Some(va), _) => va.offset::<Size4K>().as_u32(),
            (None, Some(pa)) => pa.offset::<Size4K>().as_u32(),
            (None, None) => 0,
        };
        #[allow(clippy::cast_possible_truncation)]
        let pages = (u64::from(offset) + u64::from(size)).div_ceil(u64::from(PAGE_SIZE)) as u32;

        let first = match va {
            Some(va) => {
                let start = va.align_down::<Size4K>();
                if !zone.contains_range(start, u64::from(pages) * u64::from(PAGE_SIZE)) {
                    return Err(VmmError::ZoneViolation(va));
                }
                let first = start.page::<Size4K>();
                if let Some(page) = self.first_mapped(space, first, pages) {
                    return Err(VmmError::AlreadyMapped(page.base()));
                }
                first
            }
            None => self
                .find_free_range(space, zone, pages)
                .ok_or(VmmError::OutOfVirtualSpace { pages })?,
        };

        let first_frame = match pa {
            Some(pa) => {
                let frame = pa.page::<Size4K>();
                frame
                    .checked_add_pages(pages - 1)
                    .ok_or(VmmError::InvalidRange)?;
                Some(frame)
            }
            None => None,
        };

        for i in 0..pages {
            let page = VirtualPage::from_index(first.index() + i);
            let frame = first_frame.map(|f| PhysicalPage::from_index(f.index() + i));
            let error = match self
                .paging
                .allocate_page(space, page, frame, flags, frames, tables)
            {
                Ok(MapOutcome::Mapped(_)) => continue,
                Ok(MapOutcome::AlreadyMapped) => VmmError::AlreadyMapped(page.base()),
                Err(e) => e.into(),
            };
            warn!("vmm: {error} after {i} of {pages} pages at {}, rolling back", first.base());
            self.rollback(space, first, i, first_frame.is_none(), frames);
            return Err(error);
        }

        debug!("vmm: mapped {pages} pages at {}", first.base());
        Ok(first.base())
    }

    /// Unmap every page touching `[va, va + size)` in the active address
    /// space and release the frames. Returns the number of pages unmapped.
    ///
    /// Page tables are kept.
    pub fn unmap_memory<F: FrameAlloc>(
        &self,
        frames: &mut F,
        va: VirtualAddress,
        size: u32,
    ) -> usize {
        if size == 0 {
            return 0;
        }
        let space = self.active();
        let first = va.page::<Size4K>();
        let end = (va.as_u64() + u64::from(size)).div_ceil(u64::from(PAGE_SIZE));

        let mut count = 0;
        for index in u64::from(first.index())..end {
            #[allow(clippy::cast_possible_truncation)]
            let page = VirtualPage::from_index(index as u32);
            if let Some(frame) = self.paging.free_page(space, page) {
                frames.free_frame(frame);
                count += 1;
            }
        }
        debug!("vmm: unmapped {count} pages at {}", first.base());
        count
    }

    /// Whether `va` is mapped in the active address space.
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.paging.is_mapped(self.active(), va)
    }

    /// Physical address behind `va` in the active address space.
    #[must_use]
    pub fn get_mapped_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.paging.virtual_to_physical(self.active(), va)
    }

    /// Make `space` the active address space.
    ///
    /// # Errors
    /// [`VmmError::Paging`] if the directory of `space` is not mapped.
    pub fn switch_page_directory(&mut self, space: AddressSpace) -> Result<(), VmmError> {
        Ok(self.paging.switch_page_directory(space)?)
    }

    /// A new address space with an empty user zone and the kernel zone
    /// shared with the kernel address space.
    ///
    /// # Errors
    /// [`VmmError::Paging`] when table memory runs out.
    pub fn create_address_space<T: TableAlloc>(
        &self,
        tables: &mut T,
    ) -> Result<AddressSpace, VmmError> {
        let space = self.paging.create_address_space(tables)?;
        let first = DirectoryIndex::from(VirtualAddress::new(KERNEL_ZONE.base));
        for di in first.as_usize()..ENTRIES {
            self.paging.share_table(space, self.kernel, slot(di));
        }
        Ok(space)
    }

    /// Clone `src`.
    ///
    /// Tables `src` shares with the kernel address space stay shared. Every
    /// other table is copied page by page into fresh frames with the same
    /// permissions, through a two-page window mapped in the active address
    /// space for the duration of the copy.
    ///
    /// # Errors
    /// - [`VmmError::OutOfFrames`] / [`VmmError::Paging`] on exhaustion; frames
    ///   of the partial copy are released again.
    /// - [`VmmError::OutOfVirtualSpace`] if no window fits the kernel zone.
    pub fn copy_page_directory<F: FrameAlloc, T: TableAlloc>(
        &self,
        frames: &mut F,
        tables: &mut T,
        src: AddressSpace,
    ) -> Result<AddressSpace, VmmError> {
        let active = self.active();
        let window = self
            .find_free_range(active, KERNEL_ZONE, 2)
            .ok_or(VmmError::OutOfVirtualSpace { pages: 2 })?;
        let dst = self.paging.create_address_space(tables)?;

        let result = self.copy_tables(frames, tables, src, dst, window);
        for page in [window, VirtualPage::from_index(window.index() + 1)] {
            self.paging.free_page(active, page);
        }

        match result {
            Ok(copied) => {
                debug!("vmm: copied {src:?} into {dst:?}, {copied} private pages");
                Ok(dst)
            }
            Err(e) => {
                warn!("vmm: copy of {src:?} failed: {e}");
                self.release_private(frames, dst, src);
                Err(e)
            }
        }
    }

    /// The address space built by [`init`](Self::init).
    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace {
        self.kernel
    }

    /// The address space currently loaded into CR3.
    #[must_use]
    pub fn active(&self) -> AddressSpace {
        self.paging.active().unwrap_or(self.kernel)
    }

    #[must_use]
    pub const fn paging(&self) -> &Paging<M, U> {
        &self.paging
    }

    fn copy_tables<F: FrameAlloc, T: TableAlloc>(
        &self,
        frames: &mut F,
        tables: &mut T,
        src: AddressSpace,
        dst: AddressSpace,
        window: VirtualPage<Size4K>,
    ) -> Result<usize, VmmError> {
        let mut copied = 0;
        for di in 0..ENTRIES {
            let di = slot(di);
            let Some(table) = self.paging.table_of(src, di) else {
                continue;
            };
            if self.paging.table_of(self.kernel, di) == Some(table) {
                self.paging.share_table(dst, src, di);
                continue;
            }

            for page in pages_of(di) {
                let Some(entry) = self.paging.entry(src, page) else {
                    continue;
                };
                let frame = frames.alloc_frame().ok_or(VmmError::OutOfFrames)?;
                let mapped = self.paging.allocate_page(
                    dst,
                    page,
                    Some(frame),
                    PageFlags::from_entry(entry),
                    frames,
                    tables,
                );
                if let Err(e) = mapped {
                    frames.free_frame(frame);
                    return Err(e.into());
                }
                self.copy_frame(frames, tables, entry.frame(), frame, window)?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Copy one frame through the window pages.
    fn copy_frame<F: FrameAlloc, T: TableAlloc>(
        &self,
        frames: &mut F,
        tables: &mut T,
        from: PhysicalPage<Size4K>,
        to: PhysicalPage<Size4K>,
        window: VirtualPage<Size4K>,
    ) -> Result<(), VmmError> {
        let active = self.active();
        let source = window;
        let target = VirtualPage::from_index(window.index() + 1);
        for (page, frame) in [(source, from), (target, to)] {
            let outcome = self.paging.allocate_page(
                active,
                page,
                Some(frame),
                PageFlags::KERNEL_RW,
                frames,
                tables,
            )?;
            if outcome == MapOutcome::AlreadyMapped {
                return Err(VmmError::AlreadyMapped(page.base()));
            }
        }

        let len = PAGE_SIZE as usize;
        unsafe {
            let bytes: &mut [u8] = self.paging.mapper().virt_to_slice_mut(source.base(), len);
            let copy: &mut [u8] = self.paging.mapper().virt_to_slice_mut(target.base(), len);
            copy.copy_from_slice(bytes);
        }

        // The window must be empty again before the walk reaches its slot.
        self.paging.free_page(active, source);
        self.paging.free_page(active, target);
        Ok(())
    }

    /// Unmap and free every page in tables of `copy` that are not shared
    /// with `src`.
    fn release_private<F: FrameAlloc>(&self, frames: &mut F, copy: AddressSpace, src: AddressSpace) {
        for di in 0..ENTRIES {
            let di = slot(di);
            let Some(table) = self.paging.table_of(copy, di) else {
                continue;
            };
            if self.paging.table_of(src, di) == Some(table) {
                continue;
            }
            for page in pages_of(di) {
                if let Some(frame) = self.paging.free_page(copy, page) {
                    frames.free_frame(frame);
                }
            }
        }
    }

    fn rollback<F: FrameAlloc>(
        &self,
        space: AddressSpace,
        first: VirtualPage<Size4K>,
        mapped: u32,
        owned_frames: bool,
        frames: &mut F,
    ) {
        for i in 0..mapped {
            let page = VirtualPage::from_index(first.index() + i);
            if let Some(frame) = self.paging.free_page(space, page)
                && owned_frames
            {
                frames.free_frame(frame);
            }
        }
    }

    fn first_mapped(
        &self,
        space: AddressSpace,
        first: VirtualPage<Size4K>,
        pages: u32,
    ) -> Option<VirtualPage<Size4K>> {
        (0..pages)
            .map(|i| VirtualPage::from_index(first.index() + i))
            .find(|page| self.paging.entry(space, *page).is_some())
    }

    /// First run of `pages` unmapped pages in `zone`. A slot without a page
    /// table counts as 4 MiB of free pages.
    fn find_free_range(
        &self,
        space: AddressSpace,
        zone: VirtualZone,
        pages: u32,
    ) -> Option<VirtualPage<Size4K>> {
        let page_size = u64::from(PAGE_SIZE);
        let end = zone.end() / page_size * page_size;
        let mut addr = u64::from(zone.base).next_multiple_of(page_size);
        let mut run_start = addr;
        let mut run = 0u64;

        while addr < end {
            #[allow(clippy::cast_possible_truncation)]
            let va = VirtualAddress::new(addr as u32);
            let step = if self.paging.table_of(space, DirectoryIndex::from(va)).is_none() {
                ((addr | (TABLE_SPAN - 1)) + 1).min(end) - addr
            } else if self.paging.entry(space, va.page()).is_some() {
                run = 0;
                addr += page_size;
                continue;
            } else {
                page_size
            };

            if run == 0 {
                run_start = addr;
            }
            run += step / page_size;
            if run >= u64::from(pages) {
                #[allow(clippy::cast_possible_truncation)]
                return Some(VirtualPage::from_index((run_start / page_size) as u32));
            }
            addr += step;
        }
        None
    }
}

const fn zone_for(flags: PageFlags) -> VirtualZone {
    if flags.kernel { KERNEL_ZONE } else { USER_ZONE }
}

#[allow(clippy::cast_possible_truncation)]
const fn slot(di: usize) -> DirectoryIndex {
    DirectoryIndex::new(di as u16)
}

/// Every page covered by the table in slot `di`.
fn pages_of(di: DirectoryIndex) -> impl Iterator<Item = VirtualPage<Size4K>> {
    #[allow(clippy::cast_possible_truncation)]
    let first = (di.as_usize() * ENTRIES) as u32;
    (first..first + ENTRIES as u32).map(VirtualPage::from_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::{BITMAP_WORDS, BitmapFrameAllocator};
    use kernel_info::boot::MemoryRegion;
    use kernel_vmem::emulator::EmulatedMachine;

    /// Page tables handed out from the placement area of the image.
    struct BumpTables {
        next: u32,
        end: u32,
    }

    impl TableAlloc for BumpTables {
        fn alloc_table(&mut self) -> Option<VirtualPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let page = VirtualPage::containing_address(VirtualAddress::new(self.next));
            self.next += PAGE_SIZE;
            Some(page)
        }
    }

    type TestVmm = Vmm<&'static EmulatedMachine, &'static EmulatedMachine>;

    fn image() -> KernelImage {
        KernelImage::new(
            PhysicalAddress::new(0x0010_0000),
            VirtualAddress::new(0xC010_0000),
            0x0030_0000,
        )
    }

    /// 8 MiB machine; frames come from [4 MiB, 8 MiB), tables from the
    /// upper half of the image.
    fn boot(bitmap: &mut [u32]) -> (&'static EmulatedMachine, BitmapFrameAllocator<'_>, BumpTables, TestVmm) {
        let machine = EmulatedMachine::new(8 * 1024 * 1024).leak();
        let mut frames =
            BitmapFrameAllocator::new(bitmap, &[MemoryRegion::available(0x40_0000, 0x40_0000)])
                .unwrap();
        let mut tables = BumpTables {
            next: 0xC030_0000,
            end: 0xC040_0000,
        };
        let vmm = Vmm::init(machine, machine, &mut frames, &mut tables, &image()).unwrap();
        (machine, frames, tables, vmm)
    }

    fn write(machine: &EmulatedMachine, va: u32, value: u32) {
        unsafe { *machine.virt_to_mut::<u32>(VirtualAddress::new(va)) = value };
    }

    fn read(machine: &EmulatedMachine, va: u32) -> u32 {
        unsafe { *machine.virt_to_mut::<u32>(VirtualAddress::new(va)) }
    }

    #[test]
    fn init_maps_lower_memory_and_image() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (machine, _, _, vmm) = boot(&mut bitmap);

        assert!(machine.paging_enabled());
        assert!(vmm.paging().is_enabled());
        assert_eq!(vmm.active(), vmm.kernel_space());
        assert_eq!(
            vmm.get_mapped_address(VirtualAddress::new(0xC00B_8000)),
            Some(PhysicalAddress::new(0xB_8000))
        );
        assert_eq!(
            vmm.get_mapped_address(VirtualAddress::new(0xC012_3456)),
            Some(PhysicalAddress::new(0x12_3456))
        );
        assert!(vmm.is_mapped(VirtualAddress::new(0xC03F_F000)));
        assert!(!vmm.is_mapped(VirtualAddress::new(0xC040_0000)));
        assert!(!vmm.is_mapped(VirtualAddress::new(0x0010_0000)));
    }

    #[test]
    fn map_round_trip() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (machine, mut frames, mut tables, vmm) = boot(&mut bitmap);
        let free = frames.free_frame_count();

        let va = vmm
            .map_memory(&mut frames, &mut tables, None, 8192, None, PageFlags::KERNEL_RW)
            .unwrap();
        assert!(va.is_aligned::<Size4K>());
        assert!(KERNEL_ZONE.contains_range(va, 8192));
        assert_eq!(frames.free_frame_count(), free - 2);

        write(machine, va.as_u32(), 0x1111_1111);
        write(machine, va.as_u32() + 4096, 0x2222_2222);
        assert_eq!(read(machine, va.as_u32()), 0x1111_1111);
        assert_ne!(
            vmm.get_mapped_address(va).unwrap().page::<Size4K>(),
            vmm.get_mapped_address(va + 4096).unwrap().page::<Size4K>()
        );

        assert_eq!(vmm.unmap_memory(&mut frames, va, 8192), 2);
        assert!(!vmm.is_mapped(va));
        assert!(!vmm.is_mapped(va + 4096));
        assert_eq!(frames.free_frame_count(), free);
    }

    #[test]
    fn unaligned_request_covers_every_touched_page() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        let va = vmm
            .map_memory(
                &mut frames,
                &mut tables,
                Some(VirtualAddress::new(0xD000_0FF0)),
                0x20,
                None,
                PageFlags::KERNEL_RW,
            )
            .unwrap();
        assert_eq!(va, VirtualAddress::new(0xD000_0000));
        assert!(vmm.is_mapped(VirtualAddress::new(0xD000_1000)));
        assert!(!vmm.is_mapped(VirtualAddress::new(0xD000_2000)));
    }

    #[test]
    fn explicit_overlap_is_rejected_without_changes() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xD000_1000)),
            4096,
            None,
            PageFlags::KERNEL_RW,
        )
        .unwrap();
        let free = frames.free_frame_count();

        let err = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xD000_0000)),
            0x3000,
            None,
            PageFlags::KERNEL_RW,
        );
        assert_eq!(err, Err(VmmError::AlreadyMapped(VirtualAddress::new(0xD000_1000))));
        assert!(!vmm.is_mapped(VirtualAddress::new(0xD000_0000)));
        assert!(!vmm.is_mapped(VirtualAddress::new(0xD000_2000)));
        assert_eq!(frames.free_frame_count(), free);
    }

    #[test]
    fn zones_are_enforced() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        let user_in_kernel = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xC080_0000)),
            4096,
            None,
            PageFlags::USER_RW,
        );
        assert_eq!(
            user_in_kernel,
            Err(VmmError::ZoneViolation(VirtualAddress::new(0xC080_0000)))
        );

        let straddling = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xBFFF_F000)),
            0x2000,
            None,
            PageFlags::USER_RW,
        );
        assert!(matches!(straddling, Err(VmmError::ZoneViolation(_))));

        let null_page = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0)),
            4096,
            None,
            PageFlags::USER_RW,
        );
        assert!(matches!(null_page, Err(VmmError::ZoneViolation(_))));

        assert_eq!(
            vmm.map_memory(&mut frames, &mut tables, None, 0, None, PageFlags::KERNEL_RW),
            Err(VmmError::EmptyRange)
        );
    }

    #[test]
    fn explicit_physical_range() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        let va = vmm
            .map_memory(
                &mut frames,
                &mut tables,
                Some(VirtualAddress::new(0xD000_0000)),
                0x2000,
                Some(PhysicalAddress::new(0x0070_0000)),
                PageFlags::KERNEL_RW,
            )
            .unwrap();
        assert_eq!(
            vmm.get_mapped_address(va + 0x1234),
            Some(PhysicalAddress::new(0x0070_1234))
        );
        assert!(frames.is_frame_used(PhysicalPage::from_index(0x700)));
        assert!(frames.is_frame_used(PhysicalPage::from_index(0x701)));
        assert!(!frames.is_frame_used(PhysicalPage::from_index(0x702)));

        let past_end = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xD010_0000)),
            0x2000,
            Some(PhysicalAddress::new(0xFFFF_F000)),
            PageFlags::KERNEL_RW,
        );
        assert_eq!(past_end, Err(VmmError::InvalidRange));
    }

    #[test]
    fn frame_exhaustion_rolls_back() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        while frames.free_frame_count() > 1 {
            frames.alloc_frame().unwrap();
        }
        let result = vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0xC020_0000 + 0x0020_0000)),
            0x3000,
            None,
            PageFlags::KERNEL_RW,
        );
        assert_eq!(result, Err(VmmError::Paging(PagingError::OutOfFrames)));
        assert_eq!(frames.free_frame_count(), 1);
        assert!(!vmm.is_mapped(VirtualAddress::new(0xC040_0000)));
    }

    #[test]
    fn user_mappings_start_at_the_zone_base() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        let va = vmm
            .map_memory(&mut frames, &mut tables, None, 4096, None, PageFlags::USER_RW)
            .unwrap();
        assert_eq!(va, VirtualAddress::new(0x0000_1000));
        let entry = vmm
            .paging()
            .entry(vmm.active(), va.page())
            .unwrap();
        assert!(entry.user());
        assert!(entry.writable());
    }

    #[test]
    fn free_range_skips_mapped_pages() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, vmm) = boot(&mut bitmap);

        vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0x0000_3000)),
            4096,
            None,
            PageFlags::USER_RW,
        )
        .unwrap();
        let va = vmm
            .map_memory(&mut frames, &mut tables, None, 0x3000, None, PageFlags::USER_RW)
            .unwrap();
        assert_eq!(va, VirtualAddress::new(0x0000_4000));
        let small = vmm
            .map_memory(&mut frames, &mut tables, None, 0x2000, None, PageFlags::USER_RW)
            .unwrap();
        assert_eq!(small, VirtualAddress::new(0x0000_1000));
    }

    #[test]
    fn copies_are_independent() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (machine, mut frames, mut tables, mut vmm) = boot(&mut bitmap);

        let space = vmm.create_address_space(&mut tables).unwrap();
        vmm.switch_page_directory(space).unwrap();
        vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0x0040_0000)),
            4096,
            None,
            PageFlags::USER_RW,
        )
        .unwrap();
        write(machine, 0x0040_0010, 0xAAAA_AAAA);

        let copy = vmm.copy_page_directory(&mut frames, &mut tables, space).unwrap();
        let kernel_slot = DirectoryIndex::from(VirtualAddress::new(0xC010_0000));
        assert_eq!(
            vmm.paging().table_of(copy, kernel_slot),
            vmm.paging().table_of(vmm.kernel_space(), kernel_slot)
        );

        vmm.switch_page_directory(copy).unwrap();
        assert_eq!(read(machine, 0x0040_0010), 0xAAAA_AAAA);
        write(machine, 0x0040_0010, 0xBBBB_BBBB);

        vmm.switch_page_directory(space).unwrap();
        assert_eq!(read(machine, 0x0040_0010), 0xAAAA_AAAA);
        assert_ne!(
            vmm.paging().virtual_to_physical(space, VirtualAddress::new(0x0040_0000)),
            vmm.paging().virtual_to_physical(copy, VirtualAddress::new(0x0040_0000))
        );

        // The kernel space never saw the user page.
        vmm.switch_page_directory(vmm.kernel_space()).unwrap();
        assert!(!vmm.is_mapped(VirtualAddress::new(0x0040_0000)));
    }

    #[test]
    fn failed_copy_releases_its_frames() {
        let mut bitmap = vec![0u32; BITMAP_WORDS];
        let (_, mut frames, mut tables, mut vmm) = boot(&mut bitmap);

        let space = vmm.create_address_space(&mut tables).unwrap();
        vmm.switch_page_directory(space).unwrap();
        vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(VirtualAddress::new(0x0040_0000)),
            0x4000,
            None,
            PageFlags::USER_RW,
        )
        .unwrap();

        while frames.free_frame_count() > 2 {
            frames.alloc_frame().unwrap();
        }
        let err = vmm.copy_page_directory(&mut frames, &mut tables, space);
        assert_eq!(err, Err(VmmError::OutOfFrames));
        assert_eq!(frames.free_frame_count(), 2);
    }
}
