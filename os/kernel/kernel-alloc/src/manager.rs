//! # Memory bootstrap
//!
//! [`MemoryManager`] owns every allocator and brings them up in a fixed
//! order, one [`BootPhase`] at a time:
//!
//! ```text
//!  Placement ──init_physical──► PhysicalMemory ──init_virtual──► VirtualMemory ──init_heap──► Heap
//!  bump buffer only             + frame bitmap                   + paging on                 + kmalloc
//! ```
//!
//! Calls that need a later phase fail with [`MemoryError::WrongPhase`].
//! The `kmalloc` family is served by the placement buffer until the heap
//! exists; placement memory is never given back.

use crate::frame_alloc::{BITMAP_BYTES, BITMAP_WORDS, BitmapFrameAllocator, PmmError};
use crate::kheap::{GRANULE, HeapError, KernelHeap};
use crate::placement::PlacementAllocator;
use crate::vmm::{Vmm, VmmError};
use kernel_info::boot::{KernelImage, MemoryRegion};
use kernel_info::memory::{
    KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, LOWER_MEMORY_SIZE, PAGE_SIZE, PLACEMENT_MEMORY_SIZE,
    VGA_MEMORY_BASE, VGA_MEMORY_SIZE, VIDEO_BIOS_BASE, VIDEO_BIOS_SIZE,
    bootstrap_virtual_to_physical,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageFlags, TableAlloc, VirtMapper};
use log::{info, warn};

/// Bring-up state. Only ever moves forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BootPhase {
    /// Only the placement buffer exists.
    Placement,
    /// The frame bitmap is live.
    PhysicalMemory,
    /// Paging is enabled on the kernel address space.
    VirtualMemory,
    /// The kernel heap serves the `kmalloc` family.
    Heap,
}

/// Which allocator ran dry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exhaustion {
    Placement,
    Heap,
    Frames,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("operation needs phase {expected:?}, memory is in {actual:?}")]
    WrongPhase {
        expected: BootPhase,
        actual: BootPhase,
    },
    #[error("placement buffer exhausted")]
    PlacementExhausted,
    #[error("placement buffer at {0} does not follow the kernel image")]
    PlacementOutsideImage(VirtualAddress),
    #[error(transparent)]
    Pmm(#[from] PmmError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// Where the kernel, the placement buffer and the heap live.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    pub kernel: KernelImage,
    pub placement_base: VirtualAddress,
    pub placement_size: u32,
    pub heap_base: VirtualAddress,
    pub heap_size: u32,
}

impl MemoryLayout {
    /// The default layout: placement buffer on the first page after the
    /// image, heap at [`KERNEL_HEAP_BASE`].
    #[must_use]
    pub const fn standard(kernel: KernelImage) -> Self {
        let end = kernel.virtual_end.as_u32();
        Self {
            kernel,
            placement_base: VirtualAddress::new((end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)),
            placement_size: PLACEMENT_MEMORY_SIZE,
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            heap_size: KERNEL_HEAP_SIZE,
        }
    }
}

/// All memory allocators of the kernel plus their bring-up state.
pub struct MemoryManager<M: VirtMapper + Copy, U: Mmu + Copy> {
    phase: BootPhase,
    mapper: M,
    mmu: U,
    placement: PlacementAllocator,
    pmm: Option<BitmapFrameAllocator<'static>>,
    vmm: Option<Vmm<M, U>>,
    heap: Option<KernelHeap<M>>,
    on_exhaustion: Option<fn(Exhaustion)>,
}

impl<M: VirtMapper + Copy, U: Mmu + Copy> MemoryManager<M, U> {
    /// A manager in [`BootPhase::Placement`] over the given buffer.
    ///
    /// The buffer must be reachable through `mapper` right away.
    pub const fn new(mapper: M, mmu: U, placement_base: VirtualAddress, placement_size: u32) -> Self {
        Self {
            phase: BootPhase::Placement,
            mapper,
            mmu,
            placement: PlacementAllocator::init(placement_base, placement_size),
            pmm: None,
            vmm: None,
            heap: None,
            on_exhaustion: None,
        }
    }

    /// A manager over the placement buffer of `layout`.
    pub const fn with_layout(mapper: M, mmu: U, layout: &MemoryLayout) -> Self {
        Self::new(mapper, mmu, layout.placement_base, layout.placement_size)
    }

    /// Run every phase.
    ///
    /// # Errors
    /// The first error of [`init_physical`](Self::init_physical),
    /// [`init_virtual`](Self::init_virtual) or [`init_heap`](Self::init_heap).
    pub fn init(
        &mut self,
        memory_map: &[MemoryRegion],
        layout: &MemoryLayout,
    ) -> Result<(), MemoryError> {
        self.init_physical(memory_map, &layout.kernel)?;
        self.init_virtual(&layout.kernel)?;
        self.init_heap(layout.heap_base, layout.heap_size)
    }

    /// Build the frame bitmap in the placement buffer and take everything
    /// the kernel already occupies out of circulation: the first MiB
    /// (VGA memory and video BIOS included), the kernel image, and the
    /// placement buffer holding the bitmap.
    ///
    /// # Errors
    /// - [`MemoryError::WrongPhase`] outside [`BootPhase::Placement`].
    /// - [`MemoryError::PlacementExhausted`] if the bitmap does not fit.
    /// - [`MemoryError::Pmm`] for an unusable memory map.
    pub fn init_physical(
        &mut self,
        memory_map: &[MemoryRegion],
        kernel: &KernelImage,
    ) -> Result<(), MemoryError> {
        self.require(BootPhase::Placement)?;

        let Some(storage) = self.placement.malloc(BITMAP_BYTES, PAGE_SIZE) else {
            self.notify(Exhaustion::Placement);
            return Err(MemoryError::PlacementExhausted);
        };
        // The placement buffer is never reused, the bitmap lives forever.
        let bitmap: &'static mut [u32] =
            unsafe { self.mapper.virt_to_slice_mut(storage, BITMAP_WORDS) };
        let mut pmm = BitmapFrameAllocator::new(bitmap, memory_map)?;

        pmm.mark_region_reserved(PhysicalAddress::new(0), u64::from(LOWER_MEMORY_SIZE));
        pmm.mark_region_reserved(
            PhysicalAddress::new(VGA_MEMORY_BASE),
            u64::from(VGA_MEMORY_SIZE),
        );
        pmm.mark_region_reserved(
            PhysicalAddress::new(VIDEO_BIOS_BASE),
            u64::from(VIDEO_BIOS_SIZE),
        );
        pmm.mark_region_reserved(kernel.physical_start, u64::from(kernel.size()));
        pmm.mark_region_reserved(
            bootstrap_virtual_to_physical(storage),
            u64::from(BITMAP_BYTES),
        );
        pmm.mark_region_reserved(
            bootstrap_virtual_to_physical(self.placement.base()),
            u64::from(self.placement.capacity()),
        );

        info!(
            "memory: physical memory up, {} KiB total, {} KiB free",
            pmm.total_memory_size() / 1024,
            pmm.available_memory_size() / 1024
        );
        self.pmm = Some(pmm);
        self.phase = BootPhase::PhysicalMemory;
        Ok(())
    }

    /// Build the kernel address space and enable paging.
    ///
    /// The placement buffer is mapped along with the image, so it must sit
    /// behind the image at the same physical offset.
    ///
    /// # Errors
    /// - [`MemoryError::WrongPhase`] outside [`BootPhase::PhysicalMemory`].
    /// - [`MemoryError::PlacementOutsideImage`] for a misplaced buffer.
    /// - [`MemoryError::Vmm`] if the tables cannot be built.
    pub fn init_virtual(&mut self, kernel: &KernelImage) -> Result<(), MemoryError> {
        self.require(BootPhase::PhysicalMemory)?;
        let image = self.image_with_placement(kernel)?;
        let error = self.wrong_phase(BootPhase::PhysicalMemory);

        let Self {
            mapper,
            mmu,
            placement,
            pmm,
            on_exhaustion,
            ..
        } = self;
        let Some(pmm) = pmm.as_mut() else {
            return Err(error);
        };
        let mut frames = Frames {
            pmm,
            on_exhaustion: *on_exhaustion,
        };
        let mut tables = TableSource {
            mapper: *mapper,
            placement,
            heap: None,
            on_exhaustion: *on_exhaustion,
        };

        let vmm = Vmm::init(*mapper, *mmu, &mut frames, &mut tables, &image)?;
        info!("memory: paging enabled, {} KiB placement left", placement.remaining() / 1024);
        self.vmm = Some(vmm);
        self.phase = BootPhase::VirtualMemory;
        Ok(())
    }

    /// Map `[base, base + size)` and hand it to the kernel heap.
    ///
    /// # Errors
    /// - [`MemoryError::WrongPhase`] outside [`BootPhase::VirtualMemory`].
    /// - [`MemoryError::Vmm`] if the region cannot be mapped.
    /// - [`MemoryError::Heap`] if the region is unusable; it is unmapped again.
    pub fn init_heap(&mut self, base: VirtualAddress, size: u32) -> Result<(), MemoryError> {
        self.require(BootPhase::VirtualMemory)?;
        let mapper = self.mapper;
        let (vmm, mut frames, mut tables) = self.parts()?;

        vmm.map_memory(
            &mut frames,
            &mut tables,
            Some(base),
            size,
            None,
            PageFlags::KERNEL_RW,
        )?;
        let heap = match KernelHeap::init(mapper, base, size) {
            Ok(heap) => heap,
            Err(e) => {
                vmm.unmap_memory(&mut frames, base, size);
                return Err(e.into());
            }
        };

        self.heap = Some(heap);
        self.phase = BootPhase::Heap;
        info!("memory: kernel heap online, {} KiB at {base}", size / 1024);
        Ok(())
    }

    #[must_use]
    pub const fn phase(&self) -> BootPhase {
        self.phase
    }

    /// Install the policy for exhausted allocators, such as a kernel panic.
    ///
    /// The handler runs before the failing call returns its sentinel.
    pub fn set_exhaustion_handler(&mut self, handler: fn(Exhaustion)) {
        self.on_exhaustion = Some(handler);
    }

    /// `size` bytes, 16-byte aligned.
    pub fn kmalloc(&mut self, size: u32) -> Option<VirtualAddress> {
        let (ptr, source) = match self.heap.as_mut() {
            Some(heap) => (heap.kmalloc(size), Exhaustion::Heap),
            None => (self.placement.malloc(size, GRANULE), Exhaustion::Placement),
        };
        self.checked(ptr, size, source)
    }

    /// `size` bytes on a page boundary.
    pub fn kmalloc_a(&mut self, size: u32) -> Option<VirtualAddress> {
        let (ptr, source) = match self.heap.as_mut() {
            Some(heap) => (heap.kmalloc_a(size), Exhaustion::Heap),
            None => (self.placement.malloc(size, PAGE_SIZE), Exhaustion::Placement),
        };
        self.checked(ptr, size, source)
    }

    /// `count * size` zeroed bytes.
    pub fn kcalloc(&mut self, count: u32, size: u32) -> Option<VirtualAddress> {
        let total = count.checked_mul(size)?;
        let (ptr, source) = match self.heap.as_mut() {
            Some(heap) => (heap.kcalloc(count, size), Exhaustion::Heap),
            None => {
                let ptr = self.placement.malloc(total, GRANULE);
                if let Some(ptr) = ptr {
                    zero(self.mapper, ptr, total);
                }
                (ptr, Exhaustion::Placement)
            }
        };
        self.checked(ptr, total, source)
    }

    /// Return heap memory.
    ///
    /// Placement memory is accepted and ignored.
    ///
    /// # Errors
    /// - [`MemoryError::WrongPhase`] before the heap exists.
    /// - [`MemoryError::Heap`] for pointers the heap rejects.
    pub fn kfree(&mut self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        if self.placement.contains(ptr) {
            warn!("memory: ignoring free of placement memory at {ptr}");
            return Ok(());
        }
        let heap = self.heap_mut()?;
        Ok(heap.kfree(ptr)?)
    }

    /// Resize heap memory, see [`KernelHeap::krealloc`].
    ///
    /// # Errors
    /// - [`MemoryError::WrongPhase`] before the heap exists.
    /// - [`MemoryError::Heap`] for invalid pointers or exhaustion.
    pub fn krealloc(
        &mut self,
        ptr: Option<VirtualAddress>,
        size: u32,
    ) -> Result<Option<VirtualAddress>, MemoryError> {
        let result = self.heap_mut()?.krealloc(ptr, size);
        if result == Err(HeapError::OutOfMemory) {
            self.notify(Exhaustion::Heap);
        }
        Ok(result?)
    }

    /// Map memory in the active address space, see [`Vmm::map_memory`].
    ///
    /// # Errors
    /// [`MemoryError::WrongPhase`] before paging, otherwise [`MemoryError::Vmm`].
    pub fn map_memory(
        &mut self,
        va: Option<VirtualAddress>,
        size: u32,
        pa: Option<PhysicalAddress>,
        flags: PageFlags,
    ) -> Result<VirtualAddress, MemoryError> {
        let (vmm, mut frames, mut tables) = self.parts()?;
        Ok(vmm.map_memory(&mut frames, &mut tables, va, size, pa, flags)?)
    }

    /// Unmap memory in the active address space; returns the page count.
    ///
    /// # Errors
    /// [`MemoryError::WrongPhase`] before paging.
    pub fn unmap_memory(&mut self, va: VirtualAddress, size: u32) -> Result<usize, MemoryError> {
        let (vmm, mut frames, _) = self.parts()?;
        Ok(vmm.unmap_memory(&mut frames, va, size))
    }

    /// A fresh address space sharing the kernel zone.
    ///
    /// # Errors
    /// [`MemoryError::WrongPhase`] before paging, otherwise [`MemoryError::Vmm`].
    pub fn create_address_space(&mut self) -> Result<AddressSpace, MemoryError> {
        let (vmm, _, mut tables) = self.parts()?;
        Ok(vmm.create_address_space(&mut tables)?)
    }

    /// Clone `src`, see [`Vmm::copy_page_directory`].
    ///
    /// # Errors
    /// [`MemoryError::WrongPhase`] before paging, otherwise [`MemoryError::Vmm`].
    pub fn copy_page_directory(&mut self, src: AddressSpace) -> Result<AddressSpace, MemoryError> {
        let (vmm, mut frames, mut tables) = self.parts()?;
        Ok(vmm.copy_page_directory(&mut frames, &mut tables, src)?)
    }

    /// Load `space` into CR3.
    ///
    /// # Errors
    /// [`MemoryError::WrongPhase`] before paging, otherwise [`MemoryError::Vmm`].
    pub fn switch_page_directory(&mut self, space: AddressSpace) -> Result<(), MemoryError> {
        let actual = self.phase;
        let vmm = self.vmm.as_mut().ok_or(MemoryError::WrongPhase {
            expected: BootPhase::VirtualMemory,
            actual,
        })?;
        Ok(vmm.switch_page_directory(space)?)
    }

    /// Whether `va` is mapped in the active address space. Always `false`
    /// before paging.
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.vmm.as_ref().is_some_and(|vmm| vmm.is_mapped(va))
    }

    /// Physical address behind `va`; the bootstrap rule before paging.
    #[must_use]
    pub fn get_mapped_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match &self.vmm {
            Some(vmm) => vmm.get_mapped_address(va),
            None => Some(bootstrap_virtual_to_physical(va)),
        }
    }

    /// One physical frame.
    pub fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        let on_exhaustion = self.on_exhaustion;
        let pmm = self.pmm.as_mut()?;
        Frames { pmm, on_exhaustion }.alloc_frame()
    }

    /// Return a frame from [`alloc_frame`](Self::alloc_frame).
    pub fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        if let Some(pmm) = self.pmm.as_mut() {
            pmm.free_frame(frame);
        }
    }

    #[must_use]
    pub const fn placement(&self) -> &PlacementAllocator {
        &self.placement
    }

    #[must_use]
    pub const fn pmm(&self) -> Option<&BitmapFrameAllocator<'static>> {
        self.pmm.as_ref()
    }

    #[must_use]
    pub const fn vmm(&self) -> Option<&Vmm<M, U>> {
        self.vmm.as_ref()
    }

    #[must_use]
    pub const fn heap(&self) -> Option<&KernelHeap<M>> {
        self.heap.as_ref()
    }

    #[must_use]
    pub const fn mapper(&self) -> M {
        self.mapper
    }

    fn require(&self, expected: BootPhase) -> Result<(), MemoryError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(self.wrong_phase(expected))
        }
    }

    const fn wrong_phase(&self, expected: BootPhase) -> MemoryError {
        MemoryError::WrongPhase {
            expected,
            actual: self.phase,
        }
    }

    fn heap_mut(&mut self) -> Result<&mut KernelHeap<M>, MemoryError> {
        let error = self.wrong_phase(BootPhase::Heap);
        self.heap.as_mut().ok_or(error)
    }

    /// The VMM together with frame and table sources borrowed from `self`.
    fn parts(&mut self) -> Result<(&Vmm<M, U>, Frames<'_>, TableSource<'_, M>), MemoryError> {
        let error = self.wrong_phase(BootPhase::VirtualMemory);
        let Self {
            mapper,
            placement,
            pmm,
            vmm,
            heap,
            on_exhaustion,
            ..
        } = self;
        let (Some(vmm), Some(pmm)) = (vmm.as_ref(), pmm.as_mut()) else {
            return Err(error);
        };
        let frames = Frames {
            pmm,
            on_exhaustion: *on_exhaustion,
        };
        let tables = TableSource {
            mapper: *mapper,
            placement,
            heap: heap.as_mut(),
            on_exhaustion: *on_exhaustion,
        };
        Ok((vmm, frames, tables))
    }

    /// Kernel image extended to the end of the placement buffer.
    fn image_with_placement(&self, kernel: &KernelImage) -> Result<KernelImage, MemoryError> {
        let base = self.placement.base();
        let offset = base.as_u32().wrapping_sub(bootstrap_virtual_to_physical(base).as_u32());
        if offset != kernel.virtual_offset() || base.as_u32() < kernel.virtual_start.as_u32() {
            return Err(MemoryError::PlacementOutsideImage(base));
        }
        let end = self.placement.end().max(kernel.virtual_end.as_u64());
        #[allow(clippy::cast_possible_truncation)]
        let size = (end - kernel.virtual_start.as_u64()) as u32;
        Ok(KernelImage::new(
            kernel.physical_start,
            kernel.virtual_start,
            size,
        ))
    }

    fn checked(&self, ptr: Option<VirtualAddress>, size: u32, source: Exhaustion) -> Option<VirtualAddress> {
        if ptr.is_none() && size != 0 {
            self.notify(source);
        }
        ptr
    }

    fn notify(&self, what: Exhaustion) {
        notify(self.on_exhaustion, what);
    }
}

fn notify(handler: Option<fn(Exhaustion)>, what: Exhaustion) {
    warn!("memory: {what:?} exhausted");
    if let Some(handler) = handler {
        handler(what);
    }
}

/// Zero `len` bytes at `va`, one page at a time.
fn zero<M: VirtMapper>(mapper: M, va: VirtualAddress, len: u32) {
    let mut done = 0;
    while done < len {
        let at = va + done;
        let chunk = (len - done).min(PAGE_SIZE - at.offset::<Size4K>().as_u32());
        unsafe { mapper.virt_to_slice_mut::<u8>(at, chunk as usize) }.fill(0);
        done += chunk;
    }
}

/// The frame allocator as seen by paging, reporting exhaustion.
struct Frames<'a> {
    pmm: &'a mut BitmapFrameAllocator<'static>,
    on_exhaustion: Option<fn(Exhaustion)>,
}

impl FrameAlloc for Frames<'_> {
    fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.pmm.alloc_frame();
        if frame.is_none() {
            notify(self.on_exhaustion, Exhaustion::Frames);
        }
        frame
    }

    fn reserve_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.pmm.mark_frame_reserved(frame);
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.pmm.free_frame(frame);
    }
}

/// Zeroed page tables from the placement buffer, or from the heap once it
/// exists.
struct TableSource<'a, M: VirtMapper> {
    mapper: M,
    placement: &'a mut PlacementAllocator,
    heap: Option<&'a mut KernelHeap<M>>,
    on_exhaustion: Option<fn(Exhaustion)>,
}

impl<M: VirtMapper + Copy> TableAlloc for TableSource<'_, M> {
    fn alloc_table(&mut self) -> Option<VirtualPage<Size4K>> {
        let (page, source) = match self.heap.as_deref_mut() {
            Some(heap) => (heap.kmalloc_a(PAGE_SIZE), Exhaustion::Heap),
            None => (
                self.placement.malloc(PAGE_SIZE, PAGE_SIZE),
                Exhaustion::Placement,
            ),
        };
        let Some(page) = page else {
            notify(self.on_exhaustion, source);
            return None;
        };
        zero(self.mapper, page, PAGE_SIZE);
        Some(page.page())
    }
}
