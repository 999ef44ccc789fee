//! # Kernel Heap
//!
//! Variable-size blocks inside one fixed, already mapped virtual region.
//!
//! ```text
//!  base                                                     base + size
//!  ┌────────┬──────────┬────────┬──────────────┬────────┬──────┐
//!  │ header │ payload  │ header │ payload      │ header │ ...  │
//!  └────────┴──────────┴────────┴──────────────┴────────┴──────┘
//!     16 B    size B      16 B
//! ```
//!
//! Blocks tile the region in address order and are doubly linked through
//! their headers. Allocation is best fit, blocks split when the rest can
//! hold another header and payload, and a freed block merges with free
//! neighbours right away, so no two neighbours are ever both free.
//!
//! Headers are only ever copied in and out through the [`VirtMapper`]; the
//! heap never holds a reference into its own region.

use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::VirtMapper;
use log::{debug, error, info, warn};

/// Size of a block header.
pub const HEADER_SIZE: u32 = 16;

/// Payload sizes and addresses are multiples of this.
pub const GRANULE: u32 = 16;

/// `"HK"`; any other value in a header means corruption.
const MAGIC: u16 = 0x4B48;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("{0} is not a heap pointer")]
    OutOfRange(VirtualAddress),
    #[error("corrupted block header at {0}")]
    Corrupted(VirtualAddress),
    #[error("block at {0} is already free")]
    DoubleFree(VirtualAddress),
    #[error("heap region of {size} bytes is too small")]
    RegionTooSmall { size: u32 },
    #[error("heap region at {0} is not 16-byte aligned")]
    Misaligned(VirtualAddress),
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct BlockHeader {
    magic: u16,
    free: u16,
    size: u32,
    prev: u32,
    next: u32,
}

const _: () = {
    assert!(size_of::<BlockHeader>() == HEADER_SIZE as usize);
    assert!(HEADER_SIZE % GRANULE == 0);
    assert!(PAGE_SIZE % GRANULE == 0);
};

impl BlockHeader {
    const fn is_free(&self) -> bool {
        self.free != 0
    }
}

/// Public view of one block, see [`KernelHeap::block_info`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// Start of the payload.
    pub address: VirtualAddress,
    /// Payload bytes.
    pub size: u32,
    pub free: bool,
    pub prev: Option<VirtualAddress>,
    pub next: Option<VirtualAddress>,
}

/// Result of a successful [`KernelHeap::check_integrity`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub largest_free: u32,
}

pub struct KernelHeap<M: VirtMapper> {
    mapper: M,
    base: VirtualAddress,
    size: u32,
}

impl<M: VirtMapper> KernelHeap<M> {
    /// Take over `[base, base + size)` as one free block.
    ///
    /// The region must be mapped writable. `size` is rounded down to the
    /// granule.
    ///
    /// # Errors
    /// - [`HeapError::Misaligned`] if `base` is not 16-byte aligned.
    /// - [`HeapError::RegionTooSmall`] below two headers and one granule.
    pub fn init(mapper: M, base: VirtualAddress, size: u32) -> Result<Self, HeapError> {
        if base.as_u32() % GRANULE != 0 {
            return Err(HeapError::Misaligned(base));
        }
        let size = size / GRANULE * GRANULE;
        if size < 2 * HEADER_SIZE + GRANULE || base.as_u64() + u64::from(size) > 1 << 32 {
            return Err(HeapError::RegionTooSmall { size });
        }

        let heap = Self { mapper, base, size };
        heap.write(
            base,
            BlockHeader {
                magic: MAGIC,
                free: 1,
                size: size - HEADER_SIZE,
                prev: 0,
                next: 0,
            },
        );
        info!("kheap: {} KiB at {base}", size / 1024);
        Ok(heap)
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Whether `va` lies inside the heap region.
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end()
    }

    /// Best-fit allocation of `size` bytes, 16-byte aligned.
    ///
    /// Among all free blocks large enough the smallest wins, the first one
    /// in list order on ties. Returns `None` for `size == 0` or when no
    /// block fits.
    pub fn kmalloc(&mut self, size: u32) -> Option<VirtualAddress> {
        let need = round_up(size)?;
        let (block, _) = self
            .blocks()
            .filter(|(_, h)| h.is_free() && h.size >= need)
            .fold(None, |best: Option<(VirtualAddress, BlockHeader)>, (b, h)| match best {
                Some((_, bh)) if bh.size <= h.size => best,
                _ => Some((b, h)),
            })?;

        self.split(block, need);
        self.set_free(block, false);
        Some(payload(block))
    }

    /// Like [`kmalloc`](Self::kmalloc), with the payload on a page boundary.
    ///
    /// A block fits when its first page-aligned payload address leaves room
    /// for a free padding block in front (a header plus one granule) and
    /// `size` bytes behind. The smallest fitting block is used; the padding
    /// stays free.
    pub fn kmalloc_a(&mut self, size: u32) -> Option<VirtualAddress> {
        let need = round_up(size)?;
        let (block, aligned, _) = self
            .blocks()
            .filter(|(_, h)| h.is_free())
            .filter_map(|(b, h)| {
                let aligned = aligned_payload(b)?;
                let end = payload(b).as_u64() + u64::from(h.size);
                (aligned + u64::from(need) <= end).then_some((b, aligned, h.size))
            })
            .fold(None, |best: Option<(VirtualAddress, u64, u32)>, candidate| match best {
                Some((_, _, size)) if size <= candidate.2 => best,
                _ => Some(candidate),
            })?;

        #[allow(clippy::cast_possible_truncation)]
        let aligned = VirtualAddress::new(aligned as u32);
        let target = if aligned == payload(block) {
            block
        } else {
            self.carve_padding(block, aligned)
        };
        self.split(target, need);
        self.set_free(target, false);
        debug!("kheap: {need} page-aligned bytes at {aligned}");
        Some(aligned)
    }

    /// Release a block and merge it with free neighbours.
    ///
    /// A pointer that does not name a live block is rejected and nothing
    /// changes.
    ///
    /// # Errors
    /// - [`HeapError::OutOfRange`] for pointers outside the heap or off a
    ///   block boundary.
    /// - [`HeapError::Corrupted`] if the header magic is wrong.
    /// - [`HeapError::DoubleFree`] if the block is already free.
    pub fn kfree(&mut self, ptr: VirtualAddress) -> Result<(), HeapError> {
        let block = self.validate(ptr)?;
        let header = self.read(block);
        if header.is_free() {
            warn!("kheap: double free of {ptr}");
            return Err(HeapError::DoubleFree(ptr));
        }

        self.set_free(block, true);
        let block = self.merge_next(block);
        self.merge_prev(block);
        Ok(())
    }

    /// Zeroed allocation of `count * size` bytes.
    pub fn kcalloc(&mut self, count: u32, size: u32) -> Option<VirtualAddress> {
        let total = count.checked_mul(size)?;
        let ptr = self.kmalloc(total)?;
        self.for_each_chunk(ptr, total, |bytes| bytes.fill(0));
        Some(ptr)
    }

    /// Resize an allocation.
    ///
    /// `None` allocates, `size == 0` frees. A block shrinks in place and
    /// grows in place when the next block is free and large enough;
    /// otherwise the contents move to a new block.
    ///
    /// # Errors
    /// - The [`kfree`](Self::kfree) errors for an invalid `ptr`.
    /// - [`HeapError::OutOfMemory`] if no block fits; the original block is
    ///   left untouched.
    pub fn krealloc(
        &mut self,
        ptr: Option<VirtualAddress>,
        size: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let Some(ptr) = ptr else {
            if size == 0 {
                return Ok(None);
            }
            return self.kmalloc(size).map(Some).ok_or(HeapError::OutOfMemory);
        };
        if size == 0 {
            self.kfree(ptr)?;
            return Ok(None);
        }

        let block = self.validate(ptr)?;
        let header = self.read(block);
        if header.is_free() {
            return Err(HeapError::DoubleFree(ptr));
        }
        let need = round_up(size).ok_or(HeapError::OutOfMemory)?;

        if need <= header.size {
            if self.split(block, need) {
                let tail = VirtualAddress::new(self.read(block).next);
                self.merge_next(tail);
            }
            return Ok(Some(ptr));
        }

        if header.next != 0 {
            let next = self.read(VirtualAddress::new(header.next));
            if next.is_free() && header.size + HEADER_SIZE + next.size >= need {
                self.absorb_next(block);
                self.split(block, need);
                return Ok(Some(ptr));
            }
        }

        let moved = self.kmalloc(size).ok_or(HeapError::OutOfMemory)?;
        self.copy(ptr, moved, header.size);
        self.kfree(ptr)?;
        Ok(Some(moved))
    }

    /// Size of the heap region.
    #[must_use]
    pub const fn get_total_memory_size(&self) -> u32 {
        self.size
    }

    /// Sum of all free payloads.
    #[must_use]
    pub fn get_available_memory_size(&self) -> u32 {
        self.blocks()
            .filter(|(_, h)| h.is_free())
            .map(|(_, h)| h.size)
            .sum()
    }

    /// Walk the block list and verify every structural invariant: valid
    /// magic, back links, address order without gaps, no two free
    /// neighbours, and sizes adding up to the region.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first offending header.
    pub fn check_integrity(&self) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats::default();
        let mut block = self.base;
        let mut prev: Option<BlockHeader> = None;
        let mut prev_addr = 0;

        loop {
            let header = self.read(block);
            let end = payload(block).as_u64() + u64::from(header.size);
            if header.magic != MAGIC
                || header.prev != prev_addr
                || header.size % GRANULE != 0
                || end > self.end()
                || prev.is_some_and(|p| p.is_free() && header.is_free())
            {
                error!("kheap: integrity check failed at {block}: {header:?}");
                return Err(HeapError::Corrupted(block));
            }

            stats.blocks += 1;
            if header.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += header.size;
                stats.largest_free = stats.largest_free.max(header.size);
            } else {
                stats.used_bytes += header.size;
            }

            if header.next == 0 {
                if end != self.end() {
                    error!("kheap: block list ends at {end:#X}, region at {:#X}", self.end());
                    return Err(HeapError::Corrupted(block));
                }
                return Ok(stats);
            }
            if u64::from(header.next) != end {
                error!("kheap: gap or overlap after {block}");
                return Err(HeapError::Corrupted(block));
            }

            prev = Some(header);
            prev_addr = block.as_u32();
            block = VirtualAddress::new(header.next);
        }
    }

    /// Header of the block whose payload starts at `ptr`.
    #[must_use]
    pub fn block_info(&self, ptr: VirtualAddress) -> Option<BlockInfo> {
        let block = self.locate(ptr)?;
        let header = self.read(block);
        (header.magic == MAGIC).then(|| BlockInfo {
            address: ptr,
            size: header.size,
            free: header.is_free(),
            prev: link(header.prev).map(payload),
            next: link(header.next).map(payload),
        })
    }

    const fn end(&self) -> u64 {
        self.base.as_u64() + self.size as u64
    }

    /// Header address for `ptr` if it lies on a block boundary in the region.
    fn locate(&self, ptr: VirtualAddress) -> Option<VirtualAddress> {
        let offset = ptr.as_u64().checked_sub(self.base.as_u64() + u64::from(HEADER_SIZE))?;
        (offset % u64::from(GRANULE) == 0 && ptr.as_u64() < self.end())
            .then(|| VirtualAddress::new(ptr.as_u32() - HEADER_SIZE))
    }

    fn validate(&self, ptr: VirtualAddress) -> Result<VirtualAddress, HeapError> {
        let Some(block) = self.locate(ptr) else {
            error!("kheap: rejected foreign pointer {ptr}");
            return Err(HeapError::OutOfRange(ptr));
        };
        let magic = self.read(block).magic;
        if magic != MAGIC {
            error!("kheap: bad magic {magic:#06X} behind {ptr}");
            return Err(HeapError::Corrupted(block));
        }
        Ok(block)
    }

    /// Cut `block` down to `need` payload bytes if the rest can hold a block
    /// of its own. The rest becomes a free block. Returns whether it split.
    fn split(&self, block: VirtualAddress, need: u32) -> bool {
        let mut header = self.read(block);
        if header.size - need <= HEADER_SIZE {
            return false;
        }

        let tail = VirtualAddress::new(payload(block).as_u32() + need);
        self.write(
            tail,
            BlockHeader {
                magic: MAGIC,
                free: 1,
                size: header.size - need - HEADER_SIZE,
                prev: block.as_u32(),
                next: header.next,
            },
        );
        if let Some(next) = link(header.next) {
            self.set_prev(next, tail);
        }
        header.size = need;
        header.next = tail.as_u32();
        self.write(block, header);
        true
    }

    /// Split free `block` so that a new free block starts right below
    /// `aligned`. Returns the new block.
    fn carve_padding(&self, block: VirtualAddress, aligned: VirtualAddress) -> VirtualAddress {
        let mut header = self.read(block);
        let target = VirtualAddress::new(aligned.as_u32() - HEADER_SIZE);
        let padding = target.as_u32() - payload(block).as_u32();

        self.write(
            target,
            BlockHeader {
                magic: MAGIC,
                free: 1,
                size: header.size - padding - HEADER_SIZE,
                prev: block.as_u32(),
                next: header.next,
            },
        );
        if let Some(next) = link(header.next) {
            self.set_prev(next, target);
        }
        header.size = padding;
        header.next = target.as_u32();
        self.write(block, header);
        target
    }

    /// Merge the following block into `block` if it is free. Returns `block`.
    fn merge_next(&self, block: VirtualAddress) -> VirtualAddress {
        let header = self.read(block);
        if let Some(next) = link(header.next) {
            let next_header = self.read(next);
            if next_header.magic == MAGIC && next_header.is_free() {
                self.absorb_next(block);
            }
        }
        block
    }

    /// Merge `block` into the preceding block if that one is free. Returns
    /// the surviving block.
    fn merge_prev(&self, block: VirtualAddress) -> VirtualAddress {
        let header = self.read(block);
        if let Some(prev) = link(header.prev) {
            let prev_header = self.read(prev);
            if prev_header.magic == MAGIC && prev_header.is_free() {
                self.absorb_next(prev);
                return prev;
            }
        }
        block
    }

    /// Unconditionally fold the next block into `block`.
    fn absorb_next(&self, block: VirtualAddress) {
        let mut header = self.read(block);
        let next = VirtualAddress::new(header.next);
        let mut next_header = self.read(next);

        header.size += HEADER_SIZE + next_header.size;
        header.next = next_header.next;
        if let Some(after) = link(next_header.next) {
            self.set_prev(after, block);
        }
        self.write(block, header);

        next_header.magic = 0;
        self.write(next, next_header);
    }

    /// Copy `len` bytes; neither range needs to be physically contiguous.
    fn copy(&self, from: VirtualAddress, to: VirtualAddress, len: u32) {
        let mut done = 0;
        while done < len {
            let src = from + done;
            let dst = to + done;
            let chunk = (len - done)
                .min(page_remaining(src))
                .min(page_remaining(dst));
            unsafe {
                let source: &mut [u8] = self.mapper.virt_to_slice_mut(src, chunk as usize);
                let target: &mut [u8] = self.mapper.virt_to_slice_mut(dst, chunk as usize);
                target.copy_from_slice(source);
            }
            done += chunk;
        }
    }

    /// Run `f` on `[ptr, ptr + len)` one page-bounded chunk at a time.
    fn for_each_chunk(&self, ptr: VirtualAddress, len: u32, mut f: impl FnMut(&mut [u8])) {
        let mut done = 0;
        while done < len {
            let at = ptr + done;
            let chunk = (len - done).min(page_remaining(at));
            f(unsafe { self.mapper.virt_to_slice_mut(at, chunk as usize) });
            done += chunk;
        }
    }

    /// Every block with its header, in list order.
    fn blocks(&self) -> impl Iterator<Item = (VirtualAddress, BlockHeader)> + '_ {
        core::iter::successors(Some(self.base), |block| link(self.read(*block).next))
            .map(|block| (block, self.read(block)))
    }

    fn set_free(&self, block: VirtualAddress, free: bool) {
        let mut header = self.read(block);
        header.free = u16::from(free);
        self.write(block, header);
    }

    fn set_prev(&self, block: VirtualAddress, prev: VirtualAddress) {
        let mut header = self.read(block);
        header.prev = prev.as_u32();
        self.write(block, header);
    }

    fn read(&self, block: VirtualAddress) -> BlockHeader {
        unsafe { *self.mapper.virt_to_mut::<BlockHeader>(block) }
    }

    fn write(&self, block: VirtualAddress, header: BlockHeader) {
        unsafe { *self.mapper.virt_to_mut::<BlockHeader>(block) = header };
    }
}

const fn payload(block: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(block.as_u32() + HEADER_SIZE)
}

const fn link(raw: u32) -> Option<VirtualAddress> {
    if raw == 0 {
        None
    } else {
        Some(VirtualAddress::new(raw))
    }
}

/// `size` rounded up to the granule, `None` for zero or overflow.
const fn round_up(size: u32) -> Option<u32> {
    if size == 0 {
        return None;
    }
    match size.checked_add(GRANULE - 1) {
        Some(s) => Some(s / GRANULE * GRANULE),
        None => None,
    }
}

/// First page-aligned payload address in `block` that leaves room for a
/// padding block in front.
fn aligned_payload(block: VirtualAddress) -> Option<u64> {
    let page = u64::from(PAGE_SIZE);
    let start = payload(block).as_u64();
    let mut aligned = start.next_multiple_of(page);
    if aligned != start && aligned - start < u64::from(HEADER_SIZE + GRANULE) {
        aligned += page;
    }
    (aligned < 1 << 32).then_some(aligned)
}

/// Bytes from `va` to the end of its page.
const fn page_remaining(va: VirtualAddress) -> u32 {
    PAGE_SIZE - va.offset::<Size4K>().as_u32()
}
