//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame over the whole 4 GiB physical range. A set bit
//! means the frame is unavailable (reserved, absent, or allocated).
//!
//! ```text
//! frame i  →  word i / 32, bit i % 32
//! ```
//!
//! The bitmap itself is borrowed, the kernel carves it out of the placement
//! buffer so that it is physically contiguous.

use crate::region::{RegionError, RegionList, sanitize};
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;
use log::{debug, info};

/// Bytes per frame.
pub const FRAME_SIZE: u32 = 4096;

/// Frames in the 32-bit physical address space.
pub const TOTAL_FRAMES: u32 = 1 << 20;

/// `u32` words needed for the bitmap.
pub const BITMAP_WORDS: usize = (TOTAL_FRAMES / 32) as usize;

/// Size of the bitmap in bytes (128 KiB).
pub const BITMAP_BYTES: u32 = TOTAL_FRAMES / 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmmError {
    #[error("frame bitmap holds {actual} words, {required} required")]
    BitmapTooSmall { required: usize, actual: usize },
    #[error(transparent)]
    Regions(#[from] RegionError),
}

/// Frame index of `pa`.
#[inline]
#[must_use]
pub const fn address_to_index(pa: PhysicalAddress) -> u32 {
    pa.as_u32() / FRAME_SIZE
}

/// Base address of frame `index`.
#[inline]
#[must_use]
pub const fn index_to_address(index: u32) -> PhysicalAddress {
    PhysicalAddress::new(index * FRAME_SIZE)
}

/// Bitmap frame allocator covering 2^20 frames.
pub struct BitmapFrameAllocator<'a> {
    bitmap: &'a mut [u32],
    regions: RegionList,
    total_memory: u64,
    used_frames: u32,
}

impl<'a> BitmapFrameAllocator<'a> {
    /// Initialize from a boot memory map.
    ///
    /// Every frame starts out unavailable; frames lying wholly inside an
    /// available region are then released. Frame 0 always stays reserved so
    /// that a zero frame address never names allocated memory.
    ///
    /// # Errors
    /// - [`PmmError::BitmapTooSmall`] if `bitmap` has fewer than [`BITMAP_WORDS`] words.
    /// - [`PmmError::Regions`] if the memory map cannot be sanitized.
    pub fn new(bitmap: &'a mut [u32], memory_map: &[MemoryRegion]) -> Result<Self, PmmError> {
        if bitmap.len() < BITMAP_WORDS {
            return Err(PmmError::BitmapTooSmall {
                required: BITMAP_WORDS,
                actual: bitmap.len(),
            });
        }
        let regions = sanitize(memory_map)?;

        bitmap[..BITMAP_WORDS].fill(u32::MAX);
        let mut pmm = Self {
            bitmap,
            regions,
            total_memory: 0,
            used_frames: TOTAL_FRAMES,
        };

        for region in pmm.regions.clone() {
            if !region.kind.is_available() {
                continue;
            }
            pmm.total_memory += region.length;
            let first = region.base.div_ceil(u64::from(FRAME_SIZE));
            let last = region.end() / u64::from(FRAME_SIZE);
            #[allow(clippy::cast_possible_truncation)]
            for index in first..last {
                pmm.clear(index as u32);
            }
        }
        pmm.set(0);

        info!(
            "pmm: {} KiB usable, {} frames free",
            pmm.total_memory / 1024,
            pmm.free_frame_count()
        );
        Ok(pmm)
    }

    /// First free frame, marked used.
    pub fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        let (word_index, word) = self
            .bitmap
            .iter()
            .take(BITMAP_WORDS)
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)?;
        #[allow(clippy::cast_possible_truncation)]
        let index = word_index as u32 * 32 + word.trailing_ones();
        self.set(index);
        Some(PhysicalPage::from_index(index))
    }

    /// First run of `count` free frames, all marked used.
    pub fn alloc_frames(&mut self, count: u32) -> Option<PhysicalPage<Size4K>> {
        if count == 0 || count > self.free_frame_count() {
            return None;
        }

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut index = 0u32;
        while index < TOTAL_FRAMES {
            let word = self.bitmap[(index / 32) as usize];
            if index % 32 == 0 && word == u32::MAX {
                run_len = 0;
                index += 32;
                continue;
            }
            if self.test(index) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.set(i);
                    }
                    debug!("pmm: {count} frames at {}", index_to_address(run_start));
                    return Some(PhysicalPage::from_index(run_start));
                }
            }
            index += 1;
        }
        None
    }

    /// Release one frame. Releasing a free frame is not detected.
    pub fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.clear(frame.index());
    }

    /// Release `count` frames starting at `frame`.
    pub fn free_frames(&mut self, frame: PhysicalPage<Size4K>, count: u32) {
        let first = frame.index();
        for index in first..first.saturating_add(count).min(TOTAL_FRAMES) {
            self.clear(index);
        }
    }

    pub fn mark_frame_reserved(&mut self, frame: PhysicalPage<Size4K>) {
        self.set(frame.index());
    }

    pub fn mark_frame_available(&mut self, frame: PhysicalPage<Size4K>) {
        self.clear(frame.index());
    }

    /// Reserve every frame touching `[base, base + length)`.
    pub fn mark_region_reserved(&mut self, base: PhysicalAddress, length: u64) {
        let first = base.as_u64() / u64::from(FRAME_SIZE);
        let last = (base.as_u64() + length)
            .div_ceil(u64::from(FRAME_SIZE))
            .min(u64::from(TOTAL_FRAMES));
        #[allow(clippy::cast_possible_truncation)]
        for index in first..last {
            self.set(index as u32);
        }
    }

    /// Release every frame lying wholly inside `[base, base + length)`.
    pub fn mark_region_available(&mut self, base: PhysicalAddress, length: u64) {
        let first = base.as_u64().div_ceil(u64::from(FRAME_SIZE));
        let last = ((base.as_u64() + length) / u64::from(FRAME_SIZE)).min(u64::from(TOTAL_FRAMES));
        #[allow(clippy::cast_possible_truncation)]
        for index in first..last {
            self.clear(index as u32);
        }
    }

    #[must_use]
    pub fn is_frame_used(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.test(frame.index())
    }

    /// Bytes of RAM reported available by the memory map.
    #[must_use]
    pub const fn total_memory_size(&self) -> u64 {
        self.total_memory
    }

    /// Bytes in free frames.
    #[must_use]
    pub const fn available_memory_size(&self) -> u64 {
        self.free_frame_count() as u64 * FRAME_SIZE as u64
    }

    #[must_use]
    pub const fn free_frame_count(&self) -> u32 {
        TOTAL_FRAMES - self.used_frames
    }

    /// The sanitized memory map.
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    #[inline]
    fn test(&self, index: u32) -> bool {
        self.bitmap[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    #[inline]
    fn set(&mut self, index: u32) {
        let word = &mut self.bitmap[(index / 32) as usize];
        let bit = 1 << (index % 32);
        if *word & bit == 0 {
            *word |= bit;
            self.used_frames += 1;
        }
    }

    #[inline]
    fn clear(&mut self, index: u32) {
        let word = &mut self.bitmap[(index / 32) as usize];
        let bit = 1 << (index % 32);
        if *word & bit != 0 {
            *word &= !bit;
            self.used_frames -= 1;
        }
    }
}

impl FrameAlloc for BitmapFrameAllocator<'_> {
    fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        Self::alloc_frame(self)
    }

    fn reserve_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.mark_frame_reserved(frame);
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        Self::free_frame(self, frame);
    }
}
