//! # Placement Allocator
//!
//! A bump allocator over a fixed buffer, used before the heap exists. It
//! hands out memory for the frame bitmap, the kernel page directory and early
//! page tables. Nothing it hands out is ever returned.

use kernel_memory_addresses::VirtualAddress;

/// Monotonic cursor over `[base, base + capacity)`.
#[derive(Debug, Clone)]
pub struct PlacementAllocator {
    base: VirtualAddress,
    head: u64,
    capacity: u32,
}

impl PlacementAllocator {
    /// Fix the buffer; the cursor starts at `base`.
    #[must_use]
    pub const fn init(base: VirtualAddress, capacity: u32) -> Self {
        Self {
            base,
            head: base.as_u64(),
            capacity,
        }
    }

    /// Reserve `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two; 0 and 1 mean "no alignment". Returns
    /// `None` for `size == 0` or when the aligned block does not fit into the
    /// rest of the buffer; the cursor is unchanged in that case.
    pub fn malloc(&mut self, size: u32, align: u32) -> Option<VirtualAddress> {
        if size == 0 {
            return None;
        }
        debug_assert!(align <= 1 || align.is_power_of_two());

        let align = u64::from(align.max(1));
        let start = self.head.checked_add(align - 1)? & !(align - 1);
        let end = start.checked_add(u64::from(size))?;
        if end > self.end_u64() {
            log::debug!("placement buffer exhausted: {size} bytes, {} left", self.remaining());
            return None;
        }

        self.head = end;
        #[allow(clippy::cast_possible_truncation)]
        Some(VirtualAddress::new(start as u32))
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Exclusive end of the buffer, which may be `2^32`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end_u64()
    }

    /// Bytes handed out so far, alignment padding included.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn used(&self) -> u32 {
        (self.head - self.base.as_u64()) as u32
    }

    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.capacity - self.used()
    }

    /// Whether `va` lies inside the buffer.
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end_u64()
    }

    const fn end_u64(&self) -> u64 {
        self.base.as_u64() + self.capacity as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> PlacementAllocator {
        PlacementAllocator::init(VirtualAddress::new(0xC030_0000), 0x1_0000)
    }

    #[test]
    fn bumps_and_aligns() {
        let mut p = buffer();
        assert_eq!(p.malloc(10, 0), Some(VirtualAddress::new(0xC030_0000)));
        assert_eq!(p.malloc(4, 4), Some(VirtualAddress::new(0xC030_000C)));
        assert_eq!(p.malloc(4096, 4096), Some(VirtualAddress::new(0xC030_1000)));
        assert_eq!(p.used(), 0x2000);
        assert!(p.contains(VirtualAddress::new(0xC030_1FFF)));
        assert!(!p.contains(VirtualAddress::new(0xC031_0000)));
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut p = buffer();
        assert_eq!(p.malloc(0, 16), None);
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn bounds_are_checked_after_alignment() {
        let mut p = buffer();
        p.malloc(0xF001, 0).unwrap();
        // 0xFFF bytes remain, but aligning to the next page leaves nothing.
        assert_eq!(p.remaining(), 0xFFF);
        assert_eq!(p.malloc(16, 4096), None);
        assert_eq!(p.remaining(), 0xFFF);
        assert!(p.malloc(0xFFF, 1).is_some());
        assert_eq!(p.malloc(1, 1), None);
    }

    #[test]
    fn exact_fit_at_top_of_address_space() {
        let mut p = PlacementAllocator::init(VirtualAddress::new(0xFFFF_F000), 0x1000);
        assert_eq!(p.malloc(0x1000, 4096), Some(VirtualAddress::new(0xFFFF_F000)));
        assert_eq!(p.end(), 1 << 32);
        assert_eq!(p.malloc(1, 1), None);
    }
}
