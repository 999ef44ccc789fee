//! # Memory map sanitizing
//!
//! Firmware memory maps may be unsorted, overlapping, or reach past 4 GiB.
//! [`sanitize`] turns them into a sorted list of disjoint regions inside the
//! 32-bit physical range, resolving overlaps by [`MemoryRegionKind::precedence`].

use arrayvec::ArrayVec;
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};

/// Upper bound on regions kept after sanitizing.
pub const MAX_REGIONS: usize = 64;

/// End of the physical address range this kernel can reach.
const PHYSICAL_LIMIT: u64 = 1 << 32;

pub type RegionList = ArrayVec<MemoryRegion, MAX_REGIONS>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("memory map needs more than {capacity} regions")]
    TooManyRegions { capacity: usize },
}

/// Sorted, disjoint, clipped copy of `regions`.
///
/// Each elementary interval between region boundaries takes the kind with the
/// highest precedence among the regions covering it; holes stay holes.
/// Neighbouring intervals of the same kind are joined.
///
/// # Errors
/// [`RegionError::TooManyRegions`] if the result does not fit [`MAX_REGIONS`].
pub fn sanitize(regions: &[MemoryRegion]) -> Result<RegionList, RegionError> {
    let mut out = RegionList::new();
    let mut cursor = 0u64;

    loop {
        let next = regions
            .iter()
            .filter(|r| r.length > 0)
            .flat_map(|r| [r.base.min(PHYSICAL_LIMIT), r.end().min(PHYSICAL_LIMIT)])
            .filter(|&b| b > cursor)
            .min();
        let Some(next) = next else {
            break;
        };

        // No boundary lies inside (cursor, next): covering `cursor` means
        // covering the whole interval.
        let kind = regions
            .iter()
            .filter(|r| r.length > 0 && r.base <= cursor && r.end() > cursor)
            .map(|r| r.kind)
            .reduce(|a, b| if b.precedence() > a.precedence() { b } else { a });

        if let Some(kind) = kind {
            push_or_extend(&mut out, cursor, next - cursor, kind)?;
        }
        cursor = next;
    }

    Ok(out)
}

fn push_or_extend(
    out: &mut RegionList,
    base: u64,
    length: u64,
    kind: MemoryRegionKind,
) -> Result<(), RegionError> {
    if let Some(last) = out.last_mut()
        && last.kind == kind
        && last.end() == base
    {
        last.length += length;
        return Ok(());
    }
    out.try_push(MemoryRegion::new(base, length, kind))
        .map_err(|_| RegionError::TooManyRegions {
            capacity: MAX_REGIONS,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_resolves_to_higher_precedence() {
        let map = [
            MemoryRegion::available(0x10_0000, 0x100_0000),
            MemoryRegion::reserved(0x20_0000, 0x1000),
        ];
        let out = sanitize(&map).unwrap();
        assert_eq!(
            out.as_slice(),
            [
                MemoryRegion::available(0x10_0000, 0x10_0000),
                MemoryRegion::reserved(0x20_0000, 0x1000),
                MemoryRegion::available(0x20_1000, 0xEF_F000),
            ]
        );
    }

    #[test]
    fn unsorted_adjacent_regions_merge() {
        let map = [
            MemoryRegion::available(0x20_0000, 0x10_0000),
            MemoryRegion::available(0x10_0000, 0x10_0000),
            MemoryRegion::new(0, 0x9_FC00, MemoryRegionKind::from_multiboot(1)),
        ];
        let out = sanitize(&map).unwrap();
        assert_eq!(
            out.as_slice(),
            [
                MemoryRegion::available(0, 0x9_FC00),
                MemoryRegion::available(0x10_0000, 0x20_0000),
            ]
        );
    }

    #[test]
    fn bad_memory_beats_everything() {
        let map = [
            MemoryRegion::new(0x1000, 0x3000, MemoryRegionKind::BadMemory),
            MemoryRegion::reserved(0, 0x10_0000),
            MemoryRegion::new(0, 0x10_0000, MemoryRegionKind::AcpiNvs),
        ];
        let out = sanitize(&map).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], MemoryRegion::new(0x1000, 0x3000, MemoryRegionKind::BadMemory));
        assert_eq!(out[2].kind, MemoryRegionKind::Reserved);
    }

    #[test]
    fn clipped_to_four_gib_and_empty_skipped() {
        let map = [
            MemoryRegion::available(0xFFF0_0000, 0x20_0000),
            MemoryRegion::available(0x1_0000_0000, 0x1000_0000),
            MemoryRegion::reserved(0x5000, 0),
        ];
        let out = sanitize(&map).unwrap();
        assert_eq!(out.as_slice(), [MemoryRegion::available(0xFFF0_0000, 0x10_0000)]);
    }

    #[test]
    fn too_many_regions() {
        let map: Vec<_> = (0..=MAX_REGIONS as u64)
            .map(|i| MemoryRegion::available(i * 0x2000, 0x1000))
            .collect();
        assert_eq!(
            sanitize(&map),
            Err(RegionError::TooManyRegions {
                capacity: MAX_REGIONS
            })
        );
    }
}
