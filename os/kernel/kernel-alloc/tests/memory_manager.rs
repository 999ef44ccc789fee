mod common;

use common::{HEAP_SIZE, booted, fresh, layout, memory_map, read, write};
use kernel_alloc::{BootPhase, Exhaustion, MemoryError};
use kernel_info::memory::{KERNEL_HEAP_BASE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageFlags;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn boots_through_every_phase() {
    let (machine, mut manager) = fresh();
    let layout = layout();
    assert_eq!(manager.phase(), BootPhase::Placement);

    manager.init_physical(&memory_map(), &layout.kernel).unwrap();
    assert_eq!(manager.phase(), BootPhase::PhysicalMemory);
    assert!(!machine.paging_enabled());

    manager.init_virtual(&layout.kernel).unwrap();
    assert_eq!(manager.phase(), BootPhase::VirtualMemory);
    assert!(machine.paging_enabled());

    manager.init_heap(layout.heap_base, layout.heap_size).unwrap();
    assert_eq!(manager.phase(), BootPhase::Heap);

    let heap = manager.heap().unwrap();
    assert_eq!(heap.get_total_memory_size(), HEAP_SIZE);
    assert!(heap.check_integrity().is_ok());
}

#[test]
fn kernel_mappings_after_boot() {
    let (_, manager) = booted();
    assert_eq!(
        manager.get_mapped_address(VirtualAddress::new(0xC010_0000)),
        Some(PhysicalAddress::new(0x10_0000))
    );
    assert_eq!(
        manager.get_mapped_address(VirtualAddress::new(0xC00B_8000)),
        Some(PhysicalAddress::new(0xB_8000))
    );
    assert!(manager.is_mapped(VirtualAddress::new(KERNEL_HEAP_BASE)));
    assert!(!manager.is_mapped(VirtualAddress::new(0x4000_0000)));
}

#[test]
fn kernel_frames_are_never_handed_out() {
    let (_, mut manager) = booted();
    let placement_end = 0x40_0000;
    while let Some(frame) = manager.alloc_frame() {
        assert!(frame.base().as_u64() >= placement_end);
        assert!(frame.base().as_u64() < common::USABLE_END);
    }
}

#[test]
fn phases_cannot_be_skipped() {
    let (_, mut manager) = fresh();
    let layout = layout();

    assert_eq!(
        manager.init_virtual(&layout.kernel),
        Err(MemoryError::WrongPhase {
            expected: BootPhase::PhysicalMemory,
            actual: BootPhase::Placement,
        })
    );
    assert_eq!(
        manager.map_memory(None, PAGE_SIZE, None, PageFlags::KERNEL_RW),
        Err(MemoryError::WrongPhase {
            expected: BootPhase::VirtualMemory,
            actual: BootPhase::Placement,
        })
    );
    assert!(matches!(
        manager.kfree(VirtualAddress::new(KERNEL_HEAP_BASE + 16)),
        Err(MemoryError::WrongPhase { .. })
    ));

    manager.init_physical(&memory_map(), &layout.kernel).unwrap();
    assert!(matches!(
        manager.init_physical(&memory_map(), &layout.kernel),
        Err(MemoryError::WrongPhase {
            expected: BootPhase::Placement,
            actual: BootPhase::PhysicalMemory,
        })
    ));
    assert!(matches!(
        manager.init_heap(layout.heap_base, layout.heap_size),
        Err(MemoryError::WrongPhase { .. })
    ));
    assert_eq!(manager.phase(), BootPhase::PhysicalMemory);
}

#[test]
fn kmalloc_uses_placement_until_the_heap_exists() {
    let (_, mut manager) = fresh();
    let layout = layout();

    let early = manager.kmalloc(24).unwrap();
    assert!(manager.placement().contains(early));
    assert_eq!(early.as_u32() % 16, 0);
    assert!(manager.kfree(early).is_ok());

    let page = manager.kmalloc_a(100).unwrap();
    assert!(manager.placement().contains(page));
    assert_eq!(page.as_u32() % PAGE_SIZE, 0);

    manager.init(&memory_map(), &layout).unwrap();
    let late = manager.kmalloc(24).unwrap();
    assert!(manager.heap().unwrap().contains(late));

    // Placement memory stays untouched by the heap.
    assert!(manager.kfree(early).is_ok());
    assert!(manager.kfree(late).is_ok());
}

#[test]
fn kcalloc_zeroes_before_and_after_the_heap() {
    let (machine, mut manager) = fresh();
    let early = manager.kcalloc(8, 64).unwrap();
    assert!(read(machine, early, 512).iter().all(|&b| b == 0));

    manager.init(&memory_map(), &layout()).unwrap();
    let ptr = manager.kmalloc(512).unwrap();
    write(machine, ptr, &[0xEE; 512]);
    manager.kfree(ptr).unwrap();

    let again = manager.kcalloc(16, 32).unwrap();
    assert!(read(machine, again, 512).iter().all(|&b| b == 0));
}

#[test]
fn tables_come_from_the_heap_once_it_exists() {
    let (_, mut manager) = booted();
    let placement_used = manager.placement().used();
    let heap_free = manager.heap().unwrap().get_available_memory_size();

    let va = manager
        .map_memory(
            Some(VirtualAddress::new(0x4000_0000)),
            PAGE_SIZE,
            None,
            PageFlags::USER_RW,
        )
        .unwrap();
    assert_eq!(va, VirtualAddress::new(0x4000_0000));

    assert_eq!(manager.placement().used(), placement_used);
    assert!(manager.heap().unwrap().get_available_memory_size() + PAGE_SIZE <= heap_free);
    assert!(manager.heap().unwrap().check_integrity().is_ok());
}

#[test]
fn map_and_unmap_through_the_manager() {
    let (machine, mut manager) = booted();
    let va = manager
        .map_memory(None, 3 * PAGE_SIZE, None, PageFlags::KERNEL_RW)
        .unwrap();
    assert!(va.as_u32() >= 0xC000_0000);
    write(machine, va + 2 * PAGE_SIZE, b"mapped");

    let frame = manager.get_mapped_address(va).unwrap();
    assert_eq!(manager.unmap_memory(va, 3 * PAGE_SIZE), Ok(3));
    assert!(!manager.is_mapped(va));

    // The released frame is available again.
    let mut seen = false;
    while let Some(f) = manager.alloc_frame() {
        seen |= f.base() == frame;
    }
    assert!(seen);
}

static HEAP_EXHAUSTED: AtomicUsize = AtomicUsize::new(0);

fn count_heap(what: Exhaustion) {
    if what == Exhaustion::Heap {
        HEAP_EXHAUSTED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn exhaustion_reaches_the_handler() {
    let (_, mut manager) = booted();
    manager.set_exhaustion_handler(count_heap);

    assert_eq!(manager.kmalloc(2 * HEAP_SIZE), None);
    assert_eq!(HEAP_EXHAUSTED.load(Ordering::SeqCst), 1);

    // Zero-size requests are not exhaustion.
    assert_eq!(manager.kmalloc(0), None);
    assert_eq!(HEAP_EXHAUSTED.load(Ordering::SeqCst), 1);
}

#[test]
fn copies_do_not_share_user_pages() {
    let (machine, mut manager) = booted();
    let parent = manager.create_address_space().unwrap();
    manager.switch_page_directory(parent).unwrap();

    let user = VirtualAddress::new(0x0800_0000);
    manager
        .map_memory(Some(user), PAGE_SIZE, None, PageFlags::USER_RW)
        .unwrap();
    write(machine, user, b"parent");

    let child = manager.copy_page_directory(parent).unwrap();
    write(machine, user, b"change");

    manager.switch_page_directory(child).unwrap();
    assert_eq!(read(machine, user, 6), b"parent");
    assert!(manager.is_mapped(VirtualAddress::new(KERNEL_HEAP_BASE)));

    manager.switch_page_directory(parent).unwrap();
    assert_eq!(read(machine, user, 6), b"change");
}

#[test]
fn fresh_address_spaces_share_the_kernel() {
    let (_, mut manager) = booted();
    let space = manager.create_address_space().unwrap();
    manager.switch_page_directory(space).unwrap();

    assert_eq!(
        manager.get_mapped_address(VirtualAddress::new(0xC010_0000)),
        Some(PhysicalAddress::new(0x10_0000))
    );
    assert!(!manager.is_mapped(VirtualAddress::new(0x0800_0000)));
    let ptr = manager.kmalloc(64).unwrap();
    assert!(manager.kfree(ptr).is_ok());
}
