#![allow(dead_code)]

use kernel_alloc::{MemoryLayout, MemoryManager};
use kernel_info::boot::{KernelImage, MemoryRegion};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::VirtMapper;
use kernel_vmem::emulator::EmulatedMachine;

pub type Machine = &'static EmulatedMachine;
pub type Manager = MemoryManager<Machine, Machine>;

pub const RAM: u64 = 16 * 1024 * 1024;
/// The last MiB is left out of the memory map.
pub const USABLE_END: u64 = 15 * 1024 * 1024;
pub const HEAP_SIZE: u32 = 0x10_0000;

/// A PC-like map: conventional memory, the legacy hole, then RAM.
pub fn memory_map() -> [MemoryRegion; 3] {
    [
        MemoryRegion::available(0, 0x9_FC00),
        MemoryRegion::reserved(0x9_FC00, 0x6_0400),
        MemoryRegion::available(0x10_0000, USABLE_END - 0x10_0000),
    ]
}

/// 2 MiB image at 1 MiB, placement buffer right behind it, a 1 MiB heap.
pub fn layout() -> MemoryLayout {
    let kernel = KernelImage::new(
        PhysicalAddress::new(0x10_0000),
        VirtualAddress::new(0xC010_0000),
        0x20_0000,
    );
    MemoryLayout {
        heap_size: HEAP_SIZE,
        ..MemoryLayout::standard(kernel)
    }
}

#[allow(clippy::cast_possible_truncation)]
pub fn machine() -> Machine {
    EmulatedMachine::new(RAM as usize).leak()
}

pub fn fresh() -> (Machine, Manager) {
    let machine = machine();
    (machine, MemoryManager::with_layout(machine, machine, &layout()))
}

pub fn booted() -> (Machine, Manager) {
    let (machine, mut manager) = fresh();
    manager.init(&memory_map(), &layout()).unwrap();
    (machine, manager)
}

pub fn write(machine: Machine, va: VirtualAddress, bytes: &[u8]) {
    unsafe { machine.virt_to_slice_mut::<u8>(va, bytes.len()) }.copy_from_slice(bytes);
}

pub fn read(machine: Machine, va: VirtualAddress, len: usize) -> Vec<u8> {
    unsafe { machine.virt_to_slice_mut::<u8>(va, len) }.to_vec()
}
