mod common;

use common::{booted, fresh};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::{GlobalError, GlobalMemory, MemoryError};
use kernel_memory_addresses::VirtualAddress;

type Memory = GlobalMemory<common::Machine, common::Machine>;

#[test]
fn nothing_before_install() {
    let memory = Memory::new();
    assert!(!memory.is_installed());
    assert_eq!(memory.kmalloc(32), None);
    assert_eq!(
        memory.kfree(VirtualAddress::new(0xE000_0010)),
        Err(GlobalError::NotInstalled)
    );
}

#[test]
fn install_once() {
    let memory = Memory::new();
    memory.install(booted().1).unwrap();
    assert!(memory.is_installed());
    assert_eq!(memory.install(fresh().1), Err(GlobalError::AlreadyInstalled));
}

#[test]
fn c_style_calls() {
    let memory = Memory::new();
    memory.install(booted().1).unwrap();

    let a = memory.kmalloc(100).unwrap();
    let b = memory.kcalloc(4, 25).unwrap();
    let page = memory.kmalloc_a(10).unwrap();
    assert_eq!(page.as_u32() % 4096, 0);

    let grown = memory.krealloc(Some(a), 400).unwrap().unwrap();
    memory.kfree(grown).unwrap();
    memory.kfree(b).unwrap();
    memory.kfree(page).unwrap();

    assert!(matches!(
        memory.kfree(b),
        Err(GlobalError::Memory(MemoryError::Heap(_)))
    ));
    let stats = memory
        .with_memory(|m| m.heap().unwrap().check_integrity())
        .unwrap()
        .unwrap();
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn reentry_is_refused() {
    let memory = Memory::new();
    memory.install(booted().1).unwrap();

    let nested = memory.with_memory(|_| memory.kmalloc(16)).unwrap();
    assert_eq!(nested, None);
    assert_eq!(
        memory.with_memory(|_| memory.with_memory(|_| ())).unwrap(),
        Err(GlobalError::Reentered)
    );

    // The lock is released again afterwards.
    assert!(memory.kmalloc(16).is_some());
}

#[test]
fn global_alloc_adapter() {
    let memory = Memory::new();
    memory.install(booted().1).unwrap();

    unsafe {
        let small = memory.alloc(Layout::from_size_align(64, 8).unwrap());
        assert!(!small.is_null());
        assert_eq!(small.addr() % 16, 0);

        let paged = memory.alloc(Layout::from_size_align(64, 4096).unwrap());
        assert!(!paged.is_null());
        assert_eq!(paged.addr() % 4096, 0);

        let huge = memory.alloc(Layout::from_size_align(64, 8192).unwrap());
        assert!(huge.is_null());

        memory.dealloc(small, Layout::from_size_align(64, 8).unwrap());
        memory.dealloc(paged, Layout::from_size_align(64, 4096).unwrap());
    }

    let stats = memory
        .with_memory(|m| m.heap().unwrap().check_integrity())
        .unwrap()
        .unwrap();
    assert_eq!(stats.free_blocks, 1);
}
