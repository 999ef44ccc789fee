//! # Kernel Memory
//!
//! Everything that hands out memory in the kernel, from the first bump
//! allocation after boot to `kmalloc` on the paged kernel heap.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ global      GlobalMemory, KernelAllocator    │  lock + IRQ mask
//! ├──────────────────────────────────────────────┤
//! │ manager     MemoryManager, BootPhase         │  ordering of the phases
//! ├───────────────┬──────────────┬───────────────┤
//! │ placement     │ kheap        │ vmm           │
//! │ bump buffer   │ best-fit     │ zones, copies │
//! │               │ blocks       ├───────────────┤
//! │               │              │ kernel-vmem   │  page tables
//! │               │              ├───────────────┤
//! │               │              │ frame_alloc   │  frame bitmap
//! │               │              │ region        │  memory map
//! └───────────────┴──────────────┴───────────────┘
//! ```
//!
//! ## Components
//!
//! * [`placement`]: monotonic allocation out of a fixed buffer inside the
//!   kernel image mapping. Never frees.
//! * [`region`]: turns the boot loader's memory map into sorted,
//!   non-overlapping regions.
//! * [`frame_alloc`]: one bit per 4 KiB physical frame.
//! * [`vmm`]: maps and unmaps ranges in the user or kernel zone, creates and
//!   deep-copies address spaces.
//! * [`kheap`]: variable-size blocks with split and coalesce.
//! * [`manager`]: owns all of the above and enforces the boot order.
//! * [`global`]: the one shared instance.
//!
//! Every component reaches memory through [`kernel_vmem::VirtMapper`], so
//! the whole stack runs against [`kernel_vmem::emulator::EmulatedMachine`]
//! in tests.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod global;
pub mod kheap;
pub mod manager;
pub mod placement;
pub mod region;
pub mod vmm;

pub use frame_alloc::{BitmapFrameAllocator, PmmError};
pub use global::{GlobalError, GlobalMemory};
pub use kheap::{HeapError, HeapStats, KernelHeap};
pub use manager::{BootPhase, Exhaustion, MemoryError, MemoryLayout, MemoryManager};
pub use placement::PlacementAllocator;
pub use region::{RegionError, RegionList, sanitize};
pub use vmm::{Vmm, VmmError};

#[cfg(target_arch = "x86")]
pub use global::{KERNEL_MEMORY, KernelAllocator};
