//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and boot interface types
//! shared by the kernel's memory subsystem and its boot path. It is the single
//! source of truth for where things live in the 32-bit address space.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Zones**: user space below `0xC000_0000`, kernel space above it
//! * **Higher Half**: the kernel image runs at `0xC010_0000`, loaded at 1 MiB
//! * **Fixed Regions**: lower-memory window, kernel heap, VGA and video BIOS
//! * **Bootstrap Translation**: the offset rule used before paging is on
//!
//! ### Boot Information ([`boot`])
//! * **Memory Map**: Multiboot-style `{base, length, type}` regions
//! * **Kernel Image**: physical and virtual bounds of the loaded kernel
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │         User Space              │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_SPACE_BASE
//!             │   Kernel Space (higher half)    │
//!             │   shared by every directory     │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Build Integration
//! ```rust
//! use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
