//! # Kernel synchronization primitives
//!
//! A test-and-test-and-set [`SpinLock`] plus an [`IrqGuard`] that masks
//! interrupts for the duration of a critical section. The memory manager is
//! reached through [`SpinLock::try_lock_irq`] so that a handler interrupting
//! an allocation is reported instead of spinning forever on a single CPU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
