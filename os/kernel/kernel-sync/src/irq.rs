use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// A spin lock guard that also keeps interrupts disabled while held.
///
/// Created via [`SpinLock::lock_irq`] or [`SpinLock::try_lock_irq`], it:
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying lock,
///
/// releasing them in reverse order on drop.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinLock;
///
/// static COUNTER: SpinLock<u32> = SpinLock::new(0);
///
/// {
///     let mut g = COUNTER.lock_irq();
///     *g += 1;
/// }
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct IrqSpinLockGuard<'a, T> {
    // Field order matters: the lock is released before interrupts come back.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Acquires the lock with interrupts disabled for the guard's lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Disables interrupts and tries to take the lock once.
    ///
    /// On a single CPU with interrupts masked, a held lock can only mean the
    /// current context interrupted its own critical section. Returns `None`
    /// in that case and restores the interrupt state.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        let guard = self.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `EFLAGS` value (via `pushfd/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    let r: u32;
    unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(nomem, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, preserving the original state.
///
/// Outside a bare-metal x86 build (host tests, tooling) there are no
/// interrupts to mask and the guard does nothing.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let enabled = (eflags() & (1 << 9)) != 0;
            if enabled {
                cli_stop_interrupts();
            }
            Self {
                were_enabled: enabled,
            }
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            Self {
                were_enabled: false,
            }
        }
    }

    /// Whether interrupts were on before this guard masked them.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
