//! # QEMU debug console
//!
//! Routes the `log` facade to QEMU's debug console (`-debugcon`), which
//! captures every byte written to I/O port `0x402`.
//!
//! ```text
//! log::info!(..) -> QemuLogger -> write_record -> QemuSink -> port 0x402
//! ```
//!
//! Writing a record never allocates. With the `enabled` feature turned off,
//! or when not running bare-metal on x86, the sink drops every byte.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//! LOGGER.install().ok();
//! log::info!("memory: heap ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    #[cfg(all(feature = "enabled", target_arch = "x86", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(all(feature = "enabled", target_arch = "x86", target_os = "none")))]
    #[inline]
    pub const fn dbg_putc(_c: u8) {}

    /// `fmt::Write` over the debug port.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// `format!`-style output straight to the debug console, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
