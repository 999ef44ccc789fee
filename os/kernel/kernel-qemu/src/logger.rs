use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log::Log` backend writing to the QEMU debug console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Register as the global logger. Call once during early boot.
    ///
    /// # Errors
    /// Fails if another logger was installed first.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = write_record(&mut QemuSink, record);
    }

    fn flush(&self) {}
}

/// Formats `record` as `"[LEVEL] target: message\n"`.
///
/// # Errors
/// Whatever the sink reports.
pub fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_layout() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel_alloc::kheap")
                .args(format_args!("double free at {:#010X}", 0xC010_0010u32))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel_alloc::kheap: double free at 0xC0100010\n");
    }

    #[test]
    fn filters_by_level() {
        let logger = QemuLogger::new(LevelFilter::Info);
        let info = Metadata::builder().level(Level::Info).build();
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(logger.enabled(&info));
        assert!(!logger.enabled(&debug));
        assert_eq!(logger.max_level(), LevelFilter::Info);
    }

    #[test]
    fn off_drops_everything() {
        let logger = QemuLogger::new(LevelFilter::Off);
        assert!(!logger.enabled(&Metadata::builder().level(Level::Error).build()));
    }
}
