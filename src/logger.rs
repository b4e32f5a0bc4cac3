// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Logging to the platform console.

use crate::{context::CoresImpl, debug::DEBUG, platform::LogSinkImpl};
use core::fmt::{Arguments, Write};
#[cfg(not(test))]
use core::{option_env, panic::PanicInfo};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use percore::Cores;
use spin::{Once, mutex::SpinMutex};

static LOGGER: Once<Logger> = Once::new();

struct Logger {
    sink: LogSinkImpl,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            writeln!(
                self.sink,
                "{} [cpu {}]: {}",
                record.level(),
                CoresImpl::core_index(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the global logger, writing to the given sink.
///
/// Fails if a logger has already been installed.
pub fn init(sink: LogSinkImpl) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| Logger { sink });
    log::set_logger(logger)?;
    log::set_max_level(build_time_log_level());
    Ok(())
}

/// Gets a reference to the log sink, if the logger has been initialised.
pub fn get_log_sink() -> Option<&'static LogSinkImpl> {
    LOGGER.get().map(|logger| &logger.sink)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(sink) = get_log_sink() {
        writeln!(sink, "PANIC: {info}");
    }
    loop {
        crate::aarch64::wfi();
    }
}

/// Returns the logging [`LevelFilter`] chosen by the build-time environment variable `LOG_LEVEL`.
///
/// `LOG_LEVEL` may be one of "off", "error", "warn", "info", "debug" or "trace". Anything else
/// falls back to `Debug` for debug builds and `Info` otherwise.
pub const fn build_time_log_level() -> LevelFilter {
    let level = match option_env!("LOG_LEVEL") {
        Some(level) => level,
        None => "",
    };
    match level.as_bytes() {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ if DEBUG => LevelFilter::Debug,
        _ => LevelFilter::Info,
    }
}

/// Something to which log lines can be written.
///
/// `write_fmt` takes `&self`, so implementations handle their own locking.
pub trait LogSink {
    /// Writes the given format arguments to the log sink.
    fn write_fmt(&self, args: Arguments);
}

/// A [`LogSink`] wrapping any [`Write`] implementation in a spin mutex, so whole lines from
/// different cores don't interleave.
pub struct LockedWriter<W: Write> {
    writer: SpinMutex<W>,
}

impl<W: Write> LockedWriter<W> {
    /// Creates a new `LockedWriter` wrapping the given writer.
    #[cfg_attr(test, allow(unused))]
    pub const fn new(writer: W) -> Self {
        Self {
            writer: SpinMutex::new(writer),
        }
    }
}

impl<W: Write> LogSink for LockedWriter<W> {
    fn write_fmt(&self, args: Arguments) {
        // There is nowhere to report a console error to.
        let _ = self.writer.lock().write_fmt(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buffer(String);

    impl Write for Buffer {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            self.0.push_str(s);
            Ok(())
        }
    }

    #[test]
    fn locked_writer_writes_whole_lines() {
        let writer = LockedWriter::new(Buffer(String::new()));
        writeln!(writer, "{} and {}", 1, "two");
        writeln!(writer, "three");
        assert_eq!(writer.writer.lock().0, "1 and two\nthree\n");
    }

    #[test]
    fn log_level_defaults() {
        if option_env!("LOG_LEVEL").is_none() {
            let expected = if DEBUG {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            };
            assert_eq!(build_time_log_level(), expected);
        }
    }
}
