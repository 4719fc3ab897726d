//! Kernel logger behind the `log` facade, writing to the platform
//! console. The panic path prints through the same sink with every
//! other CPU halted.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::platform;

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

/// Serializes whole lines on the console.
static CONSOLE_LOCK: Mutex<()> = Mutex::new(());

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        platform::console_write(s);
        Ok(())
    }
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = CONSOLE_LOCK.lock();
        let tag = match record.level() {
            Level::Error => "error",
            Level::Warn => " warn",
            Level::Info => " info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        let _ = writeln!(
            ConsoleWriter,
            "[{}] {}: {}",
            tag,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the logger. The level comes from `--log-level=` when present.
pub fn init() {
    let level = match crate::cmdline::get_str("log-level").as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Panic banner: masks this CPU, prints, leaves the caller to halt the
/// rest. Reused by the bare-metal panic handler.
pub fn panic_banner(info: &core::panic::PanicInfo) {
    let _ = crate::irql::raise(crate::irql::MASKED);
    let _guard = CONSOLE_LOCK.lock();
    let _ = writeln!(ConsoleWriter, "\n*** kernel panic ***");
    let _ = writeln!(ConsoleWriter, "{}", info);
}
