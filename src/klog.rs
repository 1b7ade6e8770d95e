//! Kernel log sink. Wires the `log` facade to `/dev/kmsg` when it can be
//! opened for writing (i.e. running as PID 1 in the initramfs), falling back
//! to stderr otherwise (tests, interactive debugging).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

const LOG_TAG: &str = "multiboot";

struct KernelLog {
    kmsg: Option<Mutex<File>>,
}

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = kmsg_prefix(record.level());
        let line = format!("{}{}: {}\n", prefix, LOG_TAG, record.args());

        if let Some(kmsg) = &self.kmsg {
            if let Ok(mut f) = kmsg.lock() {
                if f.write_all(line.as_bytes()).is_ok() {
                    return;
                }
            }
        }
        eprint!("{}", line);
    }

    fn flush(&self) {
        if let Some(kmsg) = &self.kmsg {
            if let Ok(mut f) = kmsg.lock() {
                let _ = f.flush();
            }
        }
    }
}

/// `/dev/kmsg` lines are prefixed with `<facility*8+level>`; we use facility 0
/// (kern) and map `log::Level` onto the standard syslog priorities.
fn kmsg_prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "<3>",
        Level::Warn => "<4>",
        Level::Info => "<5>",
        Level::Debug => "<7>",
        Level::Trace => "<7>",
    }
}

/// Installs the kernel log sink as the global logger. `debug_level` follows
/// `multiboot.debug=N` from the kernel cmdline: 0 = warnings and errors only,
/// 1 = info, 2+ = debug/trace.
pub fn init(debug_level: u8) {
    let filter = match debug_level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    let kmsg = OpenOptions::new()
        .write(true)
        .open("/dev/kmsg")
        .ok()
        .map(Mutex::new);

    let logger = Box::new(KernelLog { kmsg });
    log::set_max_level(filter);
    // If a logger is already installed (e.g. repeated init in tests) we
    // simply keep the existing one; this is not a fatal condition.
    let _ = log::set_boxed_logger(logger);
}
