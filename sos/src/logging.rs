//! Console logger for the `log` facade.
//!
//! The memory manager has no console of its own; whoever brings it up hands
//! [`init`] a function that writes a formatted line somewhere visible.

use alloc::boxed::Box;
use core::fmt;
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::race::OnceBox;

pub type Sink = fn(fmt::Arguments<'_>);

static SINK: OnceBox<Sink> = OnceBox::new();

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = SINK.get() else {
            return;
        };

        let color = match record.level() {
            Level::Error => 31,
            Level::Warn => 93,
            Level::Info => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        sink(format_args!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m\n",
            color,
            record.level(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Maps the `LOG` build variable to a level. Unset or unknown means off.
pub fn level_filter(level: Option<&str>) -> LevelFilter {
    match level {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Installs the console logger at the level named by `LOG`. Only the first
/// call has any effect.
pub fn init(sink: Sink) {
    init_with_level(sink, level_filter(option_env!("LOG")));
}

pub fn init_with_level(sink: Sink, level: LevelFilter) {
    static LOGGER: ConsoleLogger = ConsoleLogger;

    if SINK.set(Box::new(sink)).is_err() {
        return;
    }
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(level));
}
