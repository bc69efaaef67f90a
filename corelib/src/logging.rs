//! Thin wrapper around `slog`/`sloggers` matching the conventions the rest of
//! the tree logs with: structured `key => value` pairs, one `Logger` per
//! owning object, child loggers via `.new(o!(...))`.

pub use slog::{self, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};

/// Builds a root logger from a TOML snippet in `sloggers`' config schema.
/// Used by binaries that load their logging setup from a config file;
/// library code should accept a `Logger` rather than calling this directly.
pub fn from_toml(toml: &str) -> Result<Logger, serdeconv::Error> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml)?;
    config
        .build_logger()
        .map_err(|err| serdeconv::Error::from(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))
}

/// A sensible default: a terminal logger at the given severity, writing to
/// stderr. Falls back to a discarding logger if the terminal drain can't be
/// built (e.g. no tty).
pub fn terminal(level: Severity) -> Logger {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);

    builder.build().unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// A logger that discards everything. Used as the default for objects
/// constructed without an explicit parent logger (tests, standalone use).
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
