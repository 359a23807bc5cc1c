pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger writing to stderr. The `level` string uses
/// the sloggers severity names (`trace`, `debug`, `info`, `warning`, `error`).
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n",
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a TOML logging section, for configs that carry one.
pub fn from_toml(toml: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(toml).expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that drops everything. Components constructed without a parent
/// logger get one of these.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
