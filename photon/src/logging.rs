pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::Config;
use sloggers::LoggerConfig;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root terminal logger used by all workers.
pub fn init() -> Logger {
    build(DEFAULT_CONFIG)
}

/// Builds a root logger from a sloggers TOML snippet. Bad configuration is a
/// programming error, not a runtime condition.
pub fn build(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Error parsing logger config");
    config.build_logger().expect("Error building logger")
}

/// Derives a component logger from an optional parent, falling back to a
/// discard logger so library types stay usable without a logging setup.
pub fn component<'a, L: Into<Option<&'a Logger>>>(parent: L) -> Logger {
    match parent.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
