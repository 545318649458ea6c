//! Logger initialization. Libraries only use the `log` facade.

use std::fs::OpenOptions;
use std::path::Path;

use env_logger::{Builder, Target};

/// Install the global logger with an `env_logger` filter (e.g. `info` or
/// `metricpush_server=debug,warn`), appending to `file` when given.
pub fn init(level: &str, file: Option<&Path>) -> std::io::Result<()> {
    let mut builder = Builder::new();
    builder.parse_filters(level);
    match file {
        Some(path) => {
            let sink = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(Target::Pipe(Box::new(sink)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }
    // a second init in the same process keeps the first logger
    let _ = builder.try_init();
    Ok(())
}
