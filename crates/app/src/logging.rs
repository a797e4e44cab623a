use std::io;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Installs a stderr subscriber. Events from this workspace are shown at
/// `level`; dependencies only ever log warnings and errors.
pub(crate) fn setup_tracing(level: Level) {
    let filter_layer = tracing_subscriber::filter::filter_fn(move |metadata| {
        let is_raymerge = metadata.target().starts_with("raymerge");
        let effective_level = if is_raymerge { level } else { Level::WARN };
        metadata.level() <= &effective_level
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter_layer))
        .init();
}

/// Reads `-v`/`--verbose` and `-q`/`--quiet` from the argument list.
pub(crate) fn level_from_args(args: &[String]) -> Level {
    let mut level = Level::INFO;
    for arg in args {
        match arg.as_str() {
            "-v" | "--verbose" => level = Level::DEBUG,
            "-q" | "--quiet" => level = Level::WARN,
            _ => {}
        }
    }
    level
}
