//! Log output setup for the binary.

use log::LevelFilter;

/// Installs `env_logger` writing to stderr.
///
/// The default level is `info` (`debug` with `verbose`, which also shows
/// every client output line); `RUST_LOG` overrides both.
pub fn init(verbose: bool) {
    let default = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(default)
        .parse_default_env()
        .format_target(false)
        .try_init();
}
