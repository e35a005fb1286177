//! `env_logger` initialization for the radio-emulator process: timestamped
//! lines on stderr, `Info` by default and `Debug` under `--verbose`.

use log::LevelFilter;

/// Install the global logger. Call once from `main` before anything else logs.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
