//! Console logging setup.

/// Enables console logging with the level taken from `RUST_LOG`, `info` otherwise.
///
/// Repeated calls are ignored, so every process entry point may call it.
pub fn enable_console_log() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Enables console logging with the specified level.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
