// common.rs: process-wide setup shared by the viewer binaries

use log::LevelFilter;

/// Initialize the global logger.
///
/// `RUST_LOG` wins when set; otherwise `developer` selects debug output.
/// Safe to call more than once (later calls are ignored).
pub fn init_logging(developer: bool) {
    let default_level = if developer { LevelFilter::Debug } else { LevelFilter::Info };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.format_timestamp_millis();

    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
}
