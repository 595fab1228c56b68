//! Logging initialization (call once at startup).

use std::path::PathBuf;

/// Set up tracing output: console in debug builds, a daily-rolling file in
/// release builds. Safe to call more than once; later calls are no-ops.
#[allow(unused_variables)]
pub fn init(log_dir: Option<PathBuf>) -> Result<(), String> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("logs"));
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            format!("Failed to create log directory {}: {}", log_dir.display(), e)
        })?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "proxyscope");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // The guard must outlive the process for buffered lines to flush.
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("proxyscope initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}
