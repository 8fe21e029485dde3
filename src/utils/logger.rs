use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Set to log everything at debug level into a daily rolling file
pub const DEBUG_ENV: &str = "LUT_RENDERER_DEBUG";

/// Directory the debug log is written to
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lut-renderer")
}

/// Initialize logging; keep the returned guard alive until exit
pub fn init_logging() -> Option<WorkerGuard> {
    if std::env::var_os(DEBUG_ENV).is_some() {
        let log_dir = log_dir();
        let _ = std::fs::create_dir_all(&log_dir);

        let file_appender = tracing_appender::rolling::daily(&log_dir, "lut-renderer.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .init();

        tracing::info!("lut-renderer logging initialized in {}", log_dir.display());
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
        None
    }
}
