/// Logging initialization for the embedded core.
///
/// Writes formatted logs to stderr, plus a file fallback at
/// `<data_dir>/bargain.log` so headless deployments keep a trail even when
/// stderr is discarded by the host shell.
///
/// Called once at the start of `App::new()`, before anything else.
pub fn init_logging(data_dir: &str) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bargain_core=debug,info".into());

    let log_path = std::path::Path::new(data_dir).join("bargain.log");
    let _ = std::fs::create_dir_all(data_dir);
    let file_layer = if let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}
