use anyhow::Result;
use std::fs::{self, File};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter applied to both layers, e.g. `warn,troupe=warn`.
fn filter_for(log_level: &tracing::Level) -> String {
    format!("{},troupe={}", log_level.as_str(), log_level.as_str())
}

/// Install a global subscriber writing to `log_path`, and to stdout when
/// `with_stdout` is set. Fails if a global subscriber already exists.
pub fn setup_global_logging(
    log_path: impl AsRef<Path>,
    log_level: &tracing::Level,
    with_stdout: bool,
) -> Result<()> {
    let log_path = log_path.as_ref();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let filter = filter_for(log_level);
    let file = File::create(log_path)?;
    let file_writer = std::sync::Mutex::new(file).with_max_level(tracing::Level::TRACE);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_thread_names(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::builder().parse(&filter)?);

    let installed = if with_stdout {
        let stdout_layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_thread_names(true)
            .with_target(true)
            .with_ansi(true)
            .pretty()
            .with_filter(EnvFilter::builder().parse(&filter)?);
        tracing_subscriber::registry()
            .with(file_layer)
            .with(stdout_layer)
            .try_init()
    } else {
        tracing_subscriber::registry().with(file_layer).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
