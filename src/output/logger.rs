//! Tracing subscriber setup and log file location.

use anyhow::{Context, Result};
use chrono::Utc;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding an `EnvFilter` directive, e.g. `toolbridge=debug`.
pub const LOG_ENV: &str = "TOOLBRIDGE_LOG";

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "toolbridge=warn",
        1 => "toolbridge=debug",
        _ => "toolbridge=trace",
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr so stdout stays clean for command output. With
/// `log_file` set, the same events are mirrored without ANSI codes to a
/// timestamped file, whose path is returned.
pub fn init(verbosity: u8, log_file: bool) -> Result<Option<PathBuf>> {
    let directive = default_directive(verbosity);
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(directive));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, path) = if log_file {
        let path = setup_log_file()?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        let layer = fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .boxed();
        (Some(layer), Some(path))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(path)
}

/// Set up the log directory and return a fresh log file path.
pub fn setup_log_file() -> Result<PathBuf> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    Ok(log_dir.join(format!("{}.log", timestamp)))
}

/// Get the log directory path.
pub fn log_directory() -> PathBuf {
    let base_dir = env::var("TMPDIR")
        .or_else(|_| env::var("XDG_RUNTIME_DIR"))
        .unwrap_or_else(|_| "/tmp".to_string());

    let project_name = env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    PathBuf::from(base_dir)
        .join("toolbridge")
        .join("logs")
        .join(project_name)
}
