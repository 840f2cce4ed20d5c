//! Logging configuration using tracing

use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Result, ResultExt};

const LOG_FILE_NAME: &str = "adbridge.log";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/adbridge/logs/`, rotated daily.
/// Log level is controlled by the `ADBRIDGE_LOG` environment variable.
///
/// Embedding tools that install their own subscriber should skip this;
/// the library only ever emits `tracing` events.
///
/// # Examples
/// ```bash
/// ADBRIDGE_LOG=debug my-tool
/// ADBRIDGE_LOG=adbridge_engine=trace my-tool
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    let env_filter = EnvFilter::try_from_env("ADBRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("adbridge=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("adbridge logging started in {}", log_dir.display());

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("adbridge").join("logs")
}

/// Get the log file path for the current day
///
/// The daily appender suffixes the file name with the UTC date.
pub fn get_current_log_file() -> PathBuf {
    log_file_for(Utc::now().date_naive())
}

fn log_file_for(date: NaiveDate) -> PathBuf {
    get_log_directory().join(format!("{}.{}", LOG_FILE_NAME, date.format("%Y-%m-%d")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_lives_under_adbridge_dir() {
        let path = get_current_log_file();
        assert!(path.parent().unwrap().ends_with("adbridge/logs"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("adbridge.log."), "{name}");
    }

    #[test]
    fn test_log_file_carries_rotation_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert!(log_file_for(date).ends_with("adbridge/logs/adbridge.log.2024-03-09"));
    }
}
