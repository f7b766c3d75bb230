//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestrator and its spawned
//! agents. Console output is always on; when `GRIDTEST_LOG_DIR` is set a JSON
//! file layer is added as well, which keeps agent logs inspectable even after
//! their stdio pipes are gone.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize logging. Safe to call from multiple places (tests, agents,
/// library users); only the first call wins.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level =
            std::env::var("GRIDTEST_LOG").unwrap_or_else(|_| get_log_level(&environment));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let file_layer = std::env::var("GRIDTEST_LOG_DIR").ok().map(|dir| {
            let log_dir = PathBuf::from(dir);
            if !log_dir.exists() {
                let _ = fs::create_dir_all(&log_dir);
            }
            let pid = process::id();
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let file_appender = tracing_appender::rolling::never(
                &log_dir,
                format!("{environment}.{pid}.{timestamp}.log"),
            );
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            // The guard must outlive the process for the writer to flush.
            std::mem::forget(guard);
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(log_level))
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer);

        // A global subscriber may already be set by the embedding test harness.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("GRIDTEST_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("GRIDTEST_ENV", "test_override");
        let env = get_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("GRIDTEST_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("test"), "debug");
    }
}
