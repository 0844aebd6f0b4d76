//! Common test utilities with tracing setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test code ...
//! }
//! ```
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Filter directives (e.g., `mlpset=trace`)
//! - `MLPSET_LOG_DIR`: Log directory (default: `logs/`)
//! - `MLPSET_LOG_CONSOLE`: Set to "0" to disable console output
//!
//! Logs are written to `logs/mlpset.jsonl` as newline-delimited JSON;
//! use `jq` to filter (e.g. `jq 'select(.level == "WARN")'`).

#![allow(dead_code)]

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Ensures tracing is only initialized once across all tests.
static INIT: Once = Once::new();

/// Initialize the tracing subscriber with file and console logging.
///
/// Safe to call multiple times - only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(setup_tracing);
}

fn make_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{default_level}")))
}

#[expect(clippy::expect_used)]
fn setup_tracing() {
    let log_dir = env::var("MLPSET_LOG_DIR").map_or_else(|_| PathBuf::from("logs"), PathBuf::from);
    let console_enabled = !env::var("MLPSET_LOG_CONSOLE").is_ok_and(|v| v == "0");

    std::fs::create_dir_all(&log_dir).expect("Failed to create log directory");

    // Append mode: nextest runs tests in separate processes.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("mlpset.jsonl"))
        .expect("Failed to open log file");

    let console_layer = console_enabled.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .compact()
            .with_filter(make_filter(Level::INFO))
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_filter(make_filter(Level::INFO));

    let _ = Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
