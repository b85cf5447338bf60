mod config;
pub mod database;
pub mod migrations;

pub use config::{Config, DurationsConfig, EngineConfig, RetryConfig};
pub use database::{Database, Stats};

use std::path::PathBuf;

/// Returns the engine data directory, creating it if needed.
///
/// `FOCUS_ENGINE_HOME` overrides the location outright. Otherwise this is
/// `~/.config/focus-engine[-dev]/`, with the `-dev` suffix selected by
/// `FOCUS_ENGINE_ENV=dev`.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let dir = match std::env::var_os("FOCUS_ENGINE_HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("FOCUS_ENGINE_ENV").unwrap_or_else(|_| "production".to_string());

            if env == "dev" {
                base_dir.join("focus-engine-dev")
            } else {
                base_dir.join("focus-engine")
            }
        }
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
