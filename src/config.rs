//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `SWITCHBACK_DATABASE_URL`: PostgreSQL connection string (required)
//! - `SWITCHBACK_POLL_INTERVAL_MS`: Scheduler daemon poll interval (default: 30000)
//! - `SWITCHBACK_MAX_TICKS_PER_PASS`: Max trigger instants opened per schedule per pass (default: 5)
//! - `SWITCHBACK_STUCK_TICK_SECS`: Age in seconds after which a STARTED tick is treated as abandoned (default: 600)

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::daemon::DaemonConfig;

/// Control-plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Scheduler daemon poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum trigger instants opened per schedule in one evaluation pass
    pub max_ticks_per_pass: usize,

    /// Age in seconds after which a STARTED tick is treated as abandoned
    pub stuck_tick_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let database_url = env::var("SWITCHBACK_DATABASE_URL")
            .context("SWITCHBACK_DATABASE_URL environment variable is required")?;

        let poll_interval_ms = env::var("SWITCHBACK_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);

        let max_ticks_per_pass = env::var("SWITCHBACK_MAX_TICKS_PER_PASS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let stuck_tick_secs = env::var("SWITCHBACK_STUCK_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(600);

        Ok(Self {
            database_url,
            poll_interval_ms,
            max_ticks_per_pass,
            stuck_tick_secs,
        })
    }

    /// Daemon settings derived from this configuration
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_ticks_per_pass: self.max_ticks_per_pass,
            stuck_tick_window: Duration::from_secs(self.stuck_tick_secs),
        }
    }

    /// Create a test configuration with defaults
    #[cfg(test)]
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            poll_interval_ms: 50,
            max_ticks_per_pass: 5,
            stuck_tick_secs: 600,
        }
    }
}

/// Get the database URL from environment
pub fn database_url() -> Result<String> {
    dotenvy::dotenv().ok();
    env::var("SWITCHBACK_DATABASE_URL")
        .context("SWITCHBACK_DATABASE_URL environment variable is required")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::test_config("postgres://localhost/switchback_test");
        assert_eq!(config.database_url, "postgres://localhost/switchback_test");
        assert_eq!(config.max_ticks_per_pass, 5);
        assert_eq!(config.stuck_tick_secs, 600);
    }

    #[test]
    fn test_daemon_config_conversion() {
        let config = Config::test_config("postgres://localhost/switchback_test");
        let daemon = config.daemon_config();
        assert_eq!(daemon.poll_interval, Duration::from_millis(50));
        assert_eq!(daemon.max_ticks_per_pass, 5);
        assert_eq!(daemon.stuck_tick_window, Duration::from_secs(600));
    }
}
