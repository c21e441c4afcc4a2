//! Configuration parsing for the creditflow runner.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Validation of budget table and claim sizing

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::budget::MAX_WATCHERS;

/// Error type for configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Workers must be between 1 and {max}, got {workers}")]
    Workers { workers: usize, max: usize },

    #[error("Budget capacity must be a power of two, got {0}")]
    Capacity(usize),

    #[error("Budgets per worker ({budgets}) exceed budget capacity ({capacity})")]
    BudgetsPerWorker { budgets: usize, capacity: usize },

    #[error("Minimum claim must be positive")]
    MinClaim,

    #[error("Minimum claim ({min}) exceeds maximum claim ({max})")]
    ClaimRange { min: u32, max: u32 },

    #[error("Window must be positive, got {0}")]
    Window(i64),
}

/// Creditflow: credit-based flow control over shared budget tables.
#[derive(Parser, Debug, Clone)]
#[command(name = "creditflow")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Number of workers, one budget partition each
    #[arg(short, long, env = "CREDITFLOW_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Slots per budget table (power of two)
    #[arg(long, env = "CREDITFLOW_BUDGETS_CAPACITY", default_value_t = 1024)]
    pub budgets_capacity: usize,

    /// Budgets each worker acquires and credits
    #[arg(long, env = "CREDITFLOW_BUDGETS_PER_WORKER", default_value_t = 16)]
    pub budgets_per_worker: usize,

    /// Streams each worker runs against its neighbour's budgets
    #[arg(long, env = "CREDITFLOW_STREAMS_PER_WORKER", default_value_t = 64)]
    pub streams_per_worker: usize,

    /// Initial credit of every budget
    #[arg(long, env = "CREDITFLOW_WINDOW", default_value_t = 65536)]
    pub window: i64,

    /// Smallest acceptable claim
    #[arg(long, env = "CREDITFLOW_MIN_CLAIM", default_value_t = 1024)]
    pub min_claim: u32,

    /// Largest claim a stream asks for
    #[arg(long, env = "CREDITFLOW_MAX_CLAIM", default_value_t = 8192)]
    pub max_claim: u32,

    /// Run duration in milliseconds (0 runs until interrupted)
    #[arg(short, long, env = "CREDITFLOW_DURATION_MS", default_value_t = 1000)]
    pub duration_ms: u64,

    /// Linger before a cleaned up child budget forgets its parent
    #[arg(long, env = "CREDITFLOW_CHILD_CLEANUP_LINGER_MS", default_value_t = 5000)]
    pub child_cleanup_linger_ms: u64,

    /// Idle polls before a waiting stream retries without a flush
    #[arg(long, env = "CREDITFLOW_IDLE_RETRY_POLLS", default_value_t = 64)]
    pub idle_retry_polls: u32,

    /// Directory for file-backed budget tables (anonymous memory if unset)
    #[arg(long, env = "CREDITFLOW_DIRECTORY")]
    pub directory: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CREDITFLOW_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check sizing constraints the budget tables rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WATCHERS).contains(&self.workers) {
            return Err(ConfigError::Workers {
                workers: self.workers,
                max: MAX_WATCHERS,
            });
        }
        if !self.budgets_capacity.is_power_of_two() {
            return Err(ConfigError::Capacity(self.budgets_capacity));
        }
        if self.budgets_per_worker > self.budgets_capacity {
            return Err(ConfigError::BudgetsPerWorker {
                budgets: self.budgets_per_worker,
                capacity: self.budgets_capacity,
            });
        }
        if self.min_claim == 0 {
            return Err(ConfigError::MinClaim);
        }
        if self.min_claim > self.max_claim {
            return Err(ConfigError::ClaimRange {
                min: self.min_claim,
                max: self.max_claim,
            });
        }
        if self.window <= 0 {
            return Err(ConfigError::Window(self.window));
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_ms != 0).then(|| Duration::from_millis(self.duration_ms))
    }

    pub fn child_cleanup_linger(&self) -> Duration {
        Duration::from_millis(self.child_cleanup_linger_ms)
    }

    /// Create a small configuration for testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            workers: 2,
            budgets_capacity: 16,
            budgets_per_worker: 2,
            streams_per_worker: 4,
            window: 4096,
            min_claim: 256,
            max_claim: 1024,
            duration_ms: 50,
            child_cleanup_linger_ms: 10,
            idle_retry_polls: 4,
            directory: None,
            log_level: "debug".into(),
            log_json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            budgets_capacity: 1024,
            budgets_per_worker: 16,
            streams_per_worker: 64,
            window: 65536,
            min_claim: 1024,
            max_claim: 8192,
            duration_ms: 1000,
            child_cleanup_linger_ms: 5000,
            idle_retry_polls: 64,
            directory: None,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.child_cleanup_linger(), Duration::from_secs(5));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_parse_matches_default() {
        let config = Config::parse_from(["creditflow"]);
        let default = Config::default();
        assert_eq!(config.budgets_capacity, default.budgets_capacity);
        assert_eq!(config.max_claim, default.max_claim);
        assert_eq!(config.directory, None);
    }

    #[test]
    fn test_parse_overrides() {
        let config = Config::parse_from([
            "creditflow",
            "--workers",
            "8",
            "--min-claim",
            "16",
            "--duration-ms",
            "0",
            "--directory",
            "/tmp/budgets",
        ]);
        assert_eq!(config.workers, 8);
        assert_eq!(config.min_claim, 16);
        assert_eq!(config.duration(), None);
        assert_eq!(config.directory, Some(PathBuf::from("/tmp/budgets")));
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        let mut config = Config::test_config();
        config.workers = 65;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Workers {
                workers: 65,
                max: 64
            })
        );

        let mut config = Config::test_config();
        config.budgets_capacity = 12;
        assert_eq!(config.validate(), Err(ConfigError::Capacity(12)));

        let mut config = Config::test_config();
        config.budgets_per_worker = 17;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BudgetsPerWorker { .. })
        ));

        let mut config = Config::test_config();
        config.min_claim = 2048;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ClaimRange {
                min: 2048,
                max: 1024
            })
        );

        let mut config = Config::test_config();
        config.window = 0;
        assert_eq!(config.validate(), Err(ConfigError::Window(0)));
    }
}
