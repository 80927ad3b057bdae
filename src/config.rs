//! Runner configuration: paths, engine command, timeout and retry policy.
//!
//! Everything the original driver hard-coded (pseudopotential directory,
//! base working directory, engine invocation) lives here as an explicit
//! object that is built once, validated at startup, and passed by reference
//! into the pipeline. Environment variables:
//!
//! - `ADSORB_BASE_DIR` — base working directory (required unless given as
//!   a command-line argument)
//! - `ESPRESSO_PSEUDO_DIR` — pseudopotential search directory (required)
//! - `ADSORB_PW_COMMAND` — engine executable (default `pw.x`)
//! - `ADSORB_TIMEOUT_SECS` — per-call wall-clock limit (default: none)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors from configuration construction and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
    /// Environment variable holds an unparseable value
    #[error("invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
    /// Pseudopotential directory does not exist or is not a directory
    #[error("pseudopotential directory not found: {0}")]
    PseudoDirNotFound(PathBuf),
    /// Base working directory could not be created or written
    #[error("base directory {path} is not writable: {source}")]
    BaseDirNotWritable {
        /// Directory that failed the writability probe
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Retry policy for transient engine failures.
///
/// The delay doubles after each failed attempt, starting from
/// `initial_backoff`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after `failed_attempts` consecutive failures.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        self.initial_backoff * 2_u32.saturating_pow(failed_attempts.saturating_sub(1))
    }
}

/// Explicit runner configuration passed into every stage.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base working directory; stage subdirectories live under it
    pub base_dir: PathBuf,
    /// Directory searched for pseudopotential files
    pub pseudo_dir: PathBuf,
    /// Engine executable to invoke
    pub engine_command: String,
    /// Wall-clock limit for a single engine invocation
    pub timeout: Option<Duration>,
    /// Retry policy for transient engine failures
    pub retry: RetryPolicy,
}

impl RunnerConfig {
    /// Creates a configuration with explicit paths, the default engine
    /// command, no timeout, and the default retry policy.
    pub fn new(base_dir: impl Into<PathBuf>, pseudo_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            pseudo_dir: pseudo_dir.into(),
            engine_command: "pw.x".to_string(),
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Builds the configuration from the environment.
    ///
    /// `base_dir_override` (typically the first command-line argument)
    /// takes precedence over `ADSORB_BASE_DIR`.
    pub fn from_env(base_dir_override: Option<&Path>) -> Result<Self, ConfigError> {
        let base_dir = match base_dir_override {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                env::var("ADSORB_BASE_DIR")
                    .map_err(|_| ConfigError::MissingEnv("ADSORB_BASE_DIR"))?,
            ),
        };
        let pseudo_dir = PathBuf::from(
            env::var("ESPRESSO_PSEUDO_DIR")
                .map_err(|_| ConfigError::MissingEnv("ESPRESSO_PSEUDO_DIR"))?,
        );
        let engine_command = env::var("ADSORB_PW_COMMAND").unwrap_or_else(|_| "pw.x".to_string());
        let timeout = match env::var("ADSORB_TIMEOUT_SECS") {
            Ok(v) => {
                let secs: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                    var: "ADSORB_TIMEOUT_SECS",
                    value: v.clone(),
                })?;
                Some(Duration::from_secs(secs))
            }
            Err(_) => None,
        };
        Ok(Self {
            base_dir,
            pseudo_dir,
            engine_command,
            timeout,
            retry: RetryPolicy::default(),
        })
    }

    /// Validates the configuration at startup.
    ///
    /// Checks that the pseudopotential directory exists and creates the
    /// base directory, probing it for writability. Called before any stage
    /// logic runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pseudo_dir.is_dir() {
            return Err(ConfigError::PseudoDirNotFound(self.pseudo_dir.clone()));
        }
        let probe = || -> std::io::Result<()> {
            fs::create_dir_all(&self.base_dir)?;
            let marker = self.base_dir.join(".write_probe");
            fs::write(&marker, b"")?;
            fs::remove_file(&marker)?;
            Ok(())
        };
        probe().map_err(|source| ConfigError::BaseDirNotWritable {
            path: self.base_dir.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure() {
        let retry = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(10),
        };
        assert_eq!(retry.backoff(1), Duration::from_secs(10));
        assert_eq!(retry.backoff(2), Duration::from_secs(20));
        assert_eq!(retry.backoff(3), Duration::from_secs(40));
    }
}
