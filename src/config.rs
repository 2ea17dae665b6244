//! Configuration for the purchase manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Purchase manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Treat the durable receipt record itself as the grant instead of
    /// consulting the trust authority. Intended for development builds and
    /// titles without a verification backend.
    #[serde(default)]
    pub in_app_verify: bool,

    /// Verify receipts against the sandbox endpoint instead of production.
    #[serde(default)]
    pub sandbox: bool,

    /// Directory holding pending receipt records.
    #[serde(default = "default_receipt_dir")]
    pub receipt_dir: PathBuf,

    /// Verification client settings.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Verification sweep settings.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Verification client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Trust authority endpoint for production receipts.
    #[serde(default)]
    pub endpoint: String,

    /// Trust authority endpoint for sandbox receipts.
    #[serde(default)]
    pub sandbox_endpoint: String,

    /// Timeout for a single verification request, in seconds.
    #[serde(default = "default_verify_timeout_secs")]
    pub timeout_secs: u64,
}

/// Verification sweep settings.
///
/// The sweep retries unresolved receipts forever; these values only shape
/// how quickly it backs off between rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Delay before the first retry after an unresolved round, in
    /// milliseconds.
    #[serde(default = "default_sweep_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Ceiling for the retry delay, in milliseconds.
    #[serde(default = "default_sweep_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after each unresolved round. Must be
    /// greater than 1 so the delay strictly grows until it hits the ceiling.
    #[serde(default = "default_sweep_multiplier")]
    pub multiplier: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            in_app_verify: false,
            sandbox: false,
            receipt_dir: default_receipt_dir(),
            verify: VerifyConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            sandbox_endpoint: String::new(),
            timeout_secs: default_verify_timeout_secs(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_sweep_initial_delay_ms(),
            max_delay_ms: default_sweep_max_delay_ms(),
            multiplier: default_sweep_multiplier(),
        }
    }
}

fn default_receipt_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "paydesk")
        .map(|dirs| dirs.data_dir().join("receipts"))
        .unwrap_or_else(|| PathBuf::from(".paydesk/receipts"))
}

const fn default_verify_timeout_secs() -> u64 {
    30
}

const fn default_sweep_initial_delay_ms() -> u64 {
    1000 // 1 second
}

const fn default_sweep_max_delay_ms() -> u64 {
    300_000 // 5 minutes
}

const fn default_sweep_multiplier() -> f64 {
    2.0
}

impl ManagerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the configuration for values the manager cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep schedule is degenerate.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sweep.initial_delay_ms == 0 {
            return Err(crate::Error::Config(
                "sweep initial delay must be positive".to_string(),
            ));
        }
        if self.sweep.max_delay_ms < self.sweep.initial_delay_ms {
            return Err(crate::Error::Config(
                "sweep delay ceiling is below the initial delay".to_string(),
            ));
        }
        if self.sweep.multiplier <= 1.0 {
            return Err(crate::Error::Config(
                "sweep multiplier must be greater than 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl VerifyConfig {
    /// Endpoint to verify against, honoring the sandbox switch.
    #[must_use]
    pub fn endpoint_for(&self, sandbox: bool) -> &str {
        if sandbox {
            &self.sandbox_endpoint
        } else {
            &self.endpoint
        }
    }
}
