//! Process-wide provisioning settings layered via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::ConfigError;
use crate::context::WaitTimings;
use crate::price::{Price, PriceCeilingPolicy};
use crate::transport::expand_tilde;

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "{}: set {} or add {} to [fleetrun] in fleetrun.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

/// Provider region, polling cadence and local paths shared by every fleet.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLEETRUN",
    discovery(
        app_name = "fleetrun",
        env_var = "FLEETRUN_CONFIG_PATH",
        config_file_name = "fleetrun.toml",
        dotfile_name = ".fleetrun.toml",
        project_file_name = "fleetrun.toml"
    )
)]
pub struct RuntimeConfig {
    /// Provider region units are launched in.
    #[ortho_config(default = "us-east-1".to_owned())]
    pub region: String,
    /// Security group attached to every launch.
    #[ortho_config(default = "default".to_owned())]
    pub security_group: String,
    /// Directory holding `<key>.pem` private key files. Supports `~/`.
    #[ortho_config(default = "~/.ssh".to_owned())]
    pub key_dir: String,
    /// Directory holding `configuration-<fleet>.txt` user-data templates.
    pub template_dir: Option<String>,
    /// JSON fleet catalog path.
    #[ortho_config(default = "configuration.json".to_owned())]
    pub catalog_path: String,
    /// Seconds between provider state polls.
    #[ortho_config(default = 10)]
    pub poll_interval_secs: u64,
    /// Seconds allowed for a unit to answer over the remote shell.
    #[ortho_config(default = 60)]
    pub reachability_budget_secs: u64,
    /// Seconds between reachability attempts.
    #[ortho_config(default = 1)]
    pub reachability_retry_secs: u64,
    /// Consecutive `NotFound` polls tolerated before a unit is given up on.
    #[ortho_config(default = 6)]
    pub not_found_tolerance: u32,
    /// Margin added to the highest observed price, as a decimal amount.
    #[ortho_config(default = "0.2".to_owned())]
    pub price_margin: String,
}

impl RuntimeConfig {
    /// Loads configuration using defaults, configuration files and
    /// environment variables, ignoring process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("fleetrun")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that provide each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// or zero, and [`ConfigError::InvalidValue`] for an unparsable margin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.region,
                FieldMetadata::new("provider region", "FLEETRUN_REGION", "region"),
            ),
            (
                &self.security_group,
                FieldMetadata::new(
                    "security group",
                    "FLEETRUN_SECURITY_GROUP",
                    "security_group",
                ),
            ),
            (
                &self.key_dir,
                FieldMetadata::new("key directory", "FLEETRUN_KEY_DIR", "key_dir"),
            ),
        ];
        for (value, metadata) in required {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(FieldMetadata::new(
                "poll interval",
                "FLEETRUN_POLL_INTERVAL_SECS",
                "poll_interval_secs",
            )
            .missing());
        }
        if self.reachability_budget_secs == 0 {
            return Err(FieldMetadata::new(
                "reachability budget",
                "FLEETRUN_REACHABILITY_BUDGET_SECS",
                "reachability_budget_secs",
            )
            .missing());
        }
        self.price_policy().map(|_| ())
    }

    /// Parses the configured price margin into a ceiling policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the margin is not a
    /// non-negative decimal.
    pub fn price_policy(&self) -> Result<PriceCeilingPolicy, ConfigError> {
        self.price_margin
            .parse::<Price>()
            .map(|margin| PriceCeilingPolicy { margin })
            .map_err(|err| ConfigError::InvalidValue {
                field: String::from("price_margin (FLEETRUN_PRICE_MARGIN)"),
                message: err.to_string(),
            })
    }

    /// Builds the polling cadence used by unit waits.
    #[must_use]
    pub const fn timings(&self) -> WaitTimings {
        WaitTimings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            reachability_budget: Duration::from_secs(self.reachability_budget_secs),
            reachability_retry: Duration::from_secs(self.reachability_retry_secs),
            not_found_tolerance: self.not_found_tolerance,
        }
    }

    /// Key directory with `~/` expanded.
    #[must_use]
    pub fn key_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.key_dir))
    }

    /// Template directory with `~/` expanded, if configured.
    #[must_use]
    pub fn template_dir(&self) -> Option<Utf8PathBuf> {
        self.template_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(|dir| Utf8PathBuf::from(expand_tilde(dir)))
    }

    /// Catalog path with `~/` expanded.
    #[must_use]
    pub fn catalog_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.catalog_path))
    }
}
