//! Fleet specifications, the fleet catalog and layered runtime settings.
//!
//! A [`FleetSpec`] is immutable once built: every field is trimmed and
//! validated by [`FleetSpecBuilder::build`]. Named parameters are stored with
//! upper-cased keys and looked up case-insensitively.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::price::{Price, PriceCeilingPolicy};

mod catalog;
mod runtime;

pub use catalog::FleetCatalog;
pub use runtime::RuntimeConfig;

/// Parameter listing remote files to pull back after a run.
pub const RETRIEVE_FILES_PARAM: &str = "RETRIEVE_FILES";
/// Parameter listing remote paths removed by the cleanup fan-out.
pub const DELETE_FILES_PARAM: &str = "DELETE_FILES";
/// Parameter listing provider metrics exported per unit.
pub const METRICS_PARAM: &str = "METRICS";

const LIST_SEPARATOR: char = ';';
const KEY_FILE_EXTENSION: &str = "pem";

/// Immutable description of a fleet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FleetSpec {
    name: String,
    image_id: String,
    size: String,
    dont_override_size: bool,
    desired_count: u32,
    disk_size_gb: u32,
    price_policy: PriceCeilingPolicy,
    os: String,
    key_name: Option<String>,
    ssh_user: String,
    ssh_password: Option<String>,
    provider: Option<String>,
    params: BTreeMap<String, String>,
}

impl FleetSpec {
    /// Convenience accessor for the builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> FleetSpecBuilder {
        FleetSpecBuilder::new(name)
    }

    /// Fleet name, also used as the prefix for per-unit directories.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image every unit boots from.
    #[must_use]
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Provider size (instance type) of every unit.
    #[must_use]
    pub fn size(&self) -> &str {
        &self.size
    }

    /// Number of units the fleet should converge to.
    #[must_use]
    pub const fn desired_count(&self) -> u32 {
        self.desired_count
    }

    /// Root disk size in GB.
    #[must_use]
    pub const fn disk_size_gb(&self) -> u32 {
        self.disk_size_gb
    }

    /// Policy turning observed prices into a bid ceiling.
    #[must_use]
    pub const fn price_policy(&self) -> PriceCeilingPolicy {
        self.price_policy
    }

    /// Operating system tag used for price lookups.
    #[must_use]
    pub fn os(&self) -> &str {
        &self.os
    }

    /// Key identifier registered with the provider.
    #[must_use]
    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// Remote shell user.
    #[must_use]
    pub fn ssh_user(&self) -> &str {
        &self.ssh_user
    }

    /// Remote shell password, if password authentication is configured.
    #[must_use]
    pub fn ssh_password(&self) -> Option<&str> {
        self.ssh_password.as_deref()
    }

    /// Optional provider tag.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// All named parameters keyed by upper-cased name.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Looks up a named parameter, ignoring case.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_uppercase()).map(String::as_str)
    }

    /// Splits a semicolon separated parameter into its non-empty entries.
    /// An absent parameter yields an empty list.
    #[must_use]
    pub fn list_parameter(&self, key: &str) -> Vec<String> {
        self.parameter(key)
            .map(|raw| {
                raw.split(LIST_SEPARATOR)
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves the private key file for the configured key identifier
    /// inside `key_dir`, appending `.pem` unless already present.
    #[must_use]
    pub fn key_file(&self, key_dir: &Utf8Path) -> Option<Utf8PathBuf> {
        let key = self.key_name.as_deref()?;
        let path = key_dir.join(key);
        if path.extension() == Some(KEY_FILE_EXTENSION) {
            Some(path)
        } else {
            Some(key_dir.join(format!("{key}.{KEY_FILE_EXTENSION}")))
        }
    }

    /// Applies caller overrides. The size is replaced unless the spec pins
    /// it; the count is replaced when the override is positive.
    #[must_use]
    pub fn with_overrides(&self, size: Option<&str>, count: Option<u32>) -> Self {
        let mut spec = self.clone();
        if let Some(override_size) = size.map(str::trim).filter(|value| !value.is_empty())
            && !self.dont_override_size
        {
            override_size.clone_into(&mut spec.size);
        }
        if let Some(override_count) = count.filter(|value| *value > 0) {
            spec.desired_count = override_count;
        }
        spec
    }
}

/// Builder for [`FleetSpec`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FleetSpecBuilder {
    name: String,
    image_id: String,
    size: String,
    dont_override_size: bool,
    count: i64,
    disk_size_gb: i64,
    price_margin: Option<Price>,
    os: String,
    key_name: Option<String>,
    ssh_user: String,
    ssh_password: Option<String>,
    provider: Option<String>,
    params: BTreeMap<String, String>,
}

impl FleetSpecBuilder {
    /// Creates a builder for the named fleet; other fields must be populated
    /// before build.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the image identifier.
    #[must_use]
    pub fn image_id(mut self, value: impl Into<String>) -> Self {
        self.image_id = value.into();
        self
    }

    /// Sets the unit size.
    #[must_use]
    pub fn size(mut self, value: impl Into<String>) -> Self {
        self.size = value.into();
        self
    }

    /// Pins the size so that [`FleetSpec::with_overrides`] leaves it alone.
    #[must_use]
    pub const fn dont_override_size(mut self, value: bool) -> Self {
        self.dont_override_size = value;
        self
    }

    /// Sets the desired unit count.
    #[must_use]
    pub const fn count(mut self, value: i64) -> Self {
        self.count = value;
        self
    }

    /// Sets the root disk size in GB.
    #[must_use]
    pub const fn disk_size_gb(mut self, value: i64) -> Self {
        self.disk_size_gb = value;
        self
    }

    /// Overrides the default price margin.
    #[must_use]
    pub const fn price_margin(mut self, value: Price) -> Self {
        self.price_margin = Some(value);
        self
    }

    /// Sets the operating system tag.
    #[must_use]
    pub fn os(mut self, value: impl Into<String>) -> Self {
        self.os = value.into();
        self
    }

    /// Sets the key identifier.
    #[must_use]
    pub fn key_name(mut self, value: Option<String>) -> Self {
        self.key_name = value;
        self
    }

    /// Sets the remote shell user.
    #[must_use]
    pub fn ssh_user(mut self, value: impl Into<String>) -> Self {
        self.ssh_user = value.into();
        self
    }

    /// Sets the optional remote shell password.
    #[must_use]
    pub fn ssh_password(mut self, value: Option<String>) -> Self {
        self.ssh_password = value;
        self
    }

    /// Sets the optional provider tag.
    #[must_use]
    pub fn provider(mut self, value: Option<String>) -> Self {
        self.provider = value;
        self
    }

    /// Adds a named parameter; the key is upper-cased.
    #[must_use]
    pub fn parameter(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.params
            .insert(key.as_ref().trim().to_uppercase(), value.into());
        self
    }

    /// Builds and validates the [`FleetSpec`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required strings,
    /// [`ConfigError::InvalidValue`] for a non-positive count or disk size,
    /// and [`ConfigError::MissingCredentials`] when neither a password nor a
    /// key identifier is configured.
    pub fn build(self) -> Result<FleetSpec, ConfigError> {
        let trimmed = |value: Option<String>| {
            value
                .map(|raw| raw.trim().to_owned())
                .filter(|raw| !raw.is_empty())
        };

        let name = Self::require(&self.name, "name", "")?;
        let image_id = Self::require(&self.image_id, "AMI", &name)?;
        let size = Self::require(&self.size, "size", &name)?;
        let ssh_user = Self::require(&self.ssh_user, "SSH_user", &name)?;
        let desired_count = Self::positive(self.count, "instances", &name)?;
        let disk_size_gb = Self::positive(self.disk_size_gb, "disk", &name)?;
        let key_name = trimmed(self.key_name);
        let ssh_password = trimmed(self.ssh_password);
        if key_name.is_none() && ssh_password.is_none() {
            return Err(ConfigError::MissingCredentials { fleet: name });
        }

        let price_policy = self
            .price_margin
            .map_or_else(PriceCeilingPolicy::default, |margin| PriceCeilingPolicy {
                margin,
            });

        Ok(FleetSpec {
            image_id,
            size,
            dont_override_size: self.dont_override_size,
            desired_count,
            disk_size_gb,
            price_policy,
            os: self.os.trim().to_owned(),
            key_name,
            ssh_user,
            ssh_password,
            provider: trimmed(self.provider),
            params: self.params,
            name,
        })
    }

    fn require(value: &str, field: &str, fleet: &str) -> Result<String, ConfigError> {
        let cleaned = value.trim();
        if cleaned.is_empty() {
            return Err(ConfigError::MissingField(if fleet.is_empty() {
                format!("fleet {field}")
            } else {
                format!("{field} for fleet `{fleet}`")
            }));
        }
        Ok(cleaned.to_owned())
    }

    fn positive(value: i64, field: &str, fleet: &str) -> Result<u32, ConfigError> {
        u32::try_from(value)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: format!("{field} for fleet `{fleet}`"),
                message: format!("expected a positive integer, got {value}"),
            })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field is present but unusable.
    #[error("invalid {field}: {message}")]
    InvalidValue {
        /// Field that failed validation.
        field: String,
        /// Reason the value was rejected.
        message: String,
    },
    /// Indicates a fleet has neither a password nor a key identifier.
    #[error("fleet `{fleet}` needs an SSH password or a key pair name")]
    MissingCredentials {
        /// Fleet lacking credentials.
        fleet: String,
    },
    /// Indicates a catalog lookup found nothing.
    #[error("fleet `{0}` not found in the catalog")]
    UnknownFleet(String),
    /// Surfaces errors from the `ortho-config` loader or the catalog parser.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Indicates a configuration file could not be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// File being read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}
