//! Errors surfaced by fleet and unit operations.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::transport::TransportError;

/// Errors raised while provisioning or driving a fleet.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FleetError {
    /// Raised when a fleet specification or runtime setting is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    /// Raised when no partition reports a price for the requested size.
    #[error("no price points available for size {size} ({os})")]
    PricingUnavailable {
        /// Requested unit size.
        size: String,
        /// Operating system tag used for the lookup.
        os: String,
    },
    /// Raised when a provider call fails outside a polling loop.
    #[error(transparent)]
    Provider(#[from] GatewayError),
    /// Raised when a remote command or transfer fails.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Raised when an operation needs a provider id that is not known yet.
    #[error("unit {ordinal} of fleet {fleet} has no provider id yet")]
    NotLaunched {
        /// Fleet the unit belongs to.
        fleet: String,
        /// 1-based position of the unit in the fleet.
        ordinal: usize,
    },
    /// Raised when writing retrieved artifacts fails.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Local path being written.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

impl FleetError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
