//! Transport settings loaded via `ortho-config`.
//!
//! Defaults, configuration files and `FLEETRUN_TRANSPORT_*` environment
//! variables are merged into [`TransportConfig`], which then builds the
//! process-wide [`Transport`] backend.

use std::str::FromStr;
use std::sync::Arc;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::{DryRunTransport, ProcessCommandRunner, SshTransport, Transport, TransportError};

/// Default remote shell port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Transport implementation selected for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportBackend {
    /// Real remote shell over the system `ssh` and `scp` clients.
    Ssh,
    /// Logs every operation and touches nothing.
    DryRun,
}

impl FromStr for TransportBackend {
    type Err = TransportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "dry-run" | "dryrun" | "fake" => Ok(Self::DryRun),
            _ => Err(TransportError::UnknownBackend(raw.to_owned())),
        }
    }
}

/// Remote shell and transfer settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLEETRUN_TRANSPORT",
    discovery(
        app_name = "fleetrun",
        env_var = "FLEETRUN_CONFIG_PATH",
        config_file_name = "fleetrun.toml",
        dotfile_name = ".fleetrun.toml",
        project_file_name = "fleetrun.toml"
    )
)]
pub struct TransportConfig {
    /// Backend name: `ssh` or `dry-run`.
    #[ortho_config(default = "ssh".to_owned())]
    pub backend: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sshpass` helper used for password authentication.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Remote shell port.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null`.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Connection timeout passed to the SSH client, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

impl TransportConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment, ignoring process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Load`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, TransportError> {
        Self::load_from_iter([std::ffi::OsString::from("fleetrun")])
            .map_err(|err| TransportError::Load(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for the first empty field,
    /// or [`TransportError::UnknownBackend`] for an unrecognised backend.
    pub fn validate(&self) -> Result<(), TransportError> {
        let backend = self.backend()?;
        if backend == TransportBackend::Ssh {
            Self::require_value(&self.ssh_bin, "ssh_bin")?;
            Self::require_value(&self.scp_bin, "scp_bin")?;
            Self::require_value(&self.sshpass_bin, "sshpass_bin")?;
        }
        if self.ssh_port == 0 {
            return Err(TransportError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    /// Parses the configured backend name.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownBackend`] for unrecognised names.
    pub fn backend(&self) -> Result<TransportBackend, TransportError> {
        self.backend.parse()
    }

    /// Validates the configuration and builds the selected backend.
    ///
    /// # Errors
    ///
    /// Propagates validation failures from [`TransportConfig::validate`].
    pub fn build(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.validate()?;
        Ok(match self.backend()? {
            TransportBackend::Ssh => Arc::new(SshTransport::new(self.clone(), ProcessCommandRunner)?),
            TransportBackend::DryRun => Arc::new(DryRunTransport::new()),
        })
    }

    fn require_value(value: &str, field: &str) -> Result<(), TransportError> {
        if value.trim().is_empty() {
            return Err(TransportError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}
