//! Remote command execution and file transfer against a single endpoint.
//!
//! A [`Transport`] backend is chosen once per run through
//! [`TransportConfig::build`] and handed to the fleet as a shared trait
//! object, so unit code never depends on which backend is active.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, warn};

mod config;
mod dry_run;
mod glob;
mod process;
mod ssh;
mod util;

pub use config::{DEFAULT_SSH_PORT, TransportBackend, TransportConfig};
pub use dry_run::DryRunTransport;
pub use glob::{RemoteGlob, shell_pattern};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::SshTransport;
pub use util::expand_tilde;

/// Authentication material for an endpoint. At least one of the two must be
/// present.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Password for password authentication.
    pub password: Option<String>,
    /// Private key file for public key authentication.
    pub key_file: Option<Utf8PathBuf>,
}

impl Credentials {
    /// Returns the password when it is present and non-blank.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns the key file when it is present and non-blank.
    #[must_use]
    pub fn key_file(&self) -> Option<&Utf8Path> {
        self.key_file
            .as_deref()
            .filter(|path| !path.as_str().trim().is_empty())
    }

    /// Ensures a usable credential is available.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MissingCredentials`] when neither a password
    /// nor a key file is configured.
    pub fn validate(&self, host: &str) -> Result<(), TransportError> {
        if self.password().is_none() && self.key_file().is_none() {
            return Err(TransportError::MissingCredentials {
                host: host.to_owned(),
            });
        }
        Ok(())
    }
}

/// Connection details for one remote unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    /// Address or hostname of the unit.
    pub host: String,
    /// Remote shell port.
    pub port: u16,
    /// Remote user to connect as.
    pub user: String,
    /// Authentication material.
    pub credentials: Credentials,
}

/// Output of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutput {
    /// Standard output lines followed by standard error lines, in order.
    pub lines: Vec<String>,
    /// Exit status reported by the remote side, if available.
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Errors surfaced by transport backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when neither a password nor a key file is available.
    #[error("no password or key file configured for {host}")]
    MissingCredentials {
        /// Endpoint the operation targeted.
        host: String,
    },
    /// Raised when the unit has no address or refuses the connection.
    #[error("unit {host} is not remotely reachable: {message}")]
    Unreachable {
        /// Endpoint the operation targeted.
        host: String,
        /// Description of the connection failure.
        message: String,
    },
    /// Raised when a local helper program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a transfer command exits unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program used for the operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when local file system preparation fails.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Local path being prepared.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a remote glob cannot be mapped onto a local pattern.
    #[error("invalid transfer pattern `{pattern}`: {message}")]
    InvalidPattern {
        /// Offending pattern.
        pattern: String,
        /// Reason the pattern was rejected.
        message: String,
    },
    /// Raised when a background execution thread panics.
    #[error("background execution failed: {message}")]
    Background {
        /// Panic payload, when it was a string.
        message: String,
    },
    /// Raised when transport configuration is missing required values.
    #[error("missing {field}: set FLEETRUN_TRANSPORT_{env_suffix} or add {field} to [transport] in fleetrun.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when layered configuration sources cannot be merged.
    #[error("transport configuration parsing failed: {0}")]
    Load(String),
    /// Raised when the configured backend name is unknown.
    #[error("unknown transport backend `{0}` (expected `ssh` or `dry-run`)")]
    UnknownBackend(String),
}

/// Blocking remote command and file transfer capability.
pub trait Transport: Send + Sync {
    /// Runs `command` on the endpoint and returns its output lines.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the endpoint cannot be reached or the
    /// local helper cannot run. A non-zero remote exit status is reported in
    /// [`ExecOutput::exit_code`], not as an error.
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<ExecOutput, TransportError>;

    /// Uploads `local` to `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transfer fails.
    fn send_file(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransportError>;

    /// Downloads exactly one remote file. Returns `false` when the remote
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transfer fails for any other
    /// reason.
    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<bool, TransportError>;

    /// Downloads `remote` to `local` and returns the local files written.
    ///
    /// A remote path containing glob wildcards is listed on the unit first;
    /// each match is downloaded to the local pattern with its wildcards
    /// replaced, in order, by the segments the remote wildcards matched. A
    /// local path without wildcards, or an existing local directory, receives
    /// files under their remote file names.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when listing or any download fails.
    fn receive_file(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError> {
        if !glob::has_wildcards(remote) {
            let destination = if local.is_dir() {
                local.join(glob::file_name(remote))
            } else {
                local.to_path_buf()
            };
            ensure_parent(&destination)?;
            return Ok(if self.download(endpoint, remote, &destination)? {
                vec![destination]
            } else {
                Vec::new()
            });
        }

        let pattern = RemoteGlob::new(remote, local.as_str())?;
        let listing = self.exec(endpoint, &pattern.listing_command())?;
        let mut received = Vec::new();
        for matched in listing.lines.iter().map(|line| line.trim()) {
            let Some(destination) = pattern.destination_for(matched) else {
                continue;
            };
            ensure_parent(&destination)?;
            if self.download(endpoint, matched, &destination)? {
                received.push(destination);
            }
        }

        if received.is_empty() {
            warn!(host = %endpoint.host, pattern = remote, "no remote files matched");
        }
        Ok(received)
    }
}

/// Creates the parent directory of `path` when it does not exist yet.
pub(crate) fn ensure_parent(path: &Utf8Path) -> Result<(), TransportError> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) else {
        return Ok(());
    };
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| TransportError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })
}

/// Handle to a command running on a worker thread.
#[derive(Debug)]
pub struct BackgroundExec {
    host: String,
    handle: JoinHandle<Result<ExecOutput, TransportError>>,
}

impl BackgroundExec {
    /// Returns the host the command runs against.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns `true` once the worker thread has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the command to finish and returns its output.
    ///
    /// # Errors
    ///
    /// Returns the command's [`TransportError`], or
    /// [`TransportError::Background`] when the worker thread panicked.
    pub fn join(self) -> Result<ExecOutput, TransportError> {
        self.handle.join().unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|text| (*text).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("worker thread panicked"));
            Err(TransportError::Background { message })
        })
    }
}

/// Runs `command` on a worker thread and returns a joinable handle.
#[must_use]
pub fn exec_in_background(
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    command: String,
) -> BackgroundExec {
    let host = endpoint.host.clone();
    debug!(host = %host, command = %command, "starting background command");
    let handle = thread::spawn(move || transport.exec(&endpoint, &command));
    BackgroundExec { host, handle }
}

#[cfg(test)]
mod tests;
