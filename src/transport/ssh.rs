//! Transport backed by the system `ssh` and `scp` clients.

use std::borrow::Cow;
use std::ffi::OsString;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tracing::{debug, warn};

use super::{
    CommandOutput, CommandRunner, Endpoint, ExecOutput, ProcessCommandRunner, Transport,
    TransportConfig, TransportError, expand_tilde,
};

/// Exit status the OpenSSH client reserves for its own connection errors.
const SSH_CONNECTION_FAILURE: i32 = 255;

const MISSING_REMOTE_FILE: &str = "No such file or directory";

/// Runs remote commands and transfers through external SSH tooling.
#[derive(Clone, Debug)]
pub struct SshTransport<R: CommandRunner> {
    config: TransportConfig,
    runner: R,
}

impl SshTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: TransportConfig) -> Result<Self, TransportError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshTransport<R> {
    /// Creates a transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] when configuration
    /// validation fails.
    pub fn new(config: TransportConfig, runner: R) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns a reference to the command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Chooses the program to launch for `tool`. Key authentication runs the
    /// tool directly; password-only authentication wraps it in `sshpass`.
    fn launcher(&self, endpoint: &Endpoint, tool: &str) -> (String, Vec<OsString>) {
        let credentials = &endpoint.credentials;
        match (credentials.key_file(), credentials.password()) {
            (None, Some(password)) => (
                self.config.sshpass_bin.clone(),
                vec![
                    OsString::from("-p"),
                    OsString::from(password),
                    OsString::from(tool),
                ],
            ),
            _ => (tool.to_owned(), Vec::new()),
        }
    }

    fn common_options(&self, port_flag: &str, endpoint: &Endpoint) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(endpoint.port.to_string()),
        ];

        if let Some(key_file) = endpoint.credentials.key_file() {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(key_file.as_str())));
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args
    }

    fn build_ssh_command(&self, endpoint: &Endpoint, command: &str) -> (String, Vec<OsString>) {
        let (program, mut args) = self.launcher(endpoint, &self.config.ssh_bin);
        args.extend(self.common_options("-p", endpoint));
        args.push(OsString::from(format!("{}@{}", endpoint.user, endpoint.host)));
        args.push(OsString::from(command));
        (program, args)
    }

    fn build_scp_command(
        &self,
        endpoint: &Endpoint,
        source: String,
        destination: String,
    ) -> (String, Vec<OsString>) {
        let (program, mut args) = self.launcher(endpoint, &self.config.scp_bin);
        args.extend(self.common_options("-P", endpoint));
        args.push(OsString::from(source));
        args.push(OsString::from(destination));
        (program, args)
    }

    fn remote_spec(endpoint: &Endpoint, path: &str) -> String {
        format!(
            "{}@{}:{}",
            endpoint.user,
            endpoint.host,
            escape(Cow::Borrowed(path))
        )
    }

    fn transfer_failure(program: String, output: CommandOutput) -> TransportError {
        TransportError::CommandFailure {
            program,
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

impl<R: CommandRunner + Send + Sync> Transport for SshTransport<R> {
    /// # Security
    ///
    /// `command` is passed verbatim to the SSH client. Callers must quote any
    /// untrusted input before invoking this method.
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<ExecOutput, TransportError> {
        endpoint.credentials.validate(&endpoint.host)?;
        let (program, args) = self.build_ssh_command(endpoint, command);
        debug!(host = %endpoint.host, command, "executing remote command");
        let output = self.runner.run(&program, &args)?;

        if output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(TransportError::Unreachable {
                host: endpoint.host.clone(),
                message: output.stderr.trim().to_owned(),
            });
        }

        let lines = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(str::to_owned)
            .collect();
        Ok(ExecOutput {
            lines,
            exit_code: output.code,
        })
    }

    fn send_file(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransportError> {
        endpoint.credentials.validate(&endpoint.host)?;
        let (program, args) = self.build_scp_command(
            endpoint,
            local.to_string(),
            Self::remote_spec(endpoint, remote),
        );
        debug!(host = %endpoint.host, local = %local, remote, "uploading file");
        let output = self.runner.run(&program, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(Self::transfer_failure(program, output))
    }

    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<bool, TransportError> {
        endpoint.credentials.validate(&endpoint.host)?;
        let (program, args) = self.build_scp_command(
            endpoint,
            Self::remote_spec(endpoint, remote),
            local.to_string(),
        );
        debug!(host = %endpoint.host, remote, local = %local, "downloading file");
        let output = self.runner.run(&program, &args)?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains(MISSING_REMOTE_FILE) {
            warn!(host = %endpoint.host, remote, "remote file does not exist");
            return Ok(false);
        }
        Err(Self::transfer_failure(program, output))
    }
}
