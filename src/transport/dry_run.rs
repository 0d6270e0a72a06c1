//! Transport that records intent without touching any remote unit.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use super::{Endpoint, ExecOutput, Transport, TransportError};

/// Logs every operation and reports success with empty output.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunTransport;

impl DryRunTransport {
    /// Creates a dry-run transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Transport for DryRunTransport {
    fn exec(&self, endpoint: &Endpoint, command: &str) -> Result<ExecOutput, TransportError> {
        info!(host = %endpoint.host, user = %endpoint.user, command, "dry run: exec");
        Ok(ExecOutput {
            lines: Vec::new(),
            exit_code: Some(0),
        })
    }

    fn send_file(
        &self,
        endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), TransportError> {
        info!(host = %endpoint.host, local = %local, remote, "dry run: send file");
        Ok(())
    }

    fn download(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<bool, TransportError> {
        info!(host = %endpoint.host, remote, local = %local, "dry run: download");
        Ok(false)
    }

    fn receive_file(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError> {
        info!(host = %endpoint.host, remote, local = %local, "dry run: receive file");
        Ok(Vec::new())
    }
}
