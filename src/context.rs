//! Collaborators and settings shared by every unit of a fleet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::gateway::ProviderGateway;
use crate::transport::{DEFAULT_SSH_PORT, Transport};

/// Default pause between provider state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Default wall-clock budget for a unit to answer over the remote shell.
pub const DEFAULT_REACHABILITY_BUDGET: Duration = Duration::from_secs(60);
/// Default pause between reachability attempts.
pub const DEFAULT_REACHABILITY_RETRY: Duration = Duration::from_secs(1);
/// Default number of consecutive `NotFound` polls tolerated.
pub const DEFAULT_NOT_FOUND_TOLERANCE: u32 = 6;

/// Polling cadence for unit waits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitTimings {
    /// Pause between provider state polls.
    pub poll_interval: Duration,
    /// Wall-clock budget for reachability checks.
    pub reachability_budget: Duration,
    /// Pause between reachability attempts.
    pub reachability_retry: Duration,
    /// Consecutive `NotFound` unit polls tolerated before giving up.
    pub not_found_tolerance: u32,
}

impl Default for WaitTimings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reachability_budget: DEFAULT_REACHABILITY_BUDGET,
            reachability_retry: DEFAULT_REACHABILITY_RETRY,
            not_found_tolerance: DEFAULT_NOT_FOUND_TOLERANCE,
        }
    }
}

/// Gateway, transport, clock and provider settings injected into fleets.
pub struct FleetContext {
    /// Cloud API.
    pub gateway: Arc<dyn ProviderGateway>,
    /// Remote shell backend.
    pub transport: Arc<dyn Transport>,
    /// Time source for polling loops.
    pub clock: Arc<dyn Clock>,
    /// Polling cadence.
    pub timings: WaitTimings,
    /// Provider region.
    pub region: String,
    /// Security group attached to launches.
    pub security_group: String,
    /// Remote shell port.
    pub ssh_port: u16,
    /// Directory holding private key files.
    pub key_dir: Utf8PathBuf,
    /// Directory holding user-data templates.
    pub template_dir: Option<Utf8PathBuf>,
    /// Positional arguments substituted into user-data templates.
    pub user_data_args: Vec<String>,
}

impl FleetContext {
    /// Creates a context with default settings.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ProviderGateway>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            transport,
            clock,
            timings: WaitTimings::default(),
            region: String::from("us-east-1"),
            security_group: String::from("default"),
            ssh_port: DEFAULT_SSH_PORT,
            key_dir: Utf8PathBuf::from("."),
            template_dir: None,
            user_data_args: Vec::new(),
        }
    }

    /// Applies region, paths and timings from layered runtime settings.
    #[must_use]
    pub fn with_runtime(mut self, runtime: &RuntimeConfig) -> Self {
        self.timings = runtime.timings();
        self.region.clone_from(&runtime.region);
        self.security_group.clone_from(&runtime.security_group);
        self.key_dir = runtime.key_dir();
        self.template_dir = runtime.template_dir();
        self
    }

    /// Overrides the polling cadence.
    #[must_use]
    pub const fn with_timings(mut self, timings: WaitTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Overrides the remote shell port.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Sets the arguments substituted into user-data templates.
    #[must_use]
    pub fn with_user_data_args(mut self, args: Vec<String>) -> Self {
        self.user_data_args = args;
        self
    }

    /// Sets the user-data template directory.
    #[must_use]
    pub fn with_template_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.template_dir = dir;
        self
    }

    /// Sets the private key directory.
    #[must_use]
    pub fn with_key_dir(mut self, dir: Utf8PathBuf) -> Self {
        self.key_dir = dir;
        self
    }
}

impl fmt::Debug for FleetContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetContext")
            .field("timings", &self.timings)
            .field("region", &self.region)
            .field("security_group", &self.security_group)
            .field("ssh_port", &self.ssh_port)
            .field("key_dir", &self.key_dir)
            .field("template_dir", &self.template_dir)
            .finish_non_exhaustive()
    }
}
