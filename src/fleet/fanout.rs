//! Operations applied to every unit of a fleet.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::transport::{BackgroundExec, Endpoint, ExecOutput, Transport, TransportError};

use super::{FanOutReport, Fleet, UnitOutcome};

/// Lifecycle command stored as a fleet parameter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Hook {
    /// Starts the workload.
    Starter,
    /// Stops the workload.
    Stopper,
    /// Updates the workload in place.
    Updater,
    /// Fetches workload inputs.
    Downloader,
    /// Installs the workload.
    Installer,
}

impl Hook {
    /// Parameter holding the hook's command line.
    #[must_use]
    pub const fn parameter(self) -> &'static str {
        match self {
            Self::Starter => "STARTER",
            Self::Stopper => "STOPPER",
            Self::Updater => "UPDATER",
            Self::Downloader => "DOWNLOADER",
            Self::Installer => "INSTALLER",
        }
    }
}

impl Fleet {
    /// Waits for every unit in turn, stopping at the first that fails.
    /// An empty fleet is never ready.
    pub async fn wait_until_all_ready(&mut self, initialized_is_enough: bool) -> bool {
        if self.units.is_empty() {
            warn!(fleet = self.name(), "no units to wait for");
            return false;
        }
        for (index, unit) in self.units.iter_mut().enumerate() {
            if !unit.wait_until_ready(initialized_is_enough).await {
                warn!(fleet = %self.spec.name(), ordinal = index + 1, "unit never became ready");
                return false;
            }
        }
        info!(fleet = self.name(), units = self.units.len(), "all units ready");
        true
    }

    /// Waits for every unit in turn to answer over the remote shell,
    /// stopping at the first that does not.
    pub async fn wait_until_all_reachable(&mut self) -> bool {
        if self.units.is_empty() {
            warn!(fleet = self.name(), "no units to probe");
            return false;
        }
        for (index, unit) in self.units.iter_mut().enumerate() {
            if !unit.wait_until_reachable().await {
                warn!(fleet = %self.spec.name(), ordinal = index + 1, "unit not reachable");
                return false;
            }
        }
        true
    }

    /// Runs `command` on every unit, one thread per unit, and reports each
    /// unit's output lines. A unit that cannot be reached is reported as a
    /// failure; the others still run. Non-zero remote exits are listed in
    /// [`FanOutReport::unsuccessful_exits`].
    pub async fn exec_on_all(&mut self, command: &str) -> FanOutReport<Vec<String>> {
        let mut targets = Vec::with_capacity(self.units.len());
        let mut endpoints = Vec::with_capacity(self.units.len());
        for (index, unit) in self.units.iter_mut().enumerate() {
            targets.push((index + 1, unit.provider_id().cloned()));
            endpoints.push(unit.endpoint().await);
        }

        let transport = Arc::clone(&self.ctx.transport);
        let owned = command.to_owned();
        let count = endpoints.len();
        let results = tokio::task::spawn_blocking(move || {
            exec_scoped(transport.as_ref(), &endpoints, &owned)
        })
        .await
        .unwrap_or_else(|err| {
            let failure = TransportError::Background {
                message: err.to_string(),
            };
            vec![Err(failure); count]
        });

        let mut outcomes = Vec::with_capacity(count);
        let mut remote_exits = Vec::new();
        for ((ordinal, provider_id), result) in targets.into_iter().zip(results) {
            let mapped = match result {
                Ok(output) => {
                    if !output.is_success() {
                        warn!(
                            fleet = %self.spec.name(),
                            ordinal,
                            exit_code = ?output.exit_code,
                            command,
                            "command exited unsuccessfully"
                        );
                        remote_exits.push((ordinal, output.exit_code));
                    }
                    Ok(output.lines)
                }
                Err(err) => {
                    warn!(fleet = %self.spec.name(), ordinal, error = %err, "command failed");
                    Err(FleetError::from(err))
                }
            };
            outcomes.push(UnitOutcome {
                ordinal,
                provider_id,
                result: mapped,
            });
        }
        FanOutReport::new(outcomes).with_remote_exits(remote_exits)
    }

    /// Starts `command` on every unit without waiting for it.
    pub async fn exec_in_background_on_all(&mut self, command: &str) -> FanOutReport<BackgroundExec> {
        let mut outcomes = Vec::with_capacity(self.units.len());
        for (index, unit) in self.units.iter_mut().enumerate() {
            let result = unit
                .exec_in_background(command)
                .await
                .map_err(FleetError::from);
            outcomes.push(UnitOutcome {
                ordinal: index + 1,
                provider_id: unit.provider_id().cloned(),
                result,
            });
        }
        FanOutReport::new(outcomes)
    }

    /// Runs the command stored under the hook's parameter on every unit.
    /// Without such a parameter nothing runs and the report is empty.
    pub async fn exec_hook(&mut self, hook: Hook) -> FanOutReport<Vec<String>> {
        let Some(command) = self
            .spec
            .parameter(hook.parameter())
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .map(str::to_owned)
        else {
            debug!(fleet = self.name(), hook = hook.parameter(), "hook not configured");
            return FanOutReport::default();
        };
        info!(fleet = self.name(), hook = hook.parameter(), "running hook");
        self.exec_on_all(&command).await
    }

    /// Runs the `STARTER` hook.
    pub async fn exec_starter(&mut self) -> FanOutReport<Vec<String>> {
        self.exec_hook(Hook::Starter).await
    }

    /// Runs the `STOPPER` hook.
    pub async fn exec_stopper(&mut self) -> FanOutReport<Vec<String>> {
        self.exec_hook(Hook::Stopper).await
    }

    /// Runs the `UPDATER` hook.
    pub async fn exec_updater(&mut self) -> FanOutReport<Vec<String>> {
        self.exec_hook(Hook::Updater).await
    }

    /// Runs the `DOWNLOADER` hook.
    pub async fn exec_downloader(&mut self) -> FanOutReport<Vec<String>> {
        self.exec_hook(Hook::Downloader).await
    }

    /// Runs the `INSTALLER` hook.
    pub async fn exec_installer(&mut self) -> FanOutReport<Vec<String>> {
        self.exec_hook(Hook::Installer).await
    }

    /// Terminates every unit and empties the fleet, whatever the individual
    /// outcomes.
    pub async fn terminate_all(&mut self) -> FanOutReport<()> {
        let units = std::mem::take(&mut self.units);
        let mut outcomes = Vec::with_capacity(units.len());
        for (index, mut unit) in units.into_iter().enumerate() {
            let result = unit.terminate().await;
            if let Err(err) = &result {
                warn!(fleet = self.name(), unit = %unit.label(), error = %err, "termination failed");
            }
            outcomes.push(UnitOutcome {
                ordinal: index + 1,
                provider_id: unit.provider_id().cloned(),
                result,
            });
        }
        if !outcomes.is_empty() {
            info!(fleet = self.name(), run = %self.run_tag, units = outcomes.len(), "terminated fleet");
        }
        FanOutReport::new(outcomes)
    }

    /// Reboots every unit.
    pub async fn reboot_all(&self) -> FanOutReport<()> {
        let mut outcomes = Vec::with_capacity(self.units.len());
        for (index, unit) in self.units.iter().enumerate() {
            outcomes.push(UnitOutcome {
                ordinal: index + 1,
                provider_id: unit.provider_id().cloned(),
                result: unit.reboot().await,
            });
        }
        FanOutReport::new(outcomes)
    }

    /// Tags every unit `<fleet><ordinal>`.
    pub async fn tag_all(&self) -> FanOutReport<()> {
        let mut outcomes = Vec::with_capacity(self.units.len());
        for (index, unit) in self.units.iter().enumerate() {
            let ordinal = index + 1;
            let name = format!("{}{ordinal}", self.name());
            outcomes.push(UnitOutcome {
                ordinal,
                provider_id: unit.provider_id().cloned(),
                result: unit.tag(&name).await,
            });
        }
        FanOutReport::new(outcomes)
    }

    /// Resolved addresses of the units that have one, in unit order.
    pub async fn addresses(&mut self) -> Vec<String> {
        let mut addresses = Vec::with_capacity(self.units.len());
        for unit in &mut self.units {
            if let Some(address) = unit.resolve_address().await {
                addresses.push(address);
            }
        }
        addresses
    }
}

fn exec_scoped(
    transport: &dyn Transport,
    endpoints: &[Result<Endpoint, TransportError>],
    command: &str,
) -> Vec<Result<ExecOutput, TransportError>> {
    thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .iter()
            .map(|target| {
                target
                    .clone()
                    .map(|endpoint| scope.spawn(move || transport.exec(&endpoint, command)))
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.and_then(|running| {
                    running.join().unwrap_or_else(|_| {
                        Err(TransportError::Background {
                            message: String::from("exec thread panicked"),
                        })
                    })
                })
            })
            .collect()
    })
}
