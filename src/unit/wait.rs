//! Readiness and reachability wait loops for a unit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::gateway::{BidState, UnitState};

use super::{RemoteUnit, run_blocking};

const REACHABILITY_PROBE: &str = "echo ok";

impl RemoteUnit {
    /// Waits for the unit's bid (if any) and then the unit itself to become
    /// ready. With `initialized_is_enough`, a unit still running its status
    /// checks is accepted. Returns `false` on a terminal provider state or
    /// when the wait is interrupted.
    pub async fn wait_until_ready(&mut self, initialized_is_enough: bool) -> bool {
        if self.bid_id.is_some() && !self.wait_for_bid().await {
            return false;
        }
        self.wait_for_unit(initialized_is_enough).await
    }

    async fn wait_for_bid(&mut self) -> bool {
        loop {
            match self.refresh_bid().await {
                Ok(BidState::Active) => {
                    debug!(unit = %self.label(), "bid fulfilled");
                    return true;
                }
                Ok(BidState::Open) => {
                    debug!(unit = %self.label(), state = BidState::Open.as_str(), "bid still open");
                }
                Ok(BidState::NotFound) if self.provider_id.is_some() => {
                    debug!(
                        unit = %self.label(),
                        "bid vanished but the unit is known; it may have been converted to a direct run"
                    );
                    return true;
                }
                Ok(state) => {
                    warn!(unit = %self.label(), state = state.as_str(), "bid will not be fulfilled");
                    return false;
                }
                Err(err) => {
                    warn!(unit = %self.label(), error = %err, "bid query failed; retrying");
                }
            }

            if !self.pause_poll().await {
                return false;
            }
        }
    }

    async fn wait_for_unit(&mut self, initialized_is_enough: bool) -> bool {
        if self.provider_id.is_none() {
            warn!(unit = %self.label(), "unit has no provider id to wait on");
            return false;
        }

        let tolerance = self.ctx.timings.not_found_tolerance;
        let mut consecutive_not_found = 0_u32;
        loop {
            match self.refresh_state().await {
                Ok(UnitState::Ready) => {
                    info!(unit = %self.label(), "unit ready");
                    return true;
                }
                Ok(UnitState::Initializing) if initialized_is_enough => {
                    info!(unit = %self.label(), "unit initializing, accepted");
                    return true;
                }
                Ok(UnitState::Initializing) => {
                    consecutive_not_found = 0;
                    debug!(unit = %self.label(), "unit initializing");
                }
                Ok(UnitState::NotFound) => {
                    consecutive_not_found = consecutive_not_found.saturating_add(1);
                    if consecutive_not_found > tolerance {
                        warn!(
                            unit = %self.label(),
                            polls = consecutive_not_found,
                            "unit still unknown to the provider; giving up"
                        );
                        return false;
                    }
                    debug!(unit = %self.label(), polls = consecutive_not_found, "unit not visible yet");
                }
                Ok(UnitState::Unrecognized) => {
                    warn!(unit = %self.label(), "unit reported an unrecognized state");
                    return false;
                }
                Err(err) => {
                    warn!(unit = %self.label(), error = %err, "unit query failed; retrying");
                }
            }

            if !self.pause_poll().await {
                return false;
            }
        }
    }

    /// Retries `echo ok` over the transport until it exits successfully or
    /// the reachability budget elapses. Never errors.
    pub async fn wait_until_reachable(&mut self) -> bool {
        let clock = Arc::clone(&self.ctx.clock);
        let budget = self.ctx.timings.reachability_budget;
        let retry = self.ctx.timings.reachability_retry;
        let started = clock.now();

        loop {
            match self.probe().await {
                Ok(()) => {
                    info!(unit = %self.label(), "unit reachable");
                    return true;
                }
                Err(reason) => debug!(unit = %self.label(), reason = %reason, "unit not reachable yet"),
            }

            if clock.now().saturating_duration_since(started) >= budget {
                warn!(unit = %self.label(), budget_secs = budget.as_secs(), "unit never became reachable");
                return false;
            }
            if clock.pause(retry).await.is_err() {
                info!(unit = %self.label(), "reachability wait interrupted");
                return false;
            }
        }
    }

    async fn probe(&mut self) -> Result<(), String> {
        let endpoint = self.endpoint().await.map_err(|err| err.to_string())?;
        let transport = Arc::clone(&self.ctx.transport);
        let output = run_blocking(move || transport.exec(&endpoint, REACHABILITY_PROBE))
            .await
            .map_err(|err| err.to_string())?;
        if output.is_success() {
            Ok(())
        } else {
            Err(format!(
                "probe exited with {}",
                output
                    .exit_code
                    .map_or_else(|| String::from("unknown status"), |code| code.to_string())
            ))
        }
    }

    async fn pause_poll(&self) -> bool {
        let interval = self.ctx.timings.poll_interval;
        if self.ctx.clock.pause(interval).await.is_err() {
            info!(unit = %self.label(), "wait interrupted");
            return false;
        }
        true
    }
}
