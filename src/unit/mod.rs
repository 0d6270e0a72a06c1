//! A single provisioned compute unit and its provider state machine.
//!
//! A [`RemoteUnit`] is created when a bid or direct run returns. It learns
//! its provider id from bid descriptions, caches its address once known and
//! reaches the remote shell through the fleet's shared [`Transport`].

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::config::FleetSpec;
use crate::context::FleetContext;
use crate::error::FleetError;
use crate::gateway::{BidState, GatewayError, UnitState};
use crate::ids::{BidId, ProviderId};
use crate::transport::{
    BackgroundExec, Credentials, Endpoint, ExecOutput, TransportError, exec_in_background,
};

mod wait;

/// Fleet-level data every unit needs to open a remote shell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitProfile {
    /// Name of the owning fleet.
    pub fleet: String,
    /// Remote shell user.
    pub ssh_user: String,
    /// Remote shell port.
    pub ssh_port: u16,
    /// Password and key file for the remote shell.
    pub credentials: Credentials,
}

impl UnitProfile {
    /// Derives the profile from a fleet spec, resolving the key identifier
    /// against the context's key directory.
    #[must_use]
    pub fn from_spec(spec: &FleetSpec, ctx: &FleetContext) -> Self {
        Self {
            fleet: spec.name().to_owned(),
            ssh_user: spec.ssh_user().to_owned(),
            ssh_port: ctx.ssh_port,
            credentials: Credentials {
                password: spec.ssh_password().map(str::to_owned),
                key_file: spec.key_file(&ctx.key_dir),
            },
        }
    }

    /// Builds the transport endpoint for `host`.
    #[must_use]
    pub fn endpoint(&self, host: &str) -> Endpoint {
        Endpoint {
            host: host.to_owned(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// One provisioned compute unit.
#[derive(Debug)]
pub struct RemoteUnit {
    provider_id: Option<ProviderId>,
    bid_id: Option<BidId>,
    address: Option<String>,
    profile: Arc<UnitProfile>,
    ctx: Arc<FleetContext>,
    bid_cancelled: bool,
    terminated: bool,
}

impl RemoteUnit {
    /// Wraps a provider handle. At least one of the identifiers is expected.
    #[must_use]
    pub const fn new(
        provider_id: Option<ProviderId>,
        bid_id: Option<BidId>,
        profile: Arc<UnitProfile>,
        ctx: Arc<FleetContext>,
    ) -> Self {
        Self {
            provider_id,
            bid_id,
            address: None,
            profile,
            ctx,
            bid_cancelled: false,
            terminated: false,
        }
    }

    /// Provider id, once known.
    #[must_use]
    pub const fn provider_id(&self) -> Option<&ProviderId> {
        self.provider_id.as_ref()
    }

    /// Bid id, for units launched through bidding.
    #[must_use]
    pub const fn bid_id(&self) -> Option<&BidId> {
        self.bid_id.as_ref()
    }

    /// Address cached by [`RemoteUnit::resolve_address`].
    #[must_use]
    pub fn cached_address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Fleet-level profile shared with sibling units.
    #[must_use]
    pub fn profile(&self) -> &UnitProfile {
        &self.profile
    }

    /// Label used in logs: the provider id, else the bid id.
    #[must_use]
    pub fn label(&self) -> String {
        self.provider_id
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.bid_id.as_ref().map(|bid| format!("bid {bid}")))
            .unwrap_or_else(|| String::from("unlaunched unit"))
    }

    /// Queries the bid state, adopting a provider id reported by the bid.
    /// A bid the provider no longer knows about is [`BidState::NotFound`].
    ///
    /// # Errors
    ///
    /// Propagates gateway failures.
    pub async fn refresh_bid(&mut self) -> Result<BidState, GatewayError> {
        let Some(bid) = self.bid_id.clone() else {
            return Ok(BidState::NotFound);
        };
        let descriptions = self
            .ctx
            .gateway
            .describe_bids(std::slice::from_ref(&bid))
            .await?;
        let Some(description) = descriptions
            .into_iter()
            .find(|description| description.bid_id == bid)
        else {
            return Ok(BidState::NotFound);
        };

        if let Some(provider_id) = description.provider_id
            && self.provider_id.as_ref() != Some(&provider_id)
        {
            debug!(bid_id = %bid, provider_id = %provider_id, "bid reported provider id");
            self.provider_id = Some(provider_id);
        }
        Ok(description.state)
    }

    /// Queries the unit status check state.
    ///
    /// # Errors
    ///
    /// Propagates gateway failures.
    pub async fn refresh_state(&self) -> Result<UnitState, GatewayError> {
        let Some(provider_id) = self.provider_id.as_ref() else {
            return Ok(UnitState::NotFound);
        };
        let statuses = self
            .ctx
            .gateway
            .describe_unit_states(std::slice::from_ref(provider_id))
            .await?;
        Ok(statuses
            .into_iter()
            .find(|status| &status.provider_id == provider_id)
            .map_or(UnitState::NotFound, |status| status.state))
    }

    /// Returns the unit's address, querying the provider until one is
    /// assigned. The first non-empty address is cached for good. Failures
    /// are logged and yield `None`.
    pub async fn resolve_address(&mut self) -> Option<String> {
        if let Some(address) = self.address.as_ref() {
            return Some(address.clone());
        }

        if self.provider_id.is_none()
            && self.bid_id.is_some()
            && let Err(err) = self.refresh_bid().await
        {
            warn!(unit = %self.label(), error = %err, "bid refresh failed while resolving address");
        }

        let provider_id = self.provider_id.clone()?;
        match self.ctx.gateway.describe_address(&provider_id).await {
            Ok(Some(address)) if !address.trim().is_empty() => {
                let trimmed = address.trim().to_owned();
                debug!(provider_id = %provider_id, address = %trimmed, "resolved unit address");
                self.address = Some(trimmed.clone());
                Some(trimmed)
            }
            Ok(_) => {
                debug!(provider_id = %provider_id, "unit has no address yet");
                None
            }
            Err(err) => {
                warn!(provider_id = %provider_id, error = %err, "address lookup failed");
                None
            }
        }
    }

    /// Builds the transport endpoint from the resolved address.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] when no address is known.
    pub async fn endpoint(&mut self) -> Result<Endpoint, TransportError> {
        match self.resolve_address().await {
            Some(address) => Ok(self.profile.endpoint(&address)),
            None => Err(TransportError::Unreachable {
                host: self.label(),
                message: String::from("no address assigned"),
            }),
        }
    }

    /// Runs `command` on the unit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the unit has no address or the
    /// transport fails.
    pub async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let endpoint = self.endpoint().await?;
        let transport = Arc::clone(&self.ctx.transport);
        let owned = command.to_owned();
        run_blocking(move || transport.exec(&endpoint, &owned)).await
    }

    /// Uploads a local file to the unit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the unit has no address or the
    /// transfer fails.
    pub async fn send_file(&mut self, local: &Utf8Path, remote: &str) -> Result<(), TransportError> {
        let endpoint = self.endpoint().await?;
        let transport = Arc::clone(&self.ctx.transport);
        let local_path = local.to_path_buf();
        let remote_path = remote.to_owned();
        run_blocking(move || transport.send_file(&endpoint, &local_path, &remote_path)).await
    }

    /// Downloads a remote file or glob from the unit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the unit has no address or the
    /// transfer fails.
    pub async fn receive_file(
        &mut self,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, TransportError> {
        let endpoint = self.endpoint().await?;
        let transport = Arc::clone(&self.ctx.transport);
        let remote_path = remote.to_owned();
        let local_path = local.to_path_buf();
        run_blocking(move || transport.receive_file(&endpoint, &remote_path, &local_path)).await
    }

    /// Starts `command` on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] when the unit has no address.
    pub async fn exec_in_background(
        &mut self,
        command: &str,
    ) -> Result<BackgroundExec, TransportError> {
        let endpoint = self.endpoint().await?;
        Ok(exec_in_background(
            Arc::clone(&self.ctx.transport),
            endpoint,
            command.to_owned(),
        ))
    }

    /// Releases the unit: cancels its bid, terminates it and forgets its
    /// address. Steps that already succeeded are not repeated.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when a gateway call fails.
    pub async fn terminate(&mut self) -> Result<(), FleetError> {
        if self.provider_id.is_none()
            && self.bid_id.is_some()
            && !self.terminated
            && let Err(err) = self.refresh_bid().await
        {
            debug!(unit = %self.label(), error = %err, "bid refresh before termination failed");
        }

        if !self.bid_cancelled {
            if let Some(bid) = self.bid_id.as_ref() {
                self.ctx.gateway.cancel_bid(bid).await?;
                info!(bid_id = %bid, "cancelled bid");
            }
            self.bid_cancelled = true;
        }

        if !self.terminated {
            if let Some(provider_id) = self.provider_id.as_ref() {
                self.ctx.gateway.terminate_unit(provider_id).await?;
                info!(provider_id = %provider_id, "terminated unit");
            }
            self.terminated = true;
        }

        self.address = None;
        Ok(())
    }

    /// Reboots the unit. A unit without a provider id is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when the gateway call fails.
    pub async fn reboot(&self) -> Result<(), FleetError> {
        let Some(provider_id) = self.provider_id.as_ref() else {
            warn!(unit = %self.label(), "cannot reboot a unit without provider id");
            return Ok(());
        };
        self.ctx.gateway.reboot_unit(provider_id).await?;
        info!(provider_id = %provider_id, "rebooted unit");
        Ok(())
    }

    /// Applies a name tag to the unit. A unit without a provider id is left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when the gateway call fails.
    pub async fn tag(&self, name: &str) -> Result<(), FleetError> {
        let Some(provider_id) = self.provider_id.as_ref() else {
            warn!(unit = %self.label(), name, "cannot tag a unit without provider id");
            return Ok(());
        };
        self.ctx.gateway.tag_unit(provider_id, name).await?;
        debug!(provider_id = %provider_id, name, "tagged unit");
        Ok(())
    }

    pub(crate) fn context(&self) -> &FleetContext {
        &self.ctx
    }
}

/// Runs a blocking transport call off the async executor.
async fn run_blocking<T, F>(call: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .unwrap_or_else(|err| {
            Err(TransportError::Background {
                message: err.to_string(),
            })
        })
}
