//! Fleets of remote units: bidding, readiness and fan-out operations.
//!
//! A [`Fleet`] owns its [`FleetSpec`] and an ordered set of [`RemoteUnit`]s.
//! Units are inserted idempotently: no two units share a provider id, and
//! units still waiting on a bid are deduplicated by bid id. The fleet never
//! holds more units than the spec's desired count; requests that would
//! over-provision are refused as no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::FleetSpec;
use crate::context::FleetContext;
use crate::ids::{BidId, ProviderId};
use crate::price::Price;
use crate::unit::{RemoteUnit, UnitProfile};
use crate::user_data::resolve_user_data;

mod bidding;
mod fanout;
mod report;
mod retrieve;

pub use fanout::Hook;
pub use report::{FanOutReport, UnitOutcome};

/// A named group of units launched from one [`FleetSpec`].
#[derive(Debug)]
pub struct Fleet {
    spec: FleetSpec,
    ctx: Arc<FleetContext>,
    profile: Arc<UnitProfile>,
    units: Vec<RemoteUnit>,
    price_ceilings: HashMap<(String, String), Price>,
    user_data: Option<String>,
    run_tag: Uuid,
}

impl Fleet {
    /// Creates an empty fleet. The user-data template, if any, is loaded and
    /// rendered once here.
    #[must_use]
    pub fn new(spec: FleetSpec, ctx: Arc<FleetContext>) -> Self {
        let profile = Arc::new(UnitProfile::from_spec(&spec, &ctx));
        let user_data = resolve_user_data(
            ctx.template_dir.as_deref(),
            spec.name(),
            &ctx.user_data_args,
        );
        let run_tag = Uuid::new_v4();
        debug!(fleet = spec.name(), run = %run_tag, "created fleet");
        Self {
            spec,
            ctx,
            profile,
            units: Vec::new(),
            price_ceilings: HashMap::new(),
            user_data,
            run_tag,
        }
    }

    /// Fleet name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Specification the fleet was built from.
    #[must_use]
    pub const fn spec(&self) -> &FleetSpec {
        &self.spec
    }

    /// Correlation id attached to this fleet's log lines.
    #[must_use]
    pub const fn run_tag(&self) -> Uuid {
        self.run_tag
    }

    /// Rendered user-data passed to every launch.
    #[must_use]
    pub fn user_data(&self) -> Option<&str> {
        self.user_data.as_deref()
    }

    /// Number of units the fleet converges to.
    #[must_use]
    pub fn desired_count(&self) -> usize {
        usize::try_from(self.spec.desired_count()).unwrap_or(usize::MAX)
    }

    /// Number of units currently held.
    #[must_use]
    pub const fn running_count(&self) -> usize {
        self.units.len()
    }

    /// Units in insertion order.
    #[must_use]
    pub fn units(&self) -> &[RemoteUnit] {
        &self.units
    }

    /// Mutable access to a unit by 1-based ordinal.
    pub fn unit_mut(&mut self, ordinal: usize) -> Option<&mut RemoteUnit> {
        ordinal
            .checked_sub(1)
            .and_then(|index| self.units.get_mut(index))
    }

    fn remaining_capacity(&self) -> usize {
        self.desired_count().saturating_sub(self.running_count())
    }

    fn contains(&self, provider_id: Option<&ProviderId>, bid_id: Option<&BidId>) -> bool {
        self.units.iter().any(|unit| {
            (provider_id.is_some() && unit.provider_id() == provider_id)
                || (bid_id.is_some() && unit.bid_id() == bid_id)
        })
    }

    /// Inserts a unit unless it is already known or the fleet is full.
    fn insert_unit(&mut self, provider_id: Option<ProviderId>, bid_id: Option<BidId>) -> bool {
        if self.contains(provider_id.as_ref(), bid_id.as_ref()) {
            debug!(
                fleet = self.name(),
                provider_id = ?provider_id,
                bid_id = ?bid_id,
                "unit already tracked"
            );
            return false;
        }
        if self.remaining_capacity() == 0 {
            info!(
                fleet = self.name(),
                desired = self.desired_count(),
                "fleet is full; not adding unit"
            );
            return false;
        }

        self.units.push(RemoteUnit::new(
            provider_id,
            bid_id,
            Arc::clone(&self.profile),
            Arc::clone(&self.ctx),
        ));
        true
    }
}

#[cfg(test)]
mod tests;
