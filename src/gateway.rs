//! Provider gateway abstraction for pricing, bidding and unit lifecycle calls.
//!
//! The gateway is a stateless remote collaborator queried by id. Provider
//! specific request shaping lives entirely behind [`ProviderGateway`]; the
//! fleet core only sees the types in this module.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::ids::{BidId, ProviderId};
use crate::price::Price;

/// Device name used for the root block device of every launched unit.
pub const ROOT_DEVICE_NAME: &str = "/dev/sda1";

/// Lifecycle stage of a price-capped provisioning request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BidState {
    /// Submitted and waiting for capacity at or below the ceiling.
    Open,
    /// Fulfilled; a unit has been launched for it.
    Active,
    /// Cancelled by the owner or the provider.
    Cancelled,
    /// Rejected or failed by the provider.
    Failed,
    /// The provider no longer knows the bid.
    NotFound,
    /// The provider reported a state outside this model.
    Unrecognized,
}

impl BidState {
    /// Maps a provider state string to a [`BidState`].
    #[must_use]
    pub fn from_provider(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "active" => Self::Active,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => Self::Unrecognized,
        }
    }

    /// Returns the lower-case label used in log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::NotFound => "not found",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Lifecycle stage of a launched compute unit.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UnitState {
    /// Booting; status checks have not passed yet.
    Initializing,
    /// Status checks passed.
    Ready,
    /// The provider does not (yet) report the unit.
    NotFound,
    /// The provider reported a status outside this model.
    Unrecognized,
}

impl UnitState {
    /// Maps a provider status string to a [`UnitState`].
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "initializing" => Self::Initializing,
            "ok" => Self::Ready,
            _ => Self::Unrecognized,
        }
    }

    /// Returns the lower-case label used in log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ok",
            Self::NotFound => "not found",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Root block device attached to each launched unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDevice {
    /// Device name on the unit.
    pub device_name: String,
    /// Volume size in GB.
    pub size_gb: u32,
    /// Whether the volume is released together with the unit.
    pub delete_on_termination: bool,
}

impl BlockDevice {
    /// Builds the single root device used by every launch.
    #[must_use]
    pub fn root(size_gb: u32) -> Self {
        Self {
            device_name: ROOT_DEVICE_NAME.to_owned(),
            size_gb,
            delete_on_termination: true,
        }
    }
}

/// Shape of the units to launch, shared by bids and direct runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Boot image identifier.
    pub image_id: String,
    /// Instance size or type.
    pub size: String,
    /// Number of units requested.
    pub count: u32,
    /// Root block device.
    pub root_device: BlockDevice,
    /// Rendered user-data, when a template was available.
    pub user_data: Option<String>,
    /// Security or firewall group applied to the units.
    pub security_group: String,
    /// Key pair identifier installed on the units.
    pub key_name: String,
}

/// Price-capped provisioning request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BidRequest {
    /// What to launch once the bid is fulfilled.
    pub launch: LaunchSpec,
    /// Maximum price per unit.
    pub price_ceiling: Price,
}

/// Handle returned for each unit requested through a bid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BidTicket {
    /// Identifier of the bid.
    pub bid_id: BidId,
    /// Unit identifier, when the provider has already assigned one.
    pub provider_id: Option<ProviderId>,
}

/// Current view of a bid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BidDescription {
    /// Identifier of the bid described.
    pub bid_id: BidId,
    /// State reported by the provider.
    pub state: BidState,
    /// Unit launched for the bid, if any.
    pub provider_id: Option<ProviderId>,
}

/// Current view of a unit's status checks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitStatus {
    /// Identifier of the unit described.
    pub provider_id: ProviderId,
    /// Status reported by the provider.
    pub state: UnitState,
}

/// Filter used to discover units that already run a fleet's image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveryFilter {
    /// Boot image the units were launched from.
    pub image_id: String,
    /// Restricts discovery to one size when set.
    pub size: Option<String>,
}

/// Unit found by [`ProviderGateway::discover_units`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredUnit {
    /// Unit identifier, absent for bids that are not fulfilled yet.
    pub provider_id: Option<ProviderId>,
    /// Bid the unit originates from, if any.
    pub bid_id: Option<BidId>,
}

/// Aggregation applied to metric samples.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Statistic {
    /// Mean of the samples in each period.
    #[default]
    Average,
    /// Sum of the samples in each period.
    Sum,
    /// Smallest sample in each period.
    Minimum,
    /// Largest sample in each period.
    Maximum,
    /// Number of samples in each period.
    SampleCount,
}

impl Statistic {
    /// Returns the provider-facing statistic name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Average => "Average",
            Self::Sum => "Sum",
            Self::Minimum => "Minimum",
            Self::Maximum => "Maximum",
            Self::SampleCount => "SampleCount",
        }
    }
}

/// Query describing which metric samples to fetch for a unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricQuery {
    /// Metric name (for example `CPUUtilization`).
    pub metric: String,
    /// How far back from now samples are requested.
    pub window: Duration,
    /// Aggregation period; always a whole number of minutes.
    pub period: Duration,
    /// Aggregation applied per period.
    pub statistic: Statistic,
}

/// Smallest aggregation period accepted by [`MetricQuery::new`].
pub const MIN_METRIC_PERIOD: Duration = Duration::from_secs(60);

impl MetricQuery {
    /// Builds a query, rounding `period` down to whole minutes (minimum one).
    #[must_use]
    pub fn new(
        metric: impl Into<String>,
        window: Duration,
        period: Duration,
        statistic: Statistic,
    ) -> Self {
        let minutes = period.as_secs().div_euclid(60).max(1);
        Self {
            metric: metric.into(),
            window,
            period: Duration::from_secs(minutes.saturating_mul(60)),
            statistic,
        }
    }

    /// Returns a copy of the query targeting another metric.
    #[must_use]
    pub fn for_metric(&self, metric: &str) -> Self {
        Self {
            metric: metric.to_owned(),
            ..self.clone()
        }
    }
}

/// Aggregated metric sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Datapoint {
    /// Sample timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Aggregated value for the requested statistic.
    pub value: f64,
    /// Unit label reported by the provider.
    pub unit: String,
}

/// Errors raised by gateway calls.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GatewayError {
    /// Raised when a provider call fails in a way that may succeed on retry.
    #[error("provider call {operation} failed: {message}")]
    Transient {
        /// Gateway operation that failed.
        operation: String,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the provider does not support an operation.
    #[error("provider does not support {operation}")]
    Unsupported {
        /// Gateway operation requested.
        operation: String,
    },
}

impl GatewayError {
    /// Convenience constructor for transient failures.
    #[must_use]
    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }
}

/// Future returned by gateway operations.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Cloud API consumed by the fleet core.
pub trait ProviderGateway: Send + Sync {
    /// Lists the availability partitions of `region`.
    fn list_partitions<'a>(&'a self, region: &'a str) -> GatewayFuture<'a, Vec<String>>;

    /// Returns the most recent market price for `size`/`os` in `partition`.
    fn latest_price<'a>(
        &'a self,
        size: &'a str,
        os: &'a str,
        partition: &'a str,
    ) -> GatewayFuture<'a, Option<Price>>;

    /// Submits a bid and returns one ticket per requested unit.
    fn submit_bid<'a>(&'a self, request: &'a BidRequest) -> GatewayFuture<'a, Vec<BidTicket>>;

    /// Describes the given bids. Unknown bids are omitted from the result.
    fn describe_bids<'a>(&'a self, bids: &'a [BidId]) -> GatewayFuture<'a, Vec<BidDescription>>;

    /// Launches units directly, bypassing bidding.
    fn run_direct<'a>(&'a self, spec: &'a LaunchSpec) -> GatewayFuture<'a, Vec<ProviderId>>;

    /// Describes unit status checks. Unknown units are omitted from the result.
    fn describe_unit_states<'a>(
        &'a self,
        units: &'a [ProviderId],
    ) -> GatewayFuture<'a, Vec<UnitStatus>>;

    /// Returns the public address of a unit, if one is assigned.
    fn describe_address<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, Option<String>>;

    /// Cancels a bid.
    fn cancel_bid<'a>(&'a self, bid: &'a BidId) -> GatewayFuture<'a, ()>;

    /// Terminates a unit.
    fn terminate_unit<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, ()>;

    /// Reboots a unit.
    fn reboot_unit<'a>(&'a self, unit: &'a ProviderId) -> GatewayFuture<'a, ()>;

    /// Applies a human readable name tag to a unit.
    fn tag_unit<'a>(&'a self, unit: &'a ProviderId, name: &'a str) -> GatewayFuture<'a, ()>;

    /// Finds bids and units already launched from an image.
    fn discover_units<'a>(
        &'a self,
        filter: &'a DiscoveryFilter,
    ) -> GatewayFuture<'a, Vec<DiscoveredUnit>>;

    /// Fetches aggregated metric samples for a unit.
    fn unit_metrics<'a>(
        &'a self,
        unit: &'a ProviderId,
        query: &'a MetricQuery,
    ) -> GatewayFuture<'a, Vec<Datapoint>>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("open", BidState::Open)]
    #[case("Active", BidState::Active)]
    #[case("cancelled", BidState::Cancelled)]
    #[case("failed", BidState::Failed)]
    #[case("closed", BidState::Unrecognized)]
    fn bid_states_map_from_provider_strings(#[case] raw: &str, #[case] expected: BidState) {
        assert_eq!(BidState::from_provider(raw), expected);
    }

    #[rstest]
    #[case("initializing", UnitState::Initializing)]
    #[case("ok", UnitState::Ready)]
    #[case("impaired", UnitState::Unrecognized)]
    fn unit_states_map_from_provider_strings(#[case] raw: &str, #[case] expected: UnitState) {
        assert_eq!(UnitState::from_provider(raw), expected);
    }

    #[rstest]
    #[case(Duration::from_secs(300), Duration::from_secs(300))]
    #[case(Duration::from_secs(330), Duration::from_secs(300))]
    #[case(Duration::from_secs(10), MIN_METRIC_PERIOD)]
    fn metric_period_rounds_to_whole_minutes(#[case] period: Duration, #[case] expected: Duration) {
        let query = MetricQuery::new(
            "CPUUtilization",
            Duration::from_secs(3600),
            period,
            Statistic::Average,
        );
        assert_eq!(query.period, expected);
    }
}
