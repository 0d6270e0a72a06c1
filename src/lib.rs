//! Core library for provisioning and driving fleets of remote compute units.
//!
//! A [`Fleet`] bids for units at a computed price ceiling (or launches them
//! directly), waits for them to become ready and reachable, fans commands
//! out over a pluggable [`Transport`], pulls artifacts and metrics back into
//! per-unit directories, and releases everything on termination. Provider
//! calls go through the [`ProviderGateway`] trait; time goes through a
//! [`Clock`] so every polling loop can be driven deterministically.

pub mod clock;
pub mod cloud_service;
pub mod config;
pub mod context;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod ids;
pub mod price;
pub mod test_support;
pub mod transport;
pub mod unit;
pub mod user_data;

pub use clock::{Clock, Interrupt, Interrupted, TokioClock};
pub use cloud_service::CloudService;
pub use config::{ConfigError, FleetCatalog, FleetSpec, FleetSpecBuilder, RuntimeConfig};
pub use context::{FleetContext, WaitTimings};
pub use error::FleetError;
pub use fleet::{FanOutReport, Fleet, Hook, UnitOutcome};
pub use gateway::{
    BidDescription, BidRequest, BidState, BidTicket, BlockDevice, Datapoint, DiscoveredUnit,
    DiscoveryFilter, GatewayError, GatewayFuture, LaunchSpec, MetricQuery, ProviderGateway,
    Statistic, UnitState, UnitStatus,
};
pub use ids::{BidId, ProviderId};
pub use price::{Price, PriceCeilingPolicy};
pub use transport::{
    BackgroundExec, Credentials, Endpoint, ExecOutput, Transport, TransportConfig, TransportError,
};
pub use unit::{RemoteUnit, UnitProfile};
pub use user_data::UserDataError;
