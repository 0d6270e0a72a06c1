//! Shared scripted collaborators for fleet integration tests.
//!
//! Include with:
//!
//! ```rust
//! #[path = "common/fleet_harness.rs"]
//! mod fleet_harness;
//! ```

use std::sync::Arc;
use std::time::Duration;

use fleetrun::test_support::{ManualClock, ScriptedGateway, ScriptedTransport, scripted_context};
use fleetrun::{FleetContext, FleetSpec, FleetSpecBuilder, WaitTimings};

pub struct Harness {
    pub gateway: ScriptedGateway,
    pub transport: ScriptedTransport,
    pub clock: ManualClock,
    pub ctx: Arc<FleetContext>,
}

pub fn harness() -> Harness {
    let gateway = ScriptedGateway::new();
    gateway.set_prices(&[("us-east-1a", "0.0350"), ("us-east-1b", "0.0900")]);
    let transport = ScriptedTransport::new();
    let clock = ManualClock::new();
    let ctx = Arc::new(
        scripted_context(&gateway, &transport, &clock).with_timings(WaitTimings {
            poll_interval: Duration::from_secs(10),
            reachability_budget: Duration::from_secs(60),
            reachability_retry: Duration::from_secs(1),
            not_found_tolerance: 6,
        }),
    );
    Harness {
        gateway,
        transport,
        clock,
        ctx,
    }
}

pub fn spec_builder(name: &str, count: i64) -> FleetSpecBuilder {
    FleetSpec::builder(name)
        .image_id("ami-0abc")
        .size("c5.xlarge")
        .count(count)
        .disk_size_gb(40)
        .os("Linux/UNIX")
        .key_name(Some(String::from("bench")))
        .ssh_user("ec2-user")
}
