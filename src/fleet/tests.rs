//! Unit tests for fleet bidding and fan-out helpers.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::config::FleetSpecBuilder;
use crate::error::FleetError;
use crate::gateway::{Datapoint, MetricQuery, ROOT_DEVICE_NAME, Statistic};
use crate::test_support::{ManualClock, ScriptedGateway, ScriptedTransport, scripted_context};

struct Doubles {
    gateway: ScriptedGateway,
    transport: ScriptedTransport,
    clock: ManualClock,
}

#[fixture]
fn doubles() -> Doubles {
    let gateway = ScriptedGateway::new();
    gateway.set_prices(&[("us-east-1a", "0.0350"), ("us-east-1b", "0.0900")]);
    Doubles {
        gateway,
        transport: ScriptedTransport::new(),
        clock: ManualClock::new(),
    }
}

fn builder(count: i64) -> FleetSpecBuilder {
    FleetSpec::builder("web")
        .image_id("ami-123")
        .size("m5.large")
        .count(count)
        .disk_size_gb(30)
        .os("Linux/UNIX")
        .key_name(Some(String::from("fleet-key")))
        .ssh_user("ubuntu")
}

fn fleet_with(doubles: &Doubles, spec_builder: FleetSpecBuilder) -> Fleet {
    let spec = spec_builder.build().expect("spec should build");
    let ctx = scripted_context(&doubles.gateway, &doubles.transport, &doubles.clock);
    Fleet::new(spec, Arc::new(ctx))
}

fn fleet(doubles: &Doubles, count: i64) -> Fleet {
    fleet_with(doubles, builder(count))
}

fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("temp dir should be UTF-8")
}

#[rstest]
#[tokio::test]
async fn price_ceiling_is_queried_once(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 2);

    let first = fleet.price_ceiling().await.expect("ceiling should resolve");
    let second = fleet.price_ceiling().await.expect("ceiling should be cached");

    assert_eq!(first, Price::from_micros(290_000));
    assert_eq!(first, second);
    let calls = doubles.gateway.calls();
    assert_eq!(calls.list_partitions, 1);
    assert_eq!(calls.latest_price, 2);
}

#[rstest]
#[tokio::test]
async fn missing_prices_block_bidding(doubles: Doubles) {
    doubles.gateway.set_prices(&[]);
    let mut fleet = fleet(&doubles, 2);

    let err = fleet.request_units(2).await.expect_err("bid should fail");

    assert!(matches!(err, FleetError::PricingUnavailable { .. }));
    assert_eq!(doubles.gateway.calls().submit_bid, 0);
    assert_eq!(fleet.running_count(), 0);
}

#[rstest]
#[tokio::test]
async fn failed_price_lookup_propagates_and_is_not_cached(doubles: Doubles) {
    doubles
        .gateway
        .set_prices(&[("us-east-1a", "0.9000"), ("us-east-1b", "0.0350")]);
    doubles.gateway.fail_next("latest_price", 1);
    let mut fleet = fleet(&doubles, 2);

    let err = fleet.price_ceiling().await.expect_err("lookup failure should surface");
    let ceiling = fleet.price_ceiling().await.expect("retry should resolve");

    assert!(matches!(err, FleetError::Provider(_)));
    assert_eq!(ceiling, Price::from_micros(1_100_000));
    assert_eq!(doubles.gateway.calls().list_partitions, 2);
}

#[rstest]
#[tokio::test]
async fn request_is_capped_at_remaining_capacity(doubles: Doubles) {
    doubles
        .gateway
        .push_bid_tickets(&[("sir-1", None), ("sir-2", None)]);
    let mut fleet = fleet(&doubles, 2);

    let added = fleet.request_units(5).await.expect("bid should succeed");
    let again = fleet.request_units(1).await.expect("full fleet is a no-op");

    assert_eq!(added, 2);
    assert_eq!(again, 0);
    let submitted = doubles.gateway.submitted_bids();
    assert_eq!(submitted.len(), 1);
    let bid = submitted.first().expect("one bid");
    assert_eq!(bid.launch.count, 2);
    assert_eq!(bid.price_ceiling, Price::from_micros(290_000));
    assert_eq!(bid.launch.root_device.device_name, ROOT_DEVICE_NAME);
    assert_eq!(bid.launch.root_device.size_gb, 30);
    assert!(bid.launch.root_device.delete_on_termination);
    assert_eq!(bid.launch.key_name, "fleet-key");
}

#[rstest]
#[tokio::test]
async fn surplus_tickets_are_dropped(doubles: Doubles) {
    doubles
        .gateway
        .push_bid_tickets(&[("sir-1", None), ("sir-2", None), ("sir-3", None)]);
    let mut fleet = fleet(&doubles, 2);

    let added = fleet.request_units(2).await.expect("bid should succeed");

    assert_eq!(added, 2);
    assert_eq!(fleet.running_count(), 2);
    let bids: Vec<_> = fleet
        .units()
        .iter()
        .filter_map(|unit| unit.bid_id().map(BidId::as_str))
        .collect();
    assert_eq!(bids, vec!["sir-1", "sir-2"]);
}

#[rstest]
fn duplicate_provider_id_is_ignored(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 3);

    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    assert!(!fleet.add_running_unit(ProviderId::from("i-1"), Some(BidId::from("sir-9"))));

    assert_eq!(fleet.running_count(), 1);
}

#[rstest]
fn adoption_respects_capacity(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 1);

    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    assert!(!fleet.add_running_unit(ProviderId::from("i-2"), None));

    assert_eq!(fleet.running_count(), 1);
}

#[rstest]
#[tokio::test]
async fn on_demand_units_carry_no_bid(doubles: Doubles) {
    doubles.gateway.push_direct_run(&["i-1", "i-2"]);
    let mut fleet = fleet(&doubles, 2);

    let added = fleet
        .request_units_on_demand(2)
        .await
        .expect("launch should succeed");

    assert_eq!(added, 2);
    assert!(fleet.units().iter().all(|unit| unit.bid_id().is_none()));
    assert_eq!(doubles.gateway.calls().submit_bid, 0);
    assert_eq!(doubles.gateway.calls().list_partitions, 0);
    let launches = doubles.gateway.direct_launches();
    assert_eq!(launches.first().map(|spec| spec.count), Some(2));
    assert_eq!(
        launches.first().map(|spec| spec.security_group.as_str()),
        Some("default")
    );
}

#[rstest]
#[tokio::test]
async fn user_data_is_rendered_into_launches(doubles: Doubles) {
    let templates = TempDir::new().expect("temp dir");
    std::fs::write(
        templates.path().join("configuration-web.txt"),
        "key=%1$s region=%2$s\n",
    )
    .expect("write template");
    doubles.gateway.push_direct_run(&["i-1"]);
    let spec = builder(1).build().expect("spec should build");
    let ctx = scripted_context(&doubles.gateway, &doubles.transport, &doubles.clock)
        .with_template_dir(Some(utf8_dir(&templates)))
        .with_user_data_args(vec![String::from("abc"), String::from("us-east-1")]);
    let mut fleet = Fleet::new(spec, Arc::new(ctx));

    fleet
        .request_units_on_demand(1)
        .await
        .expect("launch should succeed");

    assert_eq!(fleet.user_data(), Some("key=abc region=us-east-1"));
    let launches = doubles.gateway.direct_launches();
    assert_eq!(
        launches.first().and_then(|spec| spec.user_data.as_deref()),
        Some("key=abc region=us-east-1")
    );
}

#[rstest]
#[tokio::test]
async fn empty_fleet_is_never_ready(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 2);
    assert!(!fleet.wait_until_all_ready(false).await);
    assert!(!fleet.wait_until_all_reachable().await);
}

#[rstest]
#[tokio::test]
async fn missing_hook_runs_nothing(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 1);
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));

    let report = fleet.exec_starter().await;

    assert!(report.is_empty());
    assert!(doubles.transport.calls().is_empty());
}

#[rstest]
#[case(Hook::Starter, "STARTER")]
#[case(Hook::Stopper, "STOPPER")]
#[case(Hook::Updater, "UPDATER")]
#[case(Hook::Downloader, "DOWNLOADER")]
#[case(Hook::Installer, "INSTALLER")]
#[tokio::test]
async fn hooks_run_their_parameter(
    doubles: Doubles,
    #[case] hook: Hook,
    #[case] parameter: &str,
) {
    doubles.gateway.set_address("i-1", "10.0.0.1");
    let mut fleet = fleet_with(&doubles, builder(1).parameter(parameter, "./hook.sh"));
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));

    let report = fleet.exec_hook(hook).await;

    assert!(report.all_succeeded());
    assert_eq!(report.lines(), vec![String::from("10.0.0.1: ./hook.sh")]);
}

#[rstest]
#[tokio::test]
async fn tag_all_names_units_by_ordinal(doubles: Doubles) {
    let mut fleet = fleet(&doubles, 2);
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    assert!(fleet.add_running_unit(ProviderId::from("i-2"), None));

    let report = fleet.tag_all().await;
    let rebooted = fleet.reboot_all().await;

    assert!(report.all_succeeded());
    assert!(rebooted.all_succeeded());
    assert_eq!(
        doubles.gateway.tags(),
        vec![
            (ProviderId::from("i-1"), String::from("web1")),
            (ProviderId::from("i-2"), String::from("web2")),
        ]
    );
    assert_eq!(doubles.gateway.rebooted_units().len(), 2);
}

#[rstest]
#[tokio::test]
async fn delete_files_removes_listed_paths(doubles: Doubles) {
    doubles.gateway.set_address("i-1", "10.0.0.1");
    let mut fleet = fleet_with(
        &doubles,
        builder(1).parameter("delete_files", "/tmp/out; /tmp/my data ;"),
    );
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));

    let report = fleet.delete_files().await;

    assert!(report.all_succeeded());
    assert_eq!(
        doubles.transport.commands_for("10.0.0.1"),
        vec![String::from("rm -rf /tmp/out '/tmp/my data'")]
    );
}

#[rstest]
#[tokio::test]
async fn delete_files_leaves_wildcards_to_the_remote_shell(doubles: Doubles) {
    doubles.gateway.set_address("i-1", "10.0.0.1");
    let mut fleet = fleet_with(
        &doubles,
        builder(1).parameter("DELETE_FILES", "/tmp/results/*.jtl;/tmp/run dir/log-?.txt"),
    );
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));

    let report = fleet.delete_files().await;

    assert!(report.all_succeeded());
    assert_eq!(
        doubles.transport.commands_for("10.0.0.1"),
        vec![String::from("rm -rf /tmp/results/*.jtl '/tmp/run dir/log-'?.txt")]
    );
}

#[rstest]
#[tokio::test]
async fn metrics_are_exported_per_unit(doubles: Doubles) {
    let out = TempDir::new().expect("temp dir");
    let base = utf8_dir(&out);
    doubles.gateway.set_metrics(
        "i-1",
        "CPUUtilization",
        vec![Datapoint {
            timestamp_ms: 1_000,
            value: 3.25,
            unit: String::from("Percent"),
        }],
    );
    let mut fleet = fleet_with(&doubles, builder(2).parameter("METRICS", "CPUUtilization"));
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    fleet.units.push(RemoteUnit::new(
        None,
        Some(BidId::from("sir-2")),
        Arc::clone(&fleet.profile),
        Arc::clone(&fleet.ctx),
    ));
    let query = MetricQuery::new(
        "ignored",
        Duration::from_secs(3600),
        Duration::from_secs(60),
        Statistic::Average,
    );

    let report = fleet.retrieve_metrics(&base, &query).await;

    let written = base.join("web1").join("CPUUtilization.csv");
    assert_eq!(
        std::fs::read_to_string(&written).expect("csv should exist"),
        "Timestamp,Metric,Statistic,Value,Unit\n1000,CPUUtilization,Average,3.250,Percent\n"
    );
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures.first(),
        Some((2, FleetError::NotLaunched { ordinal: 2, .. }))
    ));
}

#[rstest]
#[tokio::test]
async fn background_commands_join_per_unit(doubles: Doubles) {
    doubles.gateway.set_address("i-1", "10.0.0.1");
    doubles.gateway.set_address("i-2", "10.0.0.2");
    let mut fleet = fleet(&doubles, 2);
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    assert!(fleet.add_running_unit(ProviderId::from("i-2"), None));

    let report = fleet.exec_in_background_on_all("sleep 1").await;

    let hosts: Vec<String> = report
        .into_iter()
        .map(|outcome| {
            let handle = outcome.result.expect("background start");
            let host = handle.host().to_owned();
            handle.join().expect("background join");
            host
        })
        .collect();
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
}

#[rstest]
#[tokio::test]
async fn addresses_skip_units_without_one(doubles: Doubles) {
    doubles.gateway.set_address("i-1", "10.0.0.1");
    let mut fleet = fleet(&doubles, 2);
    assert!(fleet.add_running_unit(ProviderId::from("i-1"), None));
    assert!(fleet.add_running_unit(ProviderId::from("i-2"), None));

    assert_eq!(fleet.addresses().await, vec![String::from("10.0.0.1")]);
}

#[rstest]
fn unit_dir_appends_ordinal(doubles: Doubles) {
    let fleet = fleet(&doubles, 1);
    assert_eq!(
        fleet.unit_dir(Utf8Path::new("/out"), 3),
        Utf8PathBuf::from("/out/web3")
    );
}
