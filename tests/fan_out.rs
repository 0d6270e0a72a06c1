//! Fan-out execution and artifact retrieval across several units.

#[path = "common/fleet_harness.rs"]
mod fleet_harness;

use std::sync::Arc;

use camino::Utf8PathBuf;
use fleet_harness::{Harness, harness, spec_builder};
use fleetrun::test_support::TransportCall;
use fleetrun::{Fleet, FleetError, ProviderId, TransportError};
use rstest::rstest;
use tempfile::TempDir;

fn running_fleet(harness: &Harness, hosts: &[(&str, &str)], files: Option<&str>) -> Fleet {
    let mut builder = spec_builder("name", i64::try_from(hosts.len()).unwrap_or(i64::MAX));
    if let Some(list) = files {
        builder = builder.parameter("RETRIEVE_FILES", list);
    }
    let mut fleet = Fleet::new(
        builder.build().expect("spec should build"),
        Arc::clone(&harness.ctx),
    );
    for (id, address) in hosts {
        harness.gateway.set_address(id, address);
        assert!(fleet.add_running_unit(ProviderId::from(*id), None));
    }
    fleet
}

fn local_base(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("temp dir should be UTF-8")
}

#[rstest]
#[tokio::test]
async fn exec_on_all_reports_each_unit() {
    let harness = harness();
    let mut fleet = running_fleet(
        &harness,
        &[("i-1", "10.0.0.1"), ("i-2", "10.0.0.2"), ("i-3", "10.0.0.3")],
        None,
    );
    harness.transport.make_unreachable("10.0.0.2");

    let report = fleet.exec_on_all("uptime").await;

    assert_eq!(report.len(), 3);
    assert_eq!(report.successes().count(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures.first(),
        Some((2, FleetError::Transport(TransportError::Unreachable { .. })))
    ));
    assert_eq!(
        report.lines(),
        vec![
            String::from("10.0.0.1: uptime"),
            String::from("10.0.0.3: uptime"),
        ]
    );
    assert_eq!(harness.clock.pauses(), 0);
}

#[rstest]
#[tokio::test]
async fn exec_on_all_reports_units_without_address() {
    let harness = harness();
    let mut fleet = running_fleet(&harness, &[("i-1", "10.0.0.1")], None);
    assert!(fleet.add_running_unit(ProviderId::from("i-2"), None));

    let report = fleet.exec_on_all("hostname").await;

    assert_eq!(report.successes().count(), 1);
    assert_eq!(report.failures().map(|(ordinal, _)| ordinal).collect::<Vec<_>>(), vec![2]);
    assert_eq!(harness.transport.commands_for("10.0.0.1"), vec![String::from("hostname")]);
}

#[rstest]
#[tokio::test]
async fn retrieve_files_lays_out_per_unit_directories() {
    let harness = harness();
    let out = TempDir::new().expect("temp dir");
    let base = local_base(&out);
    let mut fleet = running_fleet(
        &harness,
        &[("i-1", "10.0.0.1"), ("i-2", "10.0.0.2")],
        Some("app.log;/var/log/x.log"),
    );

    let report = fleet.retrieve_files(&base, "/home/ec2-user/run").await;

    assert!(report.all_succeeded());
    let mut written: Vec<Utf8PathBuf> = report
        .successes()
        .flat_map(|(_, paths)| paths.iter().cloned())
        .collect();
    written.sort();
    assert_eq!(
        written,
        vec![
            base.join("name1/app.log"),
            base.join("name1/var/log/x.log"),
            base.join("name2/app.log"),
            base.join("name2/var/log/x.log"),
        ]
    );
    for path in &written {
        assert!(path.is_file(), "{path} should exist");
    }
    assert_eq!(
        std::fs::read_to_string(base.join("name2/app.log")).expect("read artifact"),
        "10.0.0.2:/home/ec2-user/run/app.log"
    );
}

#[rstest]
#[tokio::test]
async fn missing_remote_files_are_skipped() {
    let harness = harness();
    let out = TempDir::new().expect("temp dir");
    let base = local_base(&out);
    harness.transport.mark_missing("/var/log/absent.log");
    let mut fleet = running_fleet(&harness, &[("i-1", "10.0.0.1")], None);

    let files = vec![
        String::from("/var/log/absent.log"),
        String::from("/var/log/present.log"),
    ];
    let report = fleet.retrieve_file_list(&files, &base, "/").await;

    assert!(report.all_succeeded());
    let written: Vec<_> = report
        .successes()
        .flat_map(|(_, paths)| paths.iter().cloned())
        .collect();
    assert_eq!(written, vec![base.join("name1/var/log/present.log")]);
}

#[rstest]
#[tokio::test]
async fn glob_retrieval_downloads_each_match() {
    let harness = harness();
    let out = TempDir::new().expect("temp dir");
    let base = local_base(&out);
    let mut fleet = running_fleet(&harness, &[("i-1", "10.0.0.1")], None);
    harness.transport.push_exec(
        "10.0.0.1",
        Ok(fleetrun::ExecOutput {
            lines: vec![
                String::from("/var/log/app-1.log"),
                String::from("/var/log/app-2.log"),
            ],
            exit_code: Some(0),
        }),
    );

    let files = vec![String::from("/var/log/app-*.log")];
    let report = fleet.retrieve_file_list(&files, &base, "/").await;

    assert!(report.all_succeeded());
    let downloads: Vec<_> = harness
        .transport
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            TransportCall::Download { local, .. } => Some(local),
            _ => None,
        })
        .collect();
    assert_eq!(
        downloads,
        vec![
            base.join("name1/var/log/app-1.log"),
            base.join("name1/var/log/app-2.log"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn unreachable_unit_fails_only_its_retrieval() {
    let harness = harness();
    let out = TempDir::new().expect("temp dir");
    let base = local_base(&out);
    let mut fleet = running_fleet(
        &harness,
        &[("i-1", "10.0.0.1"), ("i-2", "10.0.0.2")],
        Some("result.csv"),
    );
    harness.transport.make_unreachable("10.0.0.1");

    let report = fleet.retrieve_files(&base, "/srv").await;

    assert_eq!(report.failures().map(|(ordinal, _)| ordinal).collect::<Vec<_>>(), vec![1]);
    assert!(base.join("name2/result.csv").is_file());
}

#[rstest]
#[tokio::test]
async fn nonzero_remote_exit_is_visible_in_the_report() {
    let harness = harness();
    let mut fleet = running_fleet(&harness, &[("i-1", "10.0.0.1"), ("i-2", "10.0.0.2")], None);
    harness.transport.push_exec(
        "10.0.0.2",
        Ok(fleetrun::ExecOutput {
            lines: vec![String::from("make: *** [all] Error 2")],
            exit_code: Some(2),
        }),
    );

    let report = fleet.exec_on_all("make").await;

    assert!(report.all_succeeded());
    assert_eq!(report.unsuccessful_exits(), &[(2, Some(2))]);
    assert_eq!(
        report.lines(),
        vec![
            String::from("10.0.0.1: make"),
            String::from("make: *** [all] Error 2"),
        ]
    );
    assert_eq!(harness.clock.pauses(), 0);
}
