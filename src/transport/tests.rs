//! Unit tests for the transport module.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::ScriptedRunner;

fn args_of(runner: &ScriptedRunner, index: usize) -> Vec<String> {
    runner
        .invocations()
        .get(index)
        .map(|invocation| {
            invocation
                .args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_else(|| panic!("missing invocation {index}"))
}

#[fixture]
fn config() -> TransportConfig {
    TransportConfig {
        backend: String::from("ssh"),
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        sshpass_bin: String::from("sshpass"),
        ssh_port: DEFAULT_SSH_PORT,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
    }
}

fn endpoint(password: Option<&str>, key_file: Option<&str>) -> Endpoint {
    Endpoint {
        host: String::from("10.0.0.5"),
        port: 22,
        user: String::from("ubuntu"),
        credentials: Credentials {
            password: password.map(str::to_owned),
            key_file: key_file.map(Utf8PathBuf::from),
        },
    }
}

fn transport(config: TransportConfig, runner: &ScriptedRunner) -> SshTransport<ScriptedRunner> {
    SshTransport::new(config, runner.clone()).expect("config should validate")
}

#[rstest]
fn exec_with_key_runs_ssh_directly(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "ok\n", "");
    let ssh = transport(config, &runner);

    let output = ssh
        .exec(&endpoint(None, Some("/keys/fleet.pem")), "echo ok")
        .expect("exec should succeed");

    assert_eq!(output.lines, vec![String::from("ok")]);
    assert!(output.is_success());
    let invocations = runner.invocations();
    assert_eq!(invocations.first().map(|inv| inv.program.as_str()), Some("ssh"));
    let args = args_of(&runner, 0);
    assert!(args.windows(2).any(|pair| pair == ["-i", "/keys/fleet.pem"]));
    assert!(args.contains(&String::from("BatchMode=yes")));
    assert!(args.contains(&String::from("ubuntu@10.0.0.5")));
    assert_eq!(args.last().map(String::as_str), Some("echo ok"));
}

#[rstest]
fn exec_with_password_only_wraps_sshpass(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = transport(config, &runner);

    ssh.exec(&endpoint(Some("secret"), None), "uptime")
        .expect("exec should succeed");

    let invocations = runner.invocations();
    assert_eq!(
        invocations.first().map(|inv| inv.program.as_str()),
        Some("sshpass")
    );
    let args = args_of(&runner, 0);
    assert_eq!(args.get(..3), Some(&["-p", "secret", "ssh"].map(String::from)[..]));
    assert!(!args.contains(&String::from("BatchMode=yes")));
}

#[rstest]
fn exec_prefers_key_when_both_credentials_exist(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = transport(config, &runner);

    ssh.exec(&endpoint(Some("secret"), Some("/keys/fleet.pem")), "true")
        .expect("exec should succeed");

    let invocations = runner.invocations();
    assert_eq!(invocations.first().map(|inv| inv.program.as_str()), Some("ssh"));
    assert!(!args_of(&runner, 0).contains(&String::from("secret")));
}

#[rstest]
#[case(None, None)]
#[case(Some("  "), None)]
#[case(None, Some(""))]
fn exec_requires_credentials(
    config: TransportConfig,
    #[case] password: Option<&str>,
    #[case] key_file: Option<&str>,
) {
    let runner = ScriptedRunner::new();
    let ssh = transport(config, &runner);

    let err = ssh
        .exec(&endpoint(password, key_file), "true")
        .expect_err("missing credentials should fail");

    assert!(matches!(err, TransportError::MissingCredentials { .. }));
    assert!(runner.invocations().is_empty());
}

#[rstest]
fn exec_maps_connection_failure_to_unreachable(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", "ssh: connect to host 10.0.0.5 port 22: Connection refused\n");
    let ssh = transport(config, &runner);

    let err = ssh
        .exec(&endpoint(None, Some("/keys/fleet.pem")), "echo ok")
        .expect_err("exit 255 should be unreachable");

    let TransportError::Unreachable { host, message } = err else {
        panic!("expected Unreachable, got {err:?}");
    };
    assert_eq!(host, "10.0.0.5");
    assert!(message.contains("Connection refused"));
}

#[rstest]
fn exec_reports_remote_exit_code_and_orders_stderr_last(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(3), "first\nsecond\n", "warning\n");
    let ssh = transport(config, &runner);

    let output = ssh
        .exec(&endpoint(None, Some("/keys/fleet.pem")), "run.sh")
        .expect("non-zero remote status is not a transport error");

    assert_eq!(output.exit_code, Some(3));
    assert!(!output.is_success());
    assert_eq!(output.lines, ["first", "second", "warning"].map(String::from));
}

#[rstest]
fn send_file_builds_scp_upload(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = transport(config, &runner);

    ssh.send_file(
        &endpoint(None, Some("/keys/fleet.pem")),
        Utf8Path::new("/tmp/workload.sh"),
        "/home/ubuntu/my workload.sh",
    )
    .expect("upload should succeed");

    let invocations = runner.invocations();
    assert_eq!(invocations.first().map(|inv| inv.program.as_str()), Some("scp"));
    let args = args_of(&runner, 0);
    assert!(args.windows(2).any(|pair| pair == ["-P", "22"]));
    assert_eq!(
        args.get(args.len() - 2..),
        Some(
            &[
                String::from("/tmp/workload.sh"),
                String::from("ubuntu@10.0.0.5:'/home/ubuntu/my workload.sh'"),
            ][..]
        )
    );
}

#[rstest]
fn send_file_failure_is_reported(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_failure(1);
    let ssh = transport(config, &runner);

    let err = ssh
        .send_file(
            &endpoint(None, Some("/keys/fleet.pem")),
            Utf8Path::new("/tmp/a"),
            "/tmp/b",
        )
        .expect_err("failed upload should error");

    let TransportError::CommandFailure {
        status,
        status_text,
        ..
    } = err
    else {
        panic!("expected CommandFailure, got {err:?}");
    };
    assert_eq!(status, Some(1));
    assert_eq!(status_text, "1");
}

#[rstest]
fn download_of_missing_remote_file_is_skipped(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "scp: /var/log/none.log: No such file or directory\n");
    let ssh = transport(config, &runner);
    let dir = TempDir::new().expect("temp dir");
    let local = Utf8PathBuf::from_path_buf(dir.path().join("none.log")).expect("utf8 path");

    let received = ssh
        .receive_file(&endpoint(None, Some("/keys/fleet.pem")), "/var/log/none.log", &local)
        .expect("missing file is not an error");

    assert!(received.is_empty());
}

#[rstest]
fn receive_into_existing_directory_keeps_remote_name(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let ssh = transport(config, &runner);
    let dir = TempDir::new().expect("temp dir");
    let local = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");

    let received = ssh
        .receive_file(&endpoint(None, Some("/keys/fleet.pem")), "/var/log/app.log", &local)
        .expect("download should succeed");

    assert_eq!(received, vec![local.join("app.log")]);
    let args = args_of(&runner, 0);
    assert_eq!(args.last().map(String::as_str), Some(local.join("app.log").as_str()));
}

#[rstest]
fn receive_glob_lists_then_downloads_each_match(config: TransportConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "/var/log/app-1.log\n/var/log/app-2.log\n", "");
    runner.push_success();
    runner.push_success();
    let ssh = transport(config, &runner);
    let dir = TempDir::new().expect("temp dir");
    let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    let local = base.join("nested/copy-*.log");

    let received = ssh
        .receive_file(&endpoint(None, Some("/keys/fleet.pem")), "/var/log/app-*.log", &local)
        .expect("glob download should succeed");

    assert_eq!(
        received,
        vec![base.join("nested/copy-1.log"), base.join("nested/copy-2.log")]
    );
    assert!(base.join("nested").is_dir());
    assert_eq!(runner.invocations().len(), 3);
    assert!(
        args_of(&runner, 0)
            .last()
            .is_some_and(|command| command.starts_with("ls -1d /var/log/app-*.log"))
    );
}

#[rstest]
#[case("ssh", TransportBackend::Ssh)]
#[case("dry-run", TransportBackend::DryRun)]
#[case(" Fake ", TransportBackend::DryRun)]
fn backend_names_parse(#[case] raw: &str, #[case] expected: TransportBackend) {
    assert_eq!(raw.parse::<TransportBackend>(), Ok(expected));
}

#[rstest]
fn unknown_backend_is_rejected(config: TransportConfig) {
    let cfg = TransportConfig {
        backend: String::from("telnet"),
        ..config
    };
    assert_eq!(
        cfg.validate(),
        Err(TransportError::UnknownBackend(String::from("telnet")))
    );
}

#[rstest]
fn validation_rejects_blank_binaries(config: TransportConfig) {
    for (field, cfg) in [
        (
            "ssh_bin",
            TransportConfig {
                ssh_bin: String::from(" "),
                ..config.clone()
            },
        ),
        (
            "scp_bin",
            TransportConfig {
                scp_bin: String::new(),
                ..config.clone()
            },
        ),
    ] {
        let Err(TransportError::InvalidConfig { field: reported }) = cfg.validate() else {
            panic!("{field} should fail validation");
        };
        assert_eq!(reported, field);
    }
}

#[rstest]
fn invalid_config_message_names_env_var_and_key() {
    let err = TransportError::InvalidConfig {
        field: String::from("ssh_bin"),
    };
    assert_eq!(
        err.to_string(),
        "missing ssh_bin: set FLEETRUN_TRANSPORT_SSH_BIN or add ssh_bin to [transport] in fleetrun.toml"
    );
}

#[rstest]
fn dry_run_backend_reports_success_without_output(config: TransportConfig) {
    let cfg = TransportConfig {
        backend: String::from("dry-run"),
        ..config
    };
    let transport = cfg.build().expect("dry run should build");

    let output = transport
        .exec(&endpoint(None, None), "rm -rf /")
        .expect("dry run exec succeeds");

    assert!(output.is_success());
    assert!(output.lines.is_empty());
}

#[test]
fn background_exec_joins_with_command_output() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "done\n", "");
    let transport: Arc<dyn Transport> = Arc::new(transport(config(), &runner));

    let handle = exec_in_background(
        transport,
        endpoint(None, Some("/keys/fleet.pem")),
        String::from("./bench.sh"),
    );
    assert_eq!(handle.host(), "10.0.0.5");
    let output = handle.join().expect("background command should succeed");

    assert_eq!(output.lines, vec![String::from("done")]);
    assert_eq!(
        runner.invocations().first().map(|inv| inv.args.last().cloned()),
        Some(Some(OsString::from("./bench.sh")))
    );
}
