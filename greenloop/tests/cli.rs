//! CLI tests for the `greenloop` binary.
//!
//! Spawns the binary and verifies exit codes and artifacts for the `run`,
//! `gate`, `verify-report` and `init-config` commands. The oracle is a
//! loopback server where one is needed.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};
use std::thread;

use greenloop::core::types::Verdict;
use greenloop::exit_codes;
use greenloop::io::config::{
    CheckSpec, ClassifierSpec, GreenloopConfig, OracleConfig, ScaffoldConfig, load_config,
    write_config,
};
use greenloop::io::gate::read_gate_artifact;
use greenloop::io::iteration_log::{ReportPaths, read_run_summary};

const UNSET_KEY_ENV: &str = "GREENLOOP_CLI_TEST_UNSET_KEY";
const SET_KEY_ENV: &str = "GREENLOOP_CLI_TEST_KEY";

fn sh_check(name: &str, script: &str) -> CheckSpec {
    CheckSpec {
        name: name.to_string(),
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        requires_bins: Vec::new(),
        requires_files: Vec::new(),
        timeout_secs: 30,
        evidence: None,
        classifier: ClassifierSpec::ExitStatus,
    }
}

/// Config whose only real check fails while `plugin.php` contains `BUG`.
fn write_test_config(path: &Path) {
    write_config(path, &test_config()).expect("write config");
}

fn test_config() -> GreenloopConfig {
    GreenloopConfig {
        oracle: OracleConfig {
            api_key_env: UNSET_KEY_ENV.to_string(),
            ..OracleConfig::default()
        },
        scaffold: ScaffoldConfig {
            provision: Vec::new(),
            validate: Vec::new(),
            timeout_secs: 30,
        },
        checks: vec![
            sh_check("syntax_lint", "exit 0"),
            sh_check("style", "if grep -q BUG plugin.php; then echo 'BUG found'; exit 1; fi"),
        ],
        ..GreenloopConfig::default()
    }
}

/// Answer one HTTP request with `status_line` and an empty JSON body.
fn serve_once(status_line: &'static str) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("read line");
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().expect("length");
            }
            if line == "\r\n" || line.is_empty() {
                break;
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).expect("body");
        let mut stream = stream;
        write!(
            stream,
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}"
        )
        .expect("respond");
    });
    (format!("http://{addr}"), handle)
}

fn greenloop(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_greenloop"))
        .args(args)
        .env_remove(UNSET_KEY_ENV)
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn greenloop")
}

fn target_args<'a>(root: &'a str, config: &'a str) -> Vec<&'a str> {
    vec![
        "--target",
        root,
        "--reports-dir",
        "",
        "--entry-point",
        "plugin.php",
        "--config",
        config,
    ]
}

struct Workspace {
    _temp: tempfile::TempDir,
    target: String,
    reports: String,
    config: String,
}

fn workspace(plugin: &str) -> Workspace {
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("plugin");
    fs::create_dir_all(&target).expect("mkdir");
    fs::write(target.join("plugin.php"), plugin).expect("write plugin");
    let config = temp.path().join("greenloop.toml");
    write_test_config(&config);
    Workspace {
        target: target.to_string_lossy().into_owned(),
        reports: temp.path().join("reports").to_string_lossy().into_owned(),
        config: config.to_string_lossy().into_owned(),
        _temp: temp,
    }
}

fn with_reports<'a>(mut args: Vec<&'a str>, reports: &'a str) -> Vec<&'a str> {
    args[3] = reports;
    args
}

#[test]
fn gate_exits_with_gate_failed_and_writes_report() {
    let ws = workspace("<?php // BUG\n");
    let mut args = vec!["gate"];
    args.extend(with_reports(target_args(&ws.target, &ws.config), &ws.reports));

    let out = greenloop(&args);

    assert_eq!(out.status.code(), Some(exit_codes::GATE_FAILED));
    let gate = read_gate_artifact(&Path::new(&ws.reports).join("gate.json")).expect("gate");
    assert!(!gate.summary.pass);
    let style = fs::read_to_string(Path::new(&ws.reports).join("style.txt")).expect("evidence");
    assert!(style.contains("BUG found"));
}

#[test]
fn run_on_green_tree_exits_ok_without_credentials() {
    let ws = workspace("<?php\n");
    let mut args = vec!["run", "--max-iterations", "3"];
    args.extend(with_reports(target_args(&ws.target, &ws.config), &ws.reports));

    let out = greenloop(&args);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("converged at iteration 0"));
    assert!(Path::new(&ws.reports).join("run.json").is_file());
}

#[test]
fn run_without_credentials_on_failing_tree_is_fatal() {
    let ws = workspace("<?php // BUG\n");
    let mut args = vec!["run", "--max-iterations", "2"];
    args.extend(with_reports(target_args(&ws.target, &ws.config), &ws.reports));

    let out = greenloop(&args);

    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains(UNSET_KEY_ENV));
    assert_eq!(
        fs::read_to_string(Path::new(&ws.target).join("plugin.php")).expect("read"),
        "<?php // BUG\n"
    );
    let summary = read_run_summary(&ReportPaths::new(Path::new(&ws.reports))).expect("run.json");
    assert_eq!(summary.verdict, Verdict::Aborted { iteration: 1 });
    assert_eq!(summary.records.len(), 1);
}

#[test]
fn run_stops_at_iteration_boundary_when_stop_file_exists() {
    let ws = workspace("<?php // BUG\n");
    let (base_url, server) = serve_once("HTTP/1.1 500 Internal Server Error");
    let mut config = test_config();
    config.oracle.base_url = base_url;
    config.oracle.api_key_env = SET_KEY_ENV.to_string();
    write_config(Path::new(&ws.config), &config).expect("write config");
    let stop_file = Path::new(&ws.reports).with_file_name("STOP");
    fs::write(&stop_file, "").expect("write stop file");
    let stop_arg = stop_file.to_string_lossy().into_owned();

    let mut args = vec!["run", "--max-iterations", "3", "--stop-file", &stop_arg];
    args.extend(with_reports(target_args(&ws.target, &ws.config), &ws.reports));
    let out = Command::new(env!("CARGO_BIN_EXE_greenloop"))
        .args(&args)
        .env(SET_KEY_ENV, "sk-test")
        .env_remove("RUST_LOG")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .output()
        .expect("spawn greenloop");
    server.join().expect("server");

    assert_eq!(
        out.status.code(),
        Some(exit_codes::STOPPED),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("stopped after iteration 1"));
    let summary = read_run_summary(&ReportPaths::new(Path::new(&ws.reports))).expect("run.json");
    assert_eq!(summary.verdict, Verdict::Stopped { after_iteration: 1 });
    assert_eq!(summary.patch_requests, 1);
}

#[test]
fn run_with_unreachable_target_is_fatal() {
    let ws = workspace("<?php\n");
    let missing = format!("{}/does-not-exist", ws.target);
    let mut args = vec!["run", "--max-iterations", "1"];
    args.extend(with_reports(target_args(&missing, &ws.config), &ws.reports));

    let out = greenloop(&args);

    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    assert!(String::from_utf8_lossy(&out.stderr).contains("not reachable"));
}

#[test]
fn verify_report_maps_summary_to_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let passing = temp.path().join("pass.json");
    fs::write(
        &passing,
        r#"{"timestamp":"2026-01-01T00:00:00Z","checks":[{"name":"lint","passed":true,"rc":0,"artifact":"lint.txt"}],"summary":{"pass":true}}"#,
    )
    .expect("write");
    let failing = temp.path().join("fail.json");
    fs::write(
        &failing,
        r#"{"timestamp":"2026-01-01T00:00:00Z","checks":[{"name":"lint","passed":false,"rc":1,"artifact":"lint.txt"}],"summary":{"pass":false}}"#,
    )
    .expect("write");
    let malformed = temp.path().join("bad.json");
    fs::write(&malformed, r#"{"checks":[]}"#).expect("write");

    let out = greenloop(&["verify-report", &passing.to_string_lossy()]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let out = greenloop(&["verify-report", &failing.to_string_lossy()]);
    assert_eq!(out.status.code(), Some(exit_codes::GATE_FAILED));
    let out = greenloop(&["verify-report", &malformed.to_string_lossy()]);
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
}

#[test]
fn init_config_writes_default_and_refuses_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("greenloop.toml");
    let path_arg = path.to_string_lossy().into_owned();

    let out = greenloop(&["init-config", &path_arg]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let config = load_config(&path).expect("load");
    assert_eq!(config, GreenloopConfig::default());

    let out = greenloop(&["init-config", &path_arg]);
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));

    let out = greenloop(&["init-config", "--force", &path_arg]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
}
