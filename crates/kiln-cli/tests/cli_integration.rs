//! CLI subprocess integration tests.
//!
//! These tests invoke the `kiln` binary as a subprocess against a temporary
//! storage root and the mock worker, and check exit codes, stdout content,
//! and JSON output shape.

use std::path::Path;
use std::process::{Command, Output};

const MIRROR: &str = "http://mirror.invalid/debian";

fn kiln_bin(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
    // Keep the user's configuration and environment out of the tests.
    cmd.env_remove("KILN_CONFIG")
        .env_remove("KILN_MIRROR")
        .env_remove("KILN_LOG")
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_CACHE_HOME", home.join("cache"));
    cmd
}

fn storage_args(storage: &Path) -> Vec<String> {
    vec![
        "--storage".to_owned(),
        storage.to_string_lossy().into_owned(),
    ]
}

fn run(home: &Path, args: &[&str]) -> Output {
    let storage = home.join("store");
    kiln_bin(home)
        .args(storage_args(&storage))
        .args(args)
        .output()
        .unwrap()
}

fn bootstrap(home: &Path) -> Output {
    run(
        home,
        &[
            "sbuild-tarball",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--suite",
            "sid",
            "--architecture",
            "amd64",
        ],
    )
}

fn code(output: &Output) -> i32 {
    output.status.code().unwrap_or(-1)
}

#[test]
fn cli_version_exits_zero() {
    let home = tempfile::tempdir().unwrap();
    let output = kiln_bin(home.path()).arg("--version").output().unwrap();
    assert!(output.status.success(), "kiln --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kiln"), "version output must contain 'kiln': {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let home = tempfile::tempdir().unwrap();
    let output = kiln_bin(home.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["sbuild-tarball", "sbuild", "list", "verify", "remove"] {
        assert!(stdout.contains(command), "help must list '{command}': {stdout}");
    }
}

#[test]
fn cli_bootstrap_installs_snapshot() {
    let home = tempfile::tempdir().unwrap();
    let output = bootstrap(home.path());
    assert_eq!(
        code(&output),
        0,
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let tarball = home.path().join("store").join("debian-sid-amd64.tar.gz");
    assert!(tarball.is_file(), "snapshot must exist at {}", tarball.display());
    assert!(home.path().join("store").join("debian-sid-amd64.json").is_file());
}

#[test]
fn cli_bootstrap_json_reports_stage() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &[
            "--json",
            "sbuild-tarball",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
        ],
    );
    assert_eq!(code(&output), 0);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let results = value.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["stage"], "sbuild-tarball");
    assert_eq!(results[0]["outcome"], "success");
    assert_eq!(results[0]["worker_state"], "stopped");
    assert!(results[0]["artifact"]
        .as_str()
        .unwrap()
        .ends_with("debian-sid-amd64.tar.gz"));
}

#[test]
fn cli_build_without_snapshot_is_skipped() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &[
            "--json",
            "sbuild",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
            "hello",
        ],
    );
    assert_eq!(code(&output), 77);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value[0]["outcome"], "skipped");
    assert_eq!(value[0]["cause"]["kind"], "snapshot_missing");
    assert!(value[0]["worker_state"].is_null(), "no worker may be started");
}

#[test]
fn cli_build_after_bootstrap_succeeds() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(code(&bootstrap(home.path())), 0);

    let out_dir = home.path().join("out");
    let output = run(
        home.path(),
        &[
            "sbuild",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
            "--output-dir",
            out_dir.to_str().unwrap(),
            "hello",
        ],
    );
    assert_eq!(
        code(&output),
        0,
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(out_dir.join("mock-exec.log").is_file());
}

#[test]
fn cli_dsc_without_its_files_is_config_error() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(code(&bootstrap(home.path())), 0);
    let dsc = home.path().join("hello_2.10-3.dsc");
    std::fs::write(&dsc, "Source: hello\nFiles:\n 00 1 hello_2.10.orig.tar.gz\n").unwrap();

    let output = run(
        home.path(),
        &[
            "sbuild",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
            dsc.to_str().unwrap(),
        ],
    );
    assert_eq!(code(&output), 2);
    assert!(String::from_utf8_lossy(&output.stderr).contains("hello_2.10.orig.tar.gz"));
}

#[test]
fn cli_tarball_first_runs_both_stages() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &[
            "--json",
            "sbuild",
            "--tarball-first",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
            "hello",
        ],
    );
    assert_eq!(code(&output), 0);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let stages: Vec<_> = value
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["stage"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(stages, ["sbuild-tarball", "sbuild"]);
}

#[test]
fn cli_mirror_from_environment() {
    let home = tempfile::tempdir().unwrap();
    let storage = home.path().join("store");
    let output = kiln_bin(home.path())
        .args(storage_args(&storage))
        .args([
            "sbuild-tarball",
            "--worker",
            "mock local",
            "--architecture",
            "amd64",
        ])
        .env("KILN_MIRROR", "http://env.invalid/debian")
        .output()
        .unwrap();
    assert_eq!(code(&output), 0);
    let record = std::fs::read_to_string(storage.join("debian-sid-amd64.json")).unwrap();
    assert!(record.contains("http://env.invalid/debian"), "record: {record}");
}

#[test]
fn cli_no_mirror_is_config_error() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &["sbuild-tarball", "--worker", "mock local", "--architecture", "amd64"],
    );
    assert_eq!(code(&output), 2);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("mirror"), "stderr: {stderr}");
    assert!(!home.path().join("store").exists(), "storage must stay untouched");
}

#[test]
fn cli_invalid_descriptor_is_config_error() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &[
            "sbuild-tarball",
            "--worker",
            "docker image",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
        ],
    );
    assert_eq!(code(&output), 2);
}

#[test]
fn cli_missing_qemu_image_is_config_error() {
    let home = tempfile::tempdir().unwrap();
    let output = run(
        home.path(),
        &[
            "--json",
            "sbuild-tarball",
            "--worker",
            "qemu /nonexistent/worker.qcow2",
            "--mirror",
            MIRROR,
            "--architecture",
            "amd64",
        ],
    );
    assert_eq!(code(&output), 2);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["cause"]["kind"], "invalid_descriptor");
}

#[test]
fn cli_worker_from_config_file() {
    let home = tempfile::tempdir().unwrap();
    let config = home.path().join("kiln.toml");
    std::fs::write(
        &config,
        "worker = \"mock configured\"\narchitecture = \"amd64\"\n\n[mirrors]\ndebian = \"http://config.invalid/debian\"\n",
    )
    .unwrap();
    let output = run(
        home.path(),
        &["--config", config.to_str().unwrap(), "sbuild-tarball"],
    );
    assert_eq!(
        code(&output),
        0,
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let record =
        std::fs::read_to_string(home.path().join("store").join("debian-sid-amd64.json")).unwrap();
    assert!(record.contains("http://config.invalid/debian"));
    assert!(record.contains("mock configured"));
}

#[test]
fn cli_missing_config_file_is_config_error() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["--config", "/nonexistent/kiln.toml", "list"]);
    assert_eq!(code(&output), 2);
}

#[test]
fn cli_list_empty_and_populated() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["list"]);
    assert_eq!(code(&output), 0);
    assert!(String::from_utf8_lossy(&output.stdout).contains("no snapshots"));

    assert_eq!(code(&bootstrap(home.path())), 0);
    let output = run(home.path(), &["--json", "list"]);
    assert_eq!(code(&output), 0);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entries = value.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"]["suite"], "sid");
    assert_eq!(entries[0]["record"]["mirror"], MIRROR);
}

#[test]
fn cli_verify_detects_tampering() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(code(&bootstrap(home.path())), 0);

    let output = run(home.path(), &["verify", "sid", "--architecture", "amd64"]);
    assert_eq!(code(&output), 0, "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("ok"));

    let tarball = home.path().join("store").join("debian-sid-amd64.tar.gz");
    let mut bytes = std::fs::read(&tarball).unwrap();
    bytes.extend_from_slice(b"tampered");
    std::fs::write(&tarball, bytes).unwrap();

    let output = run(
        home.path(),
        &["--json", "verify", "sid", "--architecture", "amd64"],
    );
    assert_eq!(code(&output), 4);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["verified"], false);
}

#[test]
fn cli_remove_deletes_snapshot() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(code(&bootstrap(home.path())), 0);

    let output = run(
        home.path(),
        &["--json", "remove", "sid", "--architecture", "amd64"],
    );
    assert_eq!(code(&output), 0);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["removed"], true);
    assert!(!home.path().join("store").join("debian-sid-amd64.tar.gz").exists());

    let output = run(home.path(), &["remove", "sid", "--architecture", "amd64"]);
    assert_eq!(code(&output), 0);
    assert!(String::from_utf8_lossy(&output.stdout).contains("no snapshot"));
}

#[test]
fn cli_unstable_alias_shares_snapshot() {
    let home = tempfile::tempdir().unwrap();
    assert_eq!(code(&bootstrap(home.path())), 0);
    let output = run(home.path(), &["verify", "unstable", "--architecture", "amd64"]);
    assert_eq!(code(&output), 0);
}

#[test]
fn cli_unusable_storage_is_store_error() {
    let home = tempfile::tempdir().unwrap();
    let not_a_dir = home.path().join("store-file");
    std::fs::write(&not_a_dir, b"not a directory").unwrap();

    let output = kiln_bin(home.path())
        .args(storage_args(&not_a_dir))
        .args([
            "--json",
            "sbuild-tarball",
            "--worker",
            "mock local",
            "--mirror",
            MIRROR,
            "--suite",
            "sid",
            "--architecture",
            "amd64",
        ])
        .output()
        .unwrap();
    assert_eq!(code(&output), 4, "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"storage\""), "{stdout}");
}
