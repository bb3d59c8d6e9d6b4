#![cfg(unix)]

mod common;

use common::*;
use shuttle::builtin::{CONDITIONS_SUMMARY, ConditionsSummaryReport, registry_from_config};
use shuttle::{
    FileExchangeServer, FxsSystem, LocalFxsServer, ObjectStore, ProcessExecutor, ShuttleConfig,
    StorageKind, SubsystemConfig, SubsystemState,
};
use std::collections::BTreeMap;
use std::process::Command;
use std::sync::Arc;

#[tokio::test]
async fn test_child_process_plugin_commits_through_both_stores() {
    let mut harness = Harness::new(vec![
        SubsystemConfig::new("TPC")
            .plugin(CONDITIONS_SUMMARY)
            .archive(archive_endpoint())
            .setting("input_file_id", "gain"),
    ]);
    let daq_root = harness.dir.path().join("fxs-daq");
    harness.config = harness
        .config
        .clone()
        .file_exchange(FxsSystem::Daq, &daq_root)
        .plugin_program(env!("CARGO_BIN_EXE_shuttle"))
        .supervisor_poll_interval(std::time::Duration::from_millis(20));
    let config_path = harness.dir.path().join("shuttle.json");
    harness.config.save(&config_path).unwrap();

    let daq = LocalFxsServer::new(&daq_root);
    daq.publish(300, "TPC", "gain", Some("ldc-1"), b"abc").await.unwrap();
    daq.publish(300, "TPC", "gain", Some("ldc-2"), b"defgh").await.unwrap();
    harness.register(300).await;

    let executor = Arc::new(ProcessExecutor::from_config(&harness.config, &config_path).unwrap());
    let registry = registry_from_config(&harness.config).unwrap();
    let coordinator = harness.coordinator(executor, &registry);

    let report = coordinator.run_pass().await.unwrap();
    assert_eq!(report.state_of(300, "TPC"), Some(SubsystemState::Done));
    assert_eq!(report.completed_runs, vec![300]);

    let summaries = harness.primary.list("TPC/Calib").await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].metadata.producer_run, 300);
    let summary = harness.primary.load(&summaries[0].id).await.unwrap();
    let summary: ConditionsSummaryReport = serde_json::from_slice(&summary.payload).unwrap();
    assert_eq!(summary.run, 300);
    assert_eq!(summary.signals["HV_MEAN"].count, 3);
    assert!((summary.signals["GAS_FLOW"].mean - 2.0).abs() < 1e-9);

    let references = harness.reference.list("TPC/Ref").await.unwrap();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].metadata.kind, StorageKind::Reference);
    let sizes = harness.reference.load(&references[0].id).await.unwrap();
    let sizes: BTreeMap<String, u64> = serde_json::from_slice(&sizes.payload).unwrap();
    assert_eq!(sizes.get("ldc-1"), Some(&3));
    assert_eq!(sizes.get("ldc-2"), Some(&5));

    let consumed = daq.locate(300, "TPC", "gain", Some("ldc-2")).await.unwrap().unwrap();
    assert!(consumed.retrieved_at.is_some());
    assert!(harness.gateway().local_objects(300, "TPC").await.unwrap().is_empty());

    let plugin_log = std::fs::read_to_string(harness.config.log_dir.join("TPC.log")).unwrap();
    assert!(plugin_log.contains("summarized 2 signals"));
}

fn run_cli(config: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_shuttle"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_command_line_register_run_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = ShuttleConfig::new(dir.path())
        .subsystem(SubsystemConfig::new("TPC").plugin(CONDITIONS_SUMMARY))
        .supervisor_poll_interval(std::time::Duration::from_millis(20));
    let config_path = dir.path().join("shuttle.json");
    config.save(&config_path).unwrap();

    let registered = run_cli(
        &config_path,
        &[
            "register",
            "--run",
            "400",
            "--start",
            "2026-05-04T08:00:00Z",
            "--end",
            "2026-05-04T08:40:00Z",
            "--parameter",
            "beam=pp",
        ],
    );
    assert!(registered.status.success(), "{}", String::from_utf8_lossy(&registered.stderr));

    let pass = run_cli(&config_path, &["run", "--once"]);
    assert!(pass.status.success(), "{}", String::from_utf8_lossy(&pass.stderr));
    assert!(String::from_utf8_lossy(&pass.stdout).contains("1 runs seen, 1 completed"));

    let status = run_cli(&config_path, &["status", "--run", "400"]);
    let stdout = String::from_utf8_lossy(&status.stdout);
    assert!(stdout.contains("TPC"));
    assert!(stdout.contains("DONE"));

    let unknown = run_cli(&config_path, &["reset", "--run", "400", "--subsystem", "ZDC"]);
    assert!(!unknown.status.success());

    let reset = run_cli(&config_path, &["reset", "--run", "400", "--subsystem", "TPC"]);
    assert!(reset.status.success());
    let status = run_cli(&config_path, &["status", "--run", "400"]);
    assert!(String::from_utf8_lossy(&status.stdout).contains("UNPROCESSED"));
}
