//! Supervisor lifecycle against a scripted fake binary: bounded
//! auto-restarts, exhaustion and reset, reload gating on the on-disk
//! config, and auto-reload after a store write.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use serial_test::serial;

use orbit_node::{ConfigValidator, Node, SupervisorState};
use orbit_types::{NodeResult, NodeSettings, ValidationIssue, ValidationReport};

/// Accepts everything in `validate`; `validate_file` actually parses the
/// on-disk bytes so a corrupted file is rejected the way the real
/// binary would reject it.
struct FileAwareValidator;

#[async_trait]
impl ConfigValidator for FileAwareValidator {
    async fn validate(&self, _document: &Value) -> NodeResult<ValidationReport> {
        Ok(ValidationReport::ok())
    }

    async fn validate_file(&self, path: &Path) -> NodeResult<ValidationReport> {
        let bytes = std::fs::read(path).unwrap_or_default();
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(_) => Ok(ValidationReport::ok()),
            Err(e) => Ok(ValidationReport::rejected(ValidationIssue::singbox(
                format!("decode config: {}", e),
            ))),
        }
    }
}

fn fake_binary(dir: &Path, run_body: &str) -> PathBuf {
    let path = dir.join("sing-box");
    let mut f = std::fs::File::create(&path).expect("create script");
    writeln!(
        f,
        "#!/bin/sh\ncase \"$1\" in\nrun)\n{}\n;;\nversion)\necho 'sing-box version 1.10.3'\n;;\n*)\nexit 0\n;;\nesac",
        run_body
    )
    .expect("write script");
    let mut perms = f.metadata().expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn settings(dir: &Path, binary: PathBuf) -> NodeSettings {
    NodeSettings {
        config_path: dir.join("config.json"),
        binary,
        auto_restart: true,
        restart_delay: Duration::from_millis(10),
        max_restarts: 2,
        restart_window: Duration::from_secs(60),
        backup_enabled: false,
        auto_reload: false,
        ..NodeSettings::default()
    }
}

fn seed_config(dir: &Path) {
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&json!({"outbounds": [{"type": "direct", "tag": "d"}]}))
            .expect("serialize"),
    )
    .expect("seed");
}

async fn wait_for_state(node: &Node, wanted: SupervisorState, within: Duration) {
    let deadline = Instant::now() + within;
    loop {
        if node.supervisor().state() == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "supervisor stuck in {:?}, wanted {:?}",
            node.supervisor().state(),
            wanted
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// Timing-sensitive: keep the scheduler to itself.
#[tokio::test]
#[serial]
async fn crashing_child_exhausts_bounded_restarts() {
    let td = tempfile::tempdir().expect("tempdir");
    seed_config(td.path());
    // Survives the 500 ms liveness gate, then crashes.
    let binary = fake_binary(td.path(), "sleep 0.7\nexit 1");
    let node =
        Node::with_validator(settings(td.path(), binary), Arc::new(FileAwareValidator))
            .expect("node");

    node.supervisor().start().await.expect("initial start");
    assert_eq!(node.supervisor().state(), SupervisorState::Running);

    // Two auto-restart attempts, then exhaustion.
    wait_for_state(&node, SupervisorState::Exhausted, Duration::from_secs(20)).await;
    let status = node.supervisor().status().await;
    assert_eq!(status.restart_stats.total, 2);
    assert!(!status.running);
    assert!(status.pid.is_none());

    // While exhausted, manual start is refused.
    let err = node.supervisor().start().await.expect_err("exhausted");
    assert_eq!(err.code(), "PROCESS_ERROR");

    // Reset clears the flag and allows a manual start again.
    node.supervisor().reset_restart_stats();
    assert_eq!(node.supervisor().state(), SupervisorState::NotRunning);
    let status = node.supervisor().status().await;
    assert_eq!(status.restart_stats.total, 0);
    assert_eq!(status.restart_stats.in_window, 0);

    node.supervisor().start().await.expect("start after reset");
    node.supervisor().stop().await.expect("stop");
    assert_eq!(node.supervisor().state(), SupervisorState::NotRunning);
}

#[tokio::test]
async fn reload_with_corrupted_config_keeps_child_running() {
    let td = tempfile::tempdir().expect("tempdir");
    seed_config(td.path());
    let binary = fake_binary(td.path(), "trap '' HUP\nwhile :; do sleep 1; done");
    let mut node_settings = settings(td.path(), binary);
    node_settings.auto_restart = false;
    let node =
        Node::with_validator(node_settings, Arc::new(FileAwareValidator)).expect("node");

    let pid = node.supervisor().start().await.expect("start");

    // Corrupt the active config behind the store's back.
    std::fs::write(td.path().join("config.json"), "{definitely not json").expect("corrupt");

    let err = node.supervisor().reload().await.expect_err("invalid config");
    assert_eq!(err.code(), "CONFIG_VALIDATION_ERROR");
    let orbit_types::NodeError::ConfigValidation(report) = &err else {
        panic!("unexpected error variant: {:?}", err);
    };
    assert_eq!(report.errors[0].code, "SINGBOX_VALIDATION_ERROR");

    // The child was never signalled: same pid, still running.
    assert_eq!(node.supervisor().state(), SupervisorState::Running);
    assert_eq!(node.supervisor().status().await.pid, Some(pid));

    // Repairing the file makes reload succeed against the same child.
    seed_config(td.path());
    let outcome = node.supervisor().reload().await.expect("reload");
    assert_eq!(outcome.pid, pid);

    node.shutdown().await.expect("shutdown");
}

#[tokio::test]
#[serial]
async fn store_write_triggers_auto_reload() {
    let td = tempfile::tempdir().expect("tempdir");
    seed_config(td.path());
    let marker = td.path().join("hup-count");
    // Count SIGHUPs so the test can observe the reload.
    let binary = fake_binary(
        td.path(),
        &format!(
            "trap 'echo hup >> {}' HUP\nwhile :; do sleep 1; done",
            marker.display()
        ),
    );
    let mut node_settings = settings(td.path(), binary);
    node_settings.auto_reload = true;
    node_settings.auto_restart = false;
    let node =
        Node::with_validator(node_settings, Arc::new(FileAwareValidator)).expect("node");

    node.supervisor().start().await.expect("start");

    node.store()
        .set_document(
            json!({"outbounds": [{"type": "direct", "tag": "updated"}]}),
            None,
        )
        .await
        .expect("write");

    // The shell delivers the trap once its current sleep finishes.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if std::fs::read_to_string(&marker)
            .map(|s| s.lines().count() >= 1)
            .unwrap_or(false)
        {
            break;
        }
        assert!(Instant::now() < deadline, "SIGHUP never observed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(node.supervisor().state(), SupervisorState::Running);
    node.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn version_surfaces_in_status() {
    let td = tempfile::tempdir().expect("tempdir");
    seed_config(td.path());
    let binary = fake_binary(td.path(), "exec sleep 30");
    let node =
        Node::with_validator(settings(td.path(), binary), Arc::new(FileAwareValidator))
            .expect("node");

    let status = node.status().await;
    assert_eq!(status.version.as_deref(), Some("1.10.3"));
    assert!(!status.running);
}
