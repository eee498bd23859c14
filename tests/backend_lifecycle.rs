//! Supervisor + pipeline against real child processes.
#![cfg(unix)]

use devserve::backend::{build_args, BackendConfig, Mode};
use devserve::config::DevConfig;
use devserve::pipeline::{Pipeline, KILL_BACKEND, SPAWN_BACKEND};
use devserve::supervisor::{BackendSupervisor, State, StopOutcome};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

/// Fake backend: records its argv and pid, then sleeps.
fn write_fake_backend(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        "#!/bin/sh\necho \"$@\" > args.txt\necho $$ >> pids.txt\nexec sleep 30\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(s) = std::fs::read_to_string(path) {
            if !s.is_empty() {
                return s;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

fn backend_config(dir: &Path, binary: &Path) -> BackendConfig {
    BackendConfig {
        heapster_host: "h".to_string(),
        tls_cert_file: "c.pem".to_string(),
        tls_key_file: "k.pem".to_string(),
        dev_port: 8000,
        prod_port: 9443,
        kubeconfig_path: None,
        apiserver_host: "api.local".to_string(),
        apiserver_host_override: None,
        binary_path: binary.to_path_buf(),
        working_dir: dir.to_path_buf(),
    }
}

#[tokio::test]
async fn launch_passes_built_args_and_runs_in_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_fake_backend(dir.path(), "dashboard");
    let cfg = backend_config(dir.path(), &binary);

    let sup = BackendSupervisor::default();
    sup.launch(Mode::Development, &cfg).await.unwrap();
    assert_eq!(sup.state(), State::Running);

    let recorded = wait_for_file(&dir.path().join("args.txt")).await;
    assert_eq!(recorded.trim(), build_args(Mode::Development, &cfg).join(" "));
    assert!(recorded.contains("--apiserver-host=api.local"));

    assert_eq!(sup.stop().await.unwrap(), StopOutcome::Stopped);
    assert_eq!(sup.state(), State::Stopped);
    assert_eq!(sup.stop().await.unwrap(), StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn restart_through_task_graph_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    write_fake_backend(dir.path(), "dashboard");

    let mut cfg = DevConfig::default();
    cfg.paths.serve = dir.path().to_path_buf();
    let pipeline = Pipeline::new(cfg);
    let graph = pipeline.graph().unwrap();

    graph.run(SPAWN_BACKEND).await.unwrap();
    let first = pipeline.supervisor().pid().unwrap();

    // kill-backend 이 먼저 끝나야 새 프로세스가 뜬다
    graph.run(SPAWN_BACKEND).await.unwrap();
    let second = pipeline.supervisor().pid().unwrap();
    assert_ne!(first, second);

    let pids = wait_for_file(&dir.path().join("pids.txt")).await;
    assert!(pids.lines().count() >= 1);

    graph.run(KILL_BACKEND).await.unwrap();
    assert!(!pipeline.supervisor().is_running());
    assert!(pipeline.supervisor().status().last_exit.is_some());
}

#[tokio::test]
async fn crash_is_observed_without_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crashy");
    std::fs::write(&path, "#!/bin/sh\nexit 7\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let sup = BackendSupervisor::new(Some(Duration::from_secs(5)));
    sup.start(&path, &[], dir.path()).await.unwrap();
    sup.wait_for_exit().await.unwrap();

    let status = sup.status();
    assert_eq!(status.state, State::Stopped);
    assert!(status.pid.is_none());
    assert!(status.last_exit.unwrap().contains('7'));

    // 남은 상태 없이 재시작 가능
    sup.start(&path, &[], dir.path()).await.unwrap();
    sup.wait_for_exit().await.unwrap();
}
