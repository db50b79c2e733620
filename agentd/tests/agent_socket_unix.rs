#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use workerd_control::{ControlConfig, ControlDaemon, LifecycleState};

const SECRET: &str = "test-secret";

fn spawn_agentd(socket: &str, extra: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_agentd"))
        .arg("--socket")
        .arg(socket)
        .arg("--secret")
        .arg(SECRET)
        .arg("--debug")
        .args(extra)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn agentd")
}

async fn connect_when_ready(config: ControlConfig) -> ControlDaemon {
    for _ in 0..50 {
        match ControlDaemon::connect(config.clone()).await {
            Ok(daemon) => return daemon,
            Err(_) => sleep(Duration::from_millis(100)).await,
        }
    }
    panic!("agentd never accepted a worker");
}

async fn wait_for_state(daemon: &ControlDaemon, state: LifecycleState) {
    timeout(Duration::from_secs(5), async {
        while daemon.state() != state {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("worker never reached {}", state));
}

#[tokio::test]
async fn agent_cancels_after_progress_reports() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agentd.sock").to_string_lossy().to_string();
    let mut child = spawn_agentd(&socket, &["--cancel-after", "2"]);

    let mut config = ControlConfig::new(socket.clone(), "worker:itest");
    config.secret = Some(SECRET.into());
    let daemon = connect_when_ready(config).await;

    daemon.report_progress(0.25).unwrap();
    daemon.report_progress(0.5).unwrap();
    wait_for_state(&daemon, LifecycleState::Cancelled).await;

    daemon.shutdown().await;
    assert_eq!(daemon.state(), LifecycleState::Cancelled);
    let _ = child.kill().await;
}

#[tokio::test]
async fn agent_drops_workers_with_a_bad_signature() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agentd.sock").to_string_lossy().to_string();
    let mut child = spawn_agentd(&socket, &[]);

    let mut config = ControlConfig::new(socket.clone(), "worker:intruder");
    config.secret = Some("wrong-secret".into());
    let daemon = connect_when_ready(config).await;

    wait_for_state(&daemon, LifecycleState::Faulted).await;
    daemon.shutdown().await;
    let _ = child.kill().await;
}
