use std::time::Duration;

use fleetagent_runtime::{kill, procfs, run_raw, SupervisorError, TIMEOUT_EXIT_CODE};

async fn wait_until_dead(pid: i32) -> bool {
    for _ in 0..40 {
        if !procfs::is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn timeout_reports_synthetic_exit_code() {
    let out = run_raw("sh", "echo started; sleep 30", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(out.timed_out);
    assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
    assert!(out.stderr.contains("timed out after 1 seconds"));
    assert!(out.duration < Duration::from_secs(10));
}

#[tokio::test]
async fn timeout_kills_grandchildren() {
    let out = run_raw(
        "sh",
        "sleep 30 & echo $!; wait",
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert!(out.timed_out);
    let grandchild: i32 = out.stdout.trim().parse().unwrap();
    assert!(wait_until_dead(grandchild).await, "grandchild {grandchild} survived");
    if let Some(pid) = out.pid {
        assert!(wait_until_dead(pid as i32).await);
    }
}

#[tokio::test]
async fn background_job_holding_pipe_is_reaped_after_exit() {
    let out = run_raw("sh", "sleep 15 & echo $!", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!out.timed_out);
    assert_eq!(out.exit_code, 0);
    assert!(out.duration < Duration::from_secs(5), "took {:?}", out.duration);
    let leftover: i32 = out.stdout.trim().parse().unwrap();
    assert!(wait_until_dead(leftover).await, "background job {leftover} survived");
}

#[tokio::test]
async fn kill_takes_children_down_too() {
    let mut parent = std::process::Command::new("/bin/sh")
        .args(["-c", "sleep 30 & sleep 30 & wait"])
        .spawn()
        .unwrap();
    let pid = parent.id() as i32;

    let mut children = Vec::new();
    for _ in 0..40 {
        children = procfs::children_of(pid);
        if children.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(children.len(), 2);

    kill(pid).unwrap();
    parent.wait().unwrap();
    for child in children {
        assert!(wait_until_dead(child).await, "child {child} survived");
    }
}

#[tokio::test]
async fn kill_of_exited_process_is_not_found() {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();
    assert!(matches!(kill(pid), Err(SupervisorError::ProcessNotFound(_))));
}
