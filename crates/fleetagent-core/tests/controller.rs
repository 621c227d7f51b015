mod common;

use std::time::Duration;

use common::{eventually, harness, FakeHost, AGENT_ID};
use fleetagent_core::jobs;
use fleetagent_schema::Command;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn run_task_fetches_script_and_patches_result() {
    let server = MockServer::start().await;
    let route = format!("/api/v3/7/{AGENT_ID}/taskrunner/");
    Mock::given(method("GET"))
        .and(path(route.as_str()))
        .and(header("authorization", "Token tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "script": { "code": "echo \"task $1\"", "shell": "shell" },
            "args": ["seven"],
            "timeout": 10
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(route.as_str()))
        .and(body_partial_json(json!({ "stdout": "task seven\n", "retcode": 0 })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(FakeHost::new(), &server.uri()).await;
    let result = jobs::run_task(&h.ctx, 7).await.unwrap();
    assert_eq!(result.retcode, 0);
}

#[tokio::test]
async fn controller_error_status_surfaces_path_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v3/8/{AGENT_ID}/taskrunner/")))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such task"))
        .mount(&server)
        .await;

    let h = harness(FakeHost::new(), &server.uri()).await;
    let err = jobs::run_task(&h.ctx, 8).await.unwrap_err().to_string();
    assert!(err.contains("404"), "got {err}");
    assert!(err.contains("/api/v3/8/agent-1/taskrunner/"), "got {err}");
    assert!(err.contains("no such task"), "got {err}");
}

#[tokio::test]
async fn run_checks_reports_each_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v3/{AGENT_ID}/checkrunner/")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "checks": [
                { "id": 1, "script": { "code": "exit 0", "shell": "shell" } },
                { "id": 2, "script": { "code": "exit 2", "shell": "shell" }, "timeout": 5 }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/checkrunner/"))
        .and(body_partial_json(json!({ "id": 1, "agent_id": AGENT_ID, "retcode": 0 })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/checkrunner/"))
        .and(body_partial_json(json!({ "id": 2, "retcode": 2 })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(FakeHost::new(), &server.uri()).await;
    assert_eq!(jobs::run_checks(&h.ctx).await.unwrap(), 2);
}

#[tokio::test]
async fn install_package_acknowledges_then_reports() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/v3/41/packageresult/"))
        .and(body_partial_json(json!({ "results": "htop installed" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(FakeHost::new(), &server.uri()).await;
    let mut cmd = Command::new("install-package");
    cmd.package_name = Some("htop".into());
    cmd.pending_action_pk = Some(41);
    let reply: String = h.request(&cmd).await;
    assert_eq!(reply, "ok");

    let host = h.host.clone();
    eventually(move || host.installed_packages.lock().unwrap().len() == 1).await;
    // The PATCH follows the install; give it a moment before verifying.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.verify().await;
}

#[tokio::test]
async fn system_info_refresh_pushes_facts_with_public_ip() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/v3/{AGENT_ID}/sysinfo/")))
        .and(body_partial_json(json!({ "hostname": "web-01", "public_ip": "203.0.113.7" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(FakeHost::new(), &server.uri()).await;
    let reply: String = h.request(&Command::new("system-info-refresh")).await;
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn unreachable_controller_error_is_replied() {
    let h = harness(FakeHost::new(), "http://127.0.0.1:9").await;
    let reply: String = h.request(&Command::new("system-info-refresh")).await;
    assert!(reply.contains("/api/v3/agent-1/sysinfo/"), "got {reply}");
}
