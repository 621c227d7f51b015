use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON client for the controller's REST endpoints.
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, url)
            .header("authorization", format!("Token {}", self.token))
            .header("content-type", "application/json")
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.send(self.request(Method::GET, path), path).await?;
        Ok(resp.json().await?)
    }

    pub async fn patch_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        self.send(self.request(Method::PATCH, path).json(body), path)
            .await?;
        Ok(())
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        self.send(self.request(Method::POST, path).json(body), path)
            .await?;
        Ok(())
    }

    async fn send(&self, req: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response> {
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "controller request {path} timed out after {}s",
                    REQUEST_TIMEOUT.as_secs()
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("controller unreachable for {path}: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format_api_error(status, path, &text));
        }
        Ok(resp)
    }
}

fn format_api_error(status: StatusCode, path: &str, body: &str) -> anyhow::Error {
    let body = body.trim();
    if body.is_empty() {
        anyhow!("controller returned {status} for {path}")
    } else {
        anyhow!("controller returned {status} for {path}: {body}")
    }
}

pub fn taskrunner_path(task_id: i64, agent_id: &str) -> String {
    format!("/api/v3/{task_id}/{agent_id}/taskrunner/")
}

pub fn package_result_path(pending_action_pk: i64) -> String {
    format!("/api/v3/{pending_action_pk}/packageresult/")
}

pub const PACKAGE_MANAGER_PATH: &str = "/api/v3/packagemanager/";

pub fn os_updates_path(agent_id: &str) -> String {
    format!("/api/v3/{agent_id}/osupdates/")
}

pub fn os_updates_install_path(agent_id: &str) -> String {
    format!("/api/v3/{agent_id}/osupdates/install/")
}

pub fn sysinfo_path(agent_id: &str) -> String {
    format!("/api/v3/{agent_id}/sysinfo/")
}

pub fn software_path(agent_id: &str) -> String {
    format!("/api/v3/{agent_id}/software/")
}

pub fn checkrunner_path(agent_id: &str) -> String {
    format!("/api/v3/{agent_id}/checkrunner/")
}

pub const CHECK_RESULTS_PATH: &str = "/api/v3/checkrunner/";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ControllerClient::new("https://rmm.example.com/", "t");
        assert_eq!(client.base_url(), "https://rmm.example.com");
    }

    #[test]
    fn paths_match_controller_routes() {
        assert_eq!(taskrunner_path(7, "a1"), "/api/v3/7/a1/taskrunner/");
        assert_eq!(package_result_path(3), "/api/v3/3/packageresult/");
        assert_eq!(os_updates_install_path("a1"), "/api/v3/a1/osupdates/install/");
    }

    #[test]
    fn api_error_includes_body_when_present() {
        let err = format_api_error(StatusCode::BAD_REQUEST, "/x/", "nope");
        assert_eq!(err.to_string(), "controller returned 400 Bad Request for /x/: nope");
        let err = format_api_error(StatusCode::NOT_FOUND, "/x/", "  ");
        assert_eq!(err.to_string(), "controller returned 404 Not Found for /x/");
    }
}
