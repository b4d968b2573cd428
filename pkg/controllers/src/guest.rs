//! Client for the HTTP API served by the in-guest agent.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use pkg_constants::network::GUEST_API_PORT;
use pkg_constants::state::GUEST_HTTP_TIMEOUT_MS;
use pkg_network::PortMapper;

/// `GET /version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub guest_arch: String,
}

impl GuestVersion {
    /// `(major, minor, patch)` of `version`, tolerating a leading `v` and a
    /// pre-release suffix.
    pub fn semver(&self) -> Option<(u64, u64, u64)> {
        let core = self.version.trim().trim_start_matches('v');
        let core = core.split(['-', '+']).next()?;
        let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
        let major = parts.next()??;
        let minor = parts.next().unwrap_or(Some(0))?;
        let patch = parts.next().unwrap_or(Some(0))?;
        Some((major, minor, patch))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Percent, 0-100.
    pub usage: f64,
    /// MHz.
    pub frequency: u64,
}

/// Used/total in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

/// `GET /metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestMetrics {
    pub cpu: CpuMetrics,
    pub ram: UsageMetrics,
    pub disk: UsageMetrics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RdpStatus {
    rdp_connected: bool,
}

pub struct GuestClient {
    base_url: String,
    http: reqwest::Client,
}

impl GuestClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_timeout(host, port, Duration::from_millis(GUEST_HTTP_TIMEOUT_MS))
    }

    pub fn with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: format!("http://{}:{}", host, port),
            http,
        })
    }

    /// Client for the resolved guest API port. `None` while the port is
    /// unresolved.
    pub fn from_mapper(mapper: &PortMapper) -> Option<Result<Self>> {
        let (host, port) = mapper.get_resolved_endpoint(GUEST_API_PORT)?;
        Some(Self::new(&host, port))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("guest API {} unreachable", path))?;
        check(path, resp).await
    }

    /// `GET /health`. Any failure means not ready.
    pub async fn health(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("[guest] health probe failed: {}", e);
                false
            }
        }
    }

    pub async fn version(&self) -> Result<GuestVersion> {
        Ok(self.get("/version").await?.json().await?)
    }

    pub async fn metrics(&self) -> Result<GuestMetrics> {
        Ok(self.get("/metrics").await?.json().await?)
    }

    pub async fn rdp_connected(&self) -> Result<bool> {
        let status: RdpStatus = self.get("/rdp/status").await?.json().await?;
        Ok(status.rdp_connected)
    }

    /// Installed applications as reported by the guest.
    pub async fn apps(&self) -> Result<Value> {
        Ok(self.get("/apps").await?.json().await?)
    }

    /// Icon of the executable at `path` inside the guest (base64 PNG).
    pub async fn icon(&self, path: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/get-icon"))
            .form(&[("path", path)])
            .send()
            .await
            .context("guest API /get-icon unreachable")?;
        Ok(check("/get-icon", resp).await?.text().await?)
    }

    /// Upload a guest agent update archive.
    pub async fn update(&self, archive: Vec<u8>, password: &str) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(archive)
            .file_name("update.zip")
            .mime_str("application/zip")?;
        let form = reqwest::multipart::Form::new()
            .part("updateFile", part)
            .text("password", password.to_string());
        let resp = self
            .http
            .post(self.url("/update"))
            .multipart(form)
            .send()
            .await
            .context("guest API /update unreachable")?;
        check("/update", resp).await?;
        Ok(())
    }

    /// Store the password hash the guest uses to authorize updates. The
    /// guest accepts this only once.
    pub async fn set_auth_hash(&self, hash: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/auth/set-hash"))
            .form(&[("authHash", hash)])
            .send()
            .await
            .context("guest API /auth/set-hash unreachable")?;
        check("/auth/set-hash", resp).await?;
        Ok(())
    }
}

async fn check(path: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("guest API {} returned {}: {}", path, status, body.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use pkg_types::port::{Protocol, ResolvedPortBinding};
    use std::collections::HashMap;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn fake_guest() -> Router {
        Router::new()
            .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
            .route(
                "/version",
                get(|| async {
                    Json(serde_json::json!({
                        "version": "0.8.7",
                        "commit_hash": "abc123",
                        "build_time": "2025-01-01T00:00:00Z",
                        "guest_arch": "amd64"
                    }))
                }),
            )
            .route(
                "/metrics",
                get(|| async {
                    Json(serde_json::json!({
                        "cpu": {"usage": 12.5, "frequency": 3200},
                        "ram": {"used": 2048, "total": 4096, "percentage": 50.0},
                        "disk": {"used": 10, "total": 64, "percentage": 15.6}
                    }))
                }),
            )
            .route(
                "/rdp/status",
                get(|| async { Json(serde_json::json!({"rdpConnected": true})) }),
            )
            .route(
                "/apps",
                get(|| async { Json(serde_json::json!([{"Name": "Notepad"}])) }),
            )
            .route(
                "/auth/set-hash",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("authHash").is_some_and(|h| !h.is_empty()) {
                        StatusCode::OK
                    } else {
                        StatusCode::BAD_REQUEST
                    }
                }),
            )
            .route(
                "/update",
                post(|mut mp: Multipart| async move {
                    let mut names = Vec::new();
                    let mut password = String::new();
                    while let Ok(Some(field)) = mp.next_field().await {
                        let name = field.name().unwrap_or_default().to_string();
                        let data = field.bytes().await.unwrap_or_default();
                        if name == "password" {
                            password = String::from_utf8_lossy(&data).to_string();
                        }
                        names.push(name);
                    }
                    if password != "hunter2" {
                        return StatusCode::UNAUTHORIZED;
                    }
                    if names.contains(&"updateFile".to_string()) {
                        StatusCode::OK
                    } else {
                        StatusCode::BAD_REQUEST
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let port = serve(fake_guest()).await;
        let client = GuestClient::new("127.0.0.1", port).unwrap();
        assert!(client.health().await);
        let v = client.version().await.unwrap();
        assert_eq!(v.version, "0.8.7");
        assert_eq!(v.guest_arch, "amd64");
        assert_eq!(v.semver(), Some((0, 8, 7)));
    }

    #[tokio::test]
    async fn test_metrics_rdp_apps() {
        let port = serve(fake_guest()).await;
        let client = GuestClient::new("127.0.0.1", port).unwrap();
        let m = client.metrics().await.unwrap();
        assert_eq!(m.cpu.frequency, 3200);
        assert_eq!(m.ram.total, 4096);
        assert!(client.rdp_connected().await.unwrap());
        assert_eq!(client.apps().await.unwrap()[0]["Name"], "Notepad");
    }

    #[tokio::test]
    async fn test_update_and_auth_hash() {
        let port = serve(fake_guest()).await;
        let client = GuestClient::new("127.0.0.1", port).unwrap();
        client.set_auth_hash("$2a$10$abc").await.unwrap();
        client.update(b"PK\x03\x04".to_vec(), "hunter2").await.unwrap();
        let err = client.update(b"PK".to_vec(), "wrong").await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_unreachable_guest_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client =
            GuestClient::with_timeout("127.0.0.1", port, Duration::from_millis(300)).unwrap();
        assert!(!client.health().await);
        assert!(client.version().await.is_err());
    }

    #[test]
    fn test_semver_variants() {
        let v = |s: &str| GuestVersion {
            version: s.to_string(),
            ..Default::default()
        };
        assert_eq!(v("v1.2.3").semver(), Some((1, 2, 3)));
        assert_eq!(v("0.9.0-beta.1").semver(), Some((0, 9, 0)));
        assert_eq!(v("2").semver(), Some((2, 0, 0)));
        assert_eq!(v("dev").semver(), None);
    }

    #[tokio::test]
    async fn test_client_from_resolved_mapper() {
        let port = serve(fake_guest()).await;
        let mut mapper = PortMapper::parse_tokens(&["127.0.0.1::7148"]).unwrap();
        assert!(GuestClient::from_mapper(&mapper).is_none());

        mapper.apply_resolved(&[ResolvedPortBinding {
            host_address: Some("0.0.0.0".into()),
            host_port: port,
            container_port: GUEST_API_PORT,
            protocol: Protocol::Tcp,
        }]);
        let client = GuestClient::from_mapper(&mapper).unwrap().unwrap();
        assert_eq!(client.base_url(), format!("http://127.0.0.1:{}", port));
        assert!(client.health().await);
    }
}
