//! HTTP fallback: a `/health` probe against the backend host.
//!
//! The WebSocket endpoint (`ws://host:3001/ws`) and the health endpoint
//! (`http://host:3001/health`) share host and port.

use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::error::{Result, SyncError};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub url: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Maps `ws(s)://host:port/anything` to `http(s)://host:port/health`.
pub fn health_url(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| SyncError::Config(format!("invalid endpoint {endpoint}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(SyncError::Config(format!(
                "unsupported endpoint scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot rewrite scheme of {endpoint}")))?;
    url.set_path("/health");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Connection failures report `reachable: false`; only a malformed
/// endpoint or client setup failure is an error.
pub async fn probe_health(endpoint: &str, auth_token: Option<&str>) -> Result<HealthStatus> {
    let url = health_url(endpoint)?;
    let client = reqwest::Client::builder()
        .timeout(DEFAULT_PROBE_TIMEOUT)
        .build()
        .map_err(|err| SyncError::Http(err.to_string()))?;

    let mut request = client.get(url.clone());
    if let Some(token) = auth_token.filter(|token| !token.is_empty()) {
        request = request.bearer_auth(token);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            Ok(HealthStatus {
                url: url.to_string(),
                reachable: status.is_success(),
                status: Some(status.as_u16()),
            })
        }
        Err(err) => {
            tracing::debug!(error = %err, url = %url, "Health probe failed");
            Ok(HealthStatus {
                url: url.to_string(),
                reachable: false,
                status: None,
            })
        }
    }
}
