//! Proxy Manager (C7): the top-level orchestrator every HTTP request goes
//! through — resolves the model, arbitrates cross-group exclusivity,
//! ensures the owning process is Ready, and dispatches forwarding.
//!
//! Grounded on `proxy/server.rs` (state construction, router wiring,
//! graceful shutdown) and `proxy/state.rs` (`ProxyState`, generalized from
//! "one fixed Anthropic upstream" to "a table of per-model process groups").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::config::Config;
use crate::error::GatewayError;
use crate::group::ProcessGroup;
use crate::logmon::LogMonitor;
use crate::metrics::MetricsMonitor;
use crate::process::port::PortAllocator;
use crate::process::{Process, StopStrategy};
use crate::resolver::Resolver;

/// Shared state behind every axum handler, cloned as `Arc<ProxyManager>`.
pub struct ProxyManager {
    pub config: Arc<Config>,
    pub groups: HashMap<String, ProcessGroup>,
    pub proxy_logs: LogMonitor,
    pub upstream_logs: LogMonitor,
    pub metrics: MetricsMonitor,
    client: reqwest::Client,
}

impl ProxyManager {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let client = reqwest::Client::new();
        let ports = Arc::new(PortAllocator::new(config.start_port));
        let proxy_logs = LogMonitor::new(Box::new(crate::logmon::StdoutSink));
        let upstream_logs = LogMonitor::new(Box::new(proxy_logs.as_sink()));
        let health_check_timeout = Duration::from_secs(config.health_check_timeout);

        let mut groups = HashMap::new();
        for group_config in config.groups.values() {
            let mut processes = HashMap::new();
            for member_id in &group_config.members {
                let Some(model) = config.models.get(member_id) else {
                    continue;
                };
                processes.insert(
                    member_id.clone(),
                    Process::new(
                        model.clone(),
                        client.clone(),
                        ports.clone(),
                        upstream_logs.clone(),
                        health_check_timeout,
                    ),
                );
            }
            groups.insert(group_config.id.clone(), ProcessGroup::new(group_config.clone(), processes));
        }

        Self {
            metrics: MetricsMonitor::new(config.metrics_max_in_memory),
            config,
            groups,
            proxy_logs,
            upstream_logs,
            client,
        }
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.config)
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Ensure `model_id`'s process is Ready, including exclusive
    /// cross-group arbitration (spec.md §4.5 step 4, §4.4).
    pub async fn ensure_ready(&self, model_id: &str) -> Result<Process, GatewayError> {
        let group_id = self
            .config
            .group_for_model(model_id)
            .map(|g| g.id.clone())
            .ok_or_else(|| GatewayError::not_found(format!("unknown model {model_id}")))?;

        let group = self
            .groups
            .get(&group_id)
            .ok_or_else(|| GatewayError::internal(format!("group {group_id} missing from table")))?;

        let process = group.ensure_member(model_id, &self.config.macros).await?;

        if group.is_exclusive() {
            let futures = self.groups.iter().filter_map(|(id, other)| {
                if id == &group_id || other.is_persistent() {
                    None
                } else {
                    Some(other.stop_all(StopStrategy::WaitForInflight))
                }
            });
            for result in futures::future::join_all(futures).await {
                if let Err(err) = result {
                    tracing::warn!(%err, "exclusive arbitration stop failed");
                }
            }
        }

        Ok(process)
    }

    pub fn running(&self) -> Vec<(String, crate::process::State)> {
        self.groups
            .values()
            .flat_map(|g| g.members())
            .filter(|p| p.state() != crate::process::State::Stopped)
            .map(|p| (p.model_id().to_string(), p.state()))
            .collect()
    }

    pub async fn unload_all(&self) -> Result<(), GatewayError> {
        let futures = self.groups.values().map(|g| g.stop_all(StopStrategy::Immediate));
        for result in futures::future::join_all(futures).await {
            result?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let futures = self.groups.values().map(|g| g.shutdown());
        for result in futures::future::join_all(futures).await {
            if let Err(err) = result {
                tracing::warn!(%err, "error during group shutdown");
            }
        }
    }

    /// Spawn a background task per configured preload model that calls
    /// `ensure_ready`; failures are logged, not fatal (spec.md §4.5 step 7).
    pub fn spawn_preload(self: &Arc<Self>) {
        for model_id in self.config.preload.clone() {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.ensure_ready(&model_id).await {
                    tracing::warn!(model = %model_id, %err, "preload failed");
                }
            });
        }
    }

}

/// Credential extracted from a request, in the order spec.md §6 prescribes:
/// Basic password field, then Bearer token, then `X-Api-Key`.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(basic) = auth.strip_prefix("Basic ") {
            if let Ok(decoded) = base64_decode(basic) {
                if let Some((_, password)) = decoded.split_once(':') {
                    return Some(password.to_string());
                }
            }
        }
        if let Some(bearer) = auth.strip_prefix("Bearer ") {
            return Some(bearer.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Constant-time equality, so API key comparison doesn't leak timing
/// information through early-exit comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn is_authorized(headers: &HeaderMap, valid_keys: &[String]) -> bool {
    if valid_keys.is_empty() {
        return true;
    }
    let Some(credential) = extract_credential(headers) else {
        return false;
    };
    valid_keys.iter().any(|key| constant_time_eq(key, &credential))
}

/// Headers stripped before upstream dispatch once auth succeeds.
pub const AUTH_HEADERS: &[&str] = &["authorization", "x-api-key"];

fn base64_decode(input: &str) -> Result<String, ()> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|_| ())?;
    String::from_utf8(bytes).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_set_allows_all() {
        let headers = HeaderMap::new();
        assert!(is_authorized(&headers, &[]));
    }

    #[test]
    fn bearer_token_checked() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret123".parse().unwrap(),
        );
        assert!(is_authorized(&headers, &["secret123".to_string()]));
        assert!(!is_authorized(&headers, &["other".to_string()]));
    }

    #[test]
    fn x_api_key_checked() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret123".parse().unwrap());
        assert!(is_authorized(&headers, &["secret123".to_string()]));
    }

    #[test]
    fn basic_auth_password_field_checked() {
        let mut headers = HeaderMap::new();
        // "user:secret123" base64-encoded
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpzZWNyZXQxMjM=".parse().unwrap(),
        );
        assert!(is_authorized(&headers, &["secret123".to_string()]));
    }
}
