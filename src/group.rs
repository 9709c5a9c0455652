//! Process Group (C4): owns a set of Processes and arbitrates swap /
//! exclusive / persistent policy between them.
//!
//! Grounded on `config/routing.rs`'s `ClientsConfig` (a map of named
//! backends behind simple lookups) combined with the lock-guarded mutable
//! table discipline of `proxy/sessions.rs`'s `SessionManager`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::GroupConfig;
use crate::error::GatewayError;
use crate::process::{Process, StopStrategy};

pub struct ProcessGroup {
    config: GroupConfig,
    /// Guards swap/exclusive decisions. Never held across a forwarded
    /// request — only across the (fast) decision of which processes to
    /// stop/start, per spec.md §4.4's concurrency note.
    lock: Mutex<()>,
    processes: HashMap<String, Process>,
}

impl ProcessGroup {
    pub fn new(config: GroupConfig, processes: HashMap<String, Process>) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
            processes,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    pub fn is_exclusive(&self) -> bool {
        self.config.exclusive
    }

    pub fn has_member(&self, model_id: &str) -> bool {
        self.processes.contains_key(model_id)
    }

    pub fn process(&self, model_id: &str) -> Option<&Process> {
        self.processes.get(model_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Any member currently not Stopped.
    pub fn is_active(&self) -> bool {
        self.processes
            .values()
            .any(|p| p.state() != crate::process::State::Stopped)
    }

    /// Ensure `model_id`'s process is Ready, starting it (and, if `swap` is
    /// set, stopping other running members of this group first) if needed.
    pub async fn ensure_member(
        &self,
        model_id: &str,
        macros: &HashMap<String, String>,
    ) -> Result<Process, GatewayError> {
        let process = self
            .processes
            .get(model_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("unknown model {model_id}")))?;

        match process.state() {
            crate::process::State::Ready => return Ok(process),
            crate::process::State::Starting => {
                process.await_ready(Duration::from_secs(30)).await?;
                return Ok(process);
            }
            _ => {}
        }

        let _guard = self.lock.lock().await;
        // Re-check after acquiring the lock: another request may have
        // already started it while we waited.
        if process.state() == crate::process::State::Ready {
            return Ok(process);
        }

        if self.config.swap {
            for (other_id, other) in &self.processes {
                if other_id != model_id && other.state() != crate::process::State::Stopped {
                    other.stop(StopStrategy::WaitForInflight).await?;
                }
            }
        }

        process.start(macros).await?;
        Ok(process)
    }

    /// Stop every member in parallel, returning once all reach Stopped.
    pub async fn stop_all(&self, strategy: StopStrategy) -> Result<(), GatewayError> {
        let futures = self.processes.values().map(|p| p.stop(strategy));
        let results = futures::future::join_all(futures).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.stop_all(StopStrategy::Immediate).await
    }
}

/// Sweeps every group's members for TTL expiry. Spawned once at startup and
/// run on a fixed interval; not part of `ProcessGroup` itself since it needs
/// to see every group, not just one.
pub async fn ttl_sweep(manager: Arc<crate::manager::ProxyManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for group in manager.groups.values() {
            for process in group.members() {
                let Some(ttl) = process.ttl() else { continue };
                if process.state() == crate::process::State::Ready
                    && process.in_flight() == 0
                    && process.idle_seconds() as u64 >= ttl
                {
                    let process = process.clone();
                    tokio::spawn(async move {
                        if let Err(err) = process.stop(StopStrategy::WaitForInflight).await {
                            tracing::warn!(model = process.model_id(), %err, "ttl stop failed");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmon::{DiscardSink, LogMonitor};
    use crate::process::port::PortAllocator;
    use std::time::Duration as StdDuration;

    fn test_process(id: &str) -> Process {
        let model = crate::config::ModelConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            use_model_name: None,
            aliases: vec![],
            unlisted: false,
            ttl: None,
            check_endpoint: "/health".to_string(),
            proxy: "http://127.0.0.1:${PORT}".to_string(),
            cmd: "true".to_string(),
            env: vec![],
            filters: vec![],
        };
        Process::new(
            model,
            reqwest::Client::new(),
            Arc::new(PortAllocator::new(9100)),
            LogMonitor::new(Box::new(DiscardSink)),
            StdDuration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn ensure_member_rejects_unknown_model() {
        let group = ProcessGroup::new(GroupConfig::default(), HashMap::new());
        let result = group.ensure_member("ghost", &HashMap::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_all_on_stopped_group_is_ok() {
        let mut processes = HashMap::new();
        processes.insert("m1".to_string(), test_process("m1"));
        let group = ProcessGroup::new(
            GroupConfig {
                id: "g1".into(),
                members: vec!["m1".into()],
                ..Default::default()
            },
            processes,
        );
        group.stop_all(StopStrategy::Immediate).await.unwrap();
    }

    #[test]
    fn is_active_false_when_all_stopped() {
        let mut processes = HashMap::new();
        processes.insert("m1".to_string(), test_process("m1"));
        let group = ProcessGroup::new(GroupConfig::default(), processes);
        assert!(!group.is_active());
    }
}
