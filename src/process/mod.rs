//! Process (C3): one backend subprocess and its lifecycle state machine.
//!
//! Grounded on the teacher's original `proxy_handler` (`proxy/mod.rs`) for
//! the streaming reverse-proxy half, and on `other_examples`' estuary-flow
//! `Local::spawn` (`crates/runtime/src/local.rs`) for the subprocess-spawn +
//! line-buffered log capture half — the teacher itself never spawns a child
//! process, so that idiom is imported from the wider pack.

pub mod port;

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::config::{expand_template, ModelConfig};
use crate::error::GatewayError;
use crate::logmon::LogMonitor;
use port::PortAllocator;

/// Hop-by-hop headers stripped before forwarding in either direction,
/// matching the teacher's `merge_headers`/`extract_request_headers` habit
/// of never blindly copying the whole header map across a proxy hop.
///
/// `content-length` lives here too: the request body may have been
/// rewritten (model-name substitution, param stripping) upstream of this
/// call, so the client's original length no longer describes the bytes
/// actually being sent. Dropping it lets the HTTP client recompute it from
/// the body it's actually given, instead of shipping a stale value that
/// truncates or hangs the back-end.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Ready,
    ShuttingDown,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    Immediate,
    WaitForInflight,
}

/// Outcome of a single spawn-on-one-port attempt inside [`Process::start`].
enum StartFailure {
    /// The child exited before the health check ever succeeded — most
    /// likely because the port was already bound by something else.
    /// `start()` retries on a fresh port instead of giving up.
    PortCollision,
    /// Any other failure (bad cmd template, spawn error, health-check
    /// timeout while the child is still running); not retryable.
    Fatal(GatewayError),
}

struct Inner {
    model: ModelConfig,
    client: reqwest::Client,
    ports: Arc<PortAllocator>,
    logs: LogMonitor,
    health_check_timeout: Duration,

    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,
    /// Serializes every transition; held only across the transition itself,
    /// never across a forwarded request (spec.md §4.3's ordering guarantee).
    transition: AsyncMutex<()>,

    port: AsyncMutex<Option<u16>>,
    child: AsyncMutex<Option<Child>>,
    base_url: AsyncMutex<Option<String>>,

    in_flight: AtomicU64,
    last_activity_ms: AtomicI64,
}

/// One model's subprocess and its lifecycle. Cheap to clone (`Arc` inside);
/// clones share the same underlying state.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    pub fn new(
        model: ModelConfig,
        client: reqwest::Client,
        ports: Arc<PortAllocator>,
        logs: LogMonitor,
        health_check_timeout: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(State::Stopped);
        Self {
            inner: Arc::new(Inner {
                model,
                client,
                ports,
                logs,
                health_check_timeout,
                state_tx,
                state_rx,
                transition: AsyncMutex::new(()),
                port: AsyncMutex::new(None),
                child: AsyncMutex::new(None),
                base_url: AsyncMutex::new(None),
                in_flight: AtomicU64::new(0),
                last_activity_ms: AtomicI64::new(0),
            }),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model.id
    }

    pub fn state(&self) -> State {
        *self.inner.state_rx.borrow()
    }

    fn set_state(&self, state: State) {
        let _ = self.inner.state_tx.send(state);
    }

    fn touch(&self) {
        self.inner
            .last_activity_ms
            .store(now_ms(), Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Start the subprocess if not already starting or running. A second
    /// `start()` call while Starting/Ready is a no-op returning the current
    /// state, per spec.md §4.3 ("Start is at-most-one concurrent").
    ///
    /// A port handed out by [`PortAllocator`] is only free from this
    /// process's point of view; some unrelated process on the host may
    /// already be bound to it, which shows up here as the child exiting
    /// immediately after spawn (bind failure) instead of ever answering the
    /// health check. Per spec.md §9, that's treated as a port collision: the
    /// bad port is never returned to the allocator (so the next `acquire()`
    /// skips past it) and the whole attempt is retried on the next port,
    /// bounded by the allocator eventually running out of range.
    pub async fn start(&self, macros: &std::collections::HashMap<String, String>) -> Result<(), GatewayError> {
        let _guard = self.inner.transition.lock().await;
        match self.state() {
            State::Starting | State::Ready => return Ok(()),
            _ => {}
        }
        self.set_state(State::Starting);

        loop {
            let Some(port) = self.inner.ports.acquire() else {
                self.fail("no free ports available for this process group").await;
                return Err(GatewayError::spawn_failed(
                    "no free ports available for this process group (range exhausted)".to_string(),
                    None,
                ));
            };

            match self.attempt_start_on_port(port, macros).await {
                Ok(()) => return Ok(()),
                Err(StartFailure::PortCollision) => {
                    tracing::warn!(
                        model = self.model_id(),
                        port,
                        "process exited before becoming healthy, treating as a port collision and retrying"
                    );
                    continue;
                }
                Err(StartFailure::Fatal(err)) => {
                    self.fail(&err.to_string()).await;
                    return Err(err);
                }
            }
        }
    }

    /// One attempt: spawn on `port`, wire log capture, poll for readiness.
    /// Does not touch the port allocator or settle a terminal state itself —
    /// the caller in [`Process::start`] decides whether a failure here means
    /// "retry on another port" or "give up".
    async fn attempt_start_on_port(
        &self,
        port: u16,
        macros: &std::collections::HashMap<String, String>,
    ) -> Result<(), StartFailure> {
        *self.inner.port.lock().await = Some(port);

        let base_url = expand_template(&self.inner.model.proxy, port, macros);
        *self.inner.base_url.lock().await = Some(base_url.clone());

        let cmd_line = expand_template(&self.inner.model.cmd, port, macros);
        let mut parts = cmd_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            StartFailure::Fatal(GatewayError::spawn_failed(
                format!("model {} has an empty cmd template", self.model_id()),
                None,
            ))
        })?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.inner.model.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            StartFailure::Fatal(GatewayError::spawn_failed(
                format!("failed to spawn {program}"),
                Some(err.into()),
            ))
        })?;

        self.wire_logs(&mut child);
        *self.inner.child.lock().await = Some(child);

        let check_url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            self.inner.model.check_endpoint
        );
        self.poll_until_ready(check_url).await
    }

    fn wire_logs(&self, child: &mut Child) {
        let model_id = self.model_id().to_string();
        if let Some(stdout) = child.stdout.take() {
            let logs = self.inner.logs.clone();
            let id = model_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.write(&id, line.as_bytes());
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = self.inner.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.write(&model_id, line.as_bytes());
                }
            });
        }
    }

    /// Polls the health-check endpoint until it answers, the deadline
    /// elapses, or the child exits early (the latter surfaces as
    /// [`StartFailure::PortCollision`] — see [`Process::start`]).
    async fn poll_until_ready(&self, check_url: String) -> Result<(), StartFailure> {
        let deadline = tokio::time::Instant::now() + self.inner.health_check_timeout;
        let mut interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(StartFailure::Fatal(GatewayError::timeout(format!(
                    "model {} did not become healthy in time",
                    self.model_id()
                ))));
            }

            {
                let mut child_guard = self.inner.child.lock().await;
                if let Some(child) = child_guard.as_mut() {
                    if let Ok(Some(_status)) = child.try_wait() {
                        return Err(StartFailure::PortCollision);
                    }
                }
            }

            if self
                .inner
                .client
                .get(&check_url)
                .timeout(Duration::from_millis(200))
                .send()
                .await
                .map(|resp| resp.status().is_success())
                .unwrap_or(false)
            {
                self.set_state(State::Ready);
                self.touch();
                return Ok(());
            }

            interval.tick().await;
        }
    }

    async fn fail(&self, reason: &str) {
        tracing::warn!(model = self.model_id(), reason, "process failed");
        self.release_port().await;
        self.set_state(State::Failed);
        self.set_state(State::Stopped);
    }

    async fn release_port(&self) {
        if let Some(port) = self.inner.port.lock().await.take() {
            self.inner.ports.release(port);
        }
    }

    /// Block until this process reaches `Ready`, or the deadline elapses.
    pub async fn await_ready(&self, deadline: Duration) -> Result<(), GatewayError> {
        let mut rx = self.inner.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow() {
                    State::Ready => return Ok(()),
                    State::Starting => {}
                    _ => {
                        return Err(GatewayError::upstream(format!(
                            "model {} is not starting",
                            self.model_id()
                        )))
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(GatewayError::upstream("process state channel closed"));
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .unwrap_or_else(|_| Err(GatewayError::timeout("timed out waiting for process ready")))
    }

    /// Transparent, streaming reverse proxy for one request. Body and
    /// response are both streamed unbuffered (`reqwest::bytes_stream` into
    /// `axum::body::Body::from_stream`), preserving SSE/NDJSON framing,
    /// matching `proxy/mod.rs`'s original `proxy_handler`.
    pub async fn proxy_request(
        &self,
        upstream_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        match self.state() {
            State::Starting => self.await_ready(Duration::from_secs(30)).await?,
            State::Ready => {}
            _ => {
                return Err(GatewayError::upstream(format!(
                    "model {} is not available",
                    self.model_id()
                )))
            }
        }

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.do_proxy_request(upstream_path, req).await;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
        result
    }

    async fn do_proxy_request(
        &self,
        upstream_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, GatewayError> {
        let base_url = self
            .inner
            .base_url
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::upstream("process has no base url"))?;

        let (parts, body) = req.into_parts();
        let forward_url = format!("{}{}", base_url.trim_end_matches('/'), upstream_path);

        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GatewayError::invalid_request(format!("failed to read body: {e}")))?;

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut upstream_req = self.inner.client.request(method, &forward_url);
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        if !body_bytes.is_empty() || parts.method != Method::GET {
            upstream_req = upstream_req.body(body_bytes);
        }

        let upstream_resp = upstream_req.send().await.map_err(|e| {
            GatewayError::upstream_with_cause(
                format!("upstream request to {} failed", self.model_id()),
                e.into(),
            )
        })?;

        let status =
            StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream_resp.headers().iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.insert(name, value);
            }
        }

        let stream = upstream_resp.bytes_stream();
        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            *headers = response_headers;
        }
        builder
            .body(Body::from_stream(stream))
            .map_err(|e| GatewayError::internal(format!("failed to build response: {e}")))
    }

    /// Stop the process. `Immediate` sends SIGTERM then escalates to
    /// `kill()` after a short grace window; `WaitForInflight` first refuses
    /// new requests and waits for `in_flight` to drain. Idempotent.
    pub async fn stop(&self, strategy: StopStrategy) -> Result<(), GatewayError> {
        let _guard = self.inner.transition.lock().await;
        if matches!(self.state(), State::Stopped) {
            return Ok(());
        }

        match strategy {
            StopStrategy::WaitForInflight => {
                self.set_state(State::ShuttingDown);
                let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
                while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
            StopStrategy::Immediate => {
                self.set_state(State::Stopping);
            }
        }

        self.terminate_child().await;
        self.release_port().await;
        self.set_state(State::Stopped);
        Ok(())
    }

    async fn terminate_child(&self) {
        let mut guard = self.inner.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            let graceful = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            if graceful.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Idle seconds since the last request completion (or since start, if
    /// no request has completed yet).
    pub fn idle_seconds(&self) -> i64 {
        let last = self.inner.last_activity_ms.load(Ordering::Relaxed);
        if last == 0 {
            return 0;
        }
        (now_ms() - last) / 1000
    }

    pub fn ttl(&self) -> Option<u64> {
        self.inner.model.ttl
    }

    /// The resolved `${PORT}`-substituted base URL, once started.
    pub async fn base_url(&self) -> Option<String> {
        self.inner.base_url.lock().await.clone()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model(cmd: &str, check_endpoint: &str) -> ModelConfig {
        ModelConfig {
            id: "m1".to_string(),
            name: "m1".to_string(),
            description: String::new(),
            use_model_name: None,
            aliases: vec![],
            unlisted: false,
            ttl: None,
            check_endpoint: check_endpoint.to_string(),
            proxy: "http://127.0.0.1:${PORT}".to_string(),
            cmd: cmd.to_string(),
            env: vec![],
            filters: vec![],
        }
    }

    #[test]
    fn initial_state_is_stopped() {
        let process = Process::new(
            test_model("true", "/health"),
            reqwest::Client::new(),
            Arc::new(PortAllocator::new(9000)),
            LogMonitor::new(Box::new(crate::logmon::DiscardSink)),
            Duration::from_secs(1),
        );
        assert_eq!(process.state(), State::Stopped);
        assert_eq!(process.in_flight(), 0);
    }

    #[tokio::test]
    async fn stop_on_stopped_process_is_noop() {
        let process = Process::new(
            test_model("true", "/health"),
            reqwest::Client::new(),
            Arc::new(PortAllocator::new(9000)),
            LogMonitor::new(Box::new(crate::logmon::DiscardSink)),
            Duration::from_secs(1),
        );
        process.stop(StopStrategy::Immediate).await.unwrap();
        assert_eq!(process.state(), State::Stopped);
    }

    #[tokio::test]
    async fn empty_cmd_template_fails_fast() {
        let process = Process::new(
            test_model("", "/health"),
            reqwest::Client::new(),
            Arc::new(PortAllocator::new(9000)),
            LogMonitor::new(Box::new(crate::logmon::DiscardSink)),
            Duration::from_secs(1),
        );
        let result = process.start(&std::collections::HashMap::new()).await;
        assert!(result.is_err());
        assert_eq!(process.state(), State::Stopped);
    }

    /// A child that exits immediately (never answers the health check)
    /// looks exactly like a port collision with an outside process. `start`
    /// must retry on fresh ports rather than failing on the first one, and
    /// give up cleanly once the allocator's range is exhausted instead of
    /// looping forever.
    #[tokio::test]
    async fn exiting_child_retries_on_a_new_port_then_gives_up() {
        let process = Process::new(
            test_model("false", "/health"),
            reqwest::Client::new(),
            Arc::new(PortAllocator::new(u16::MAX - 1)),
            LogMonitor::new(Box::new(crate::logmon::DiscardSink)),
            Duration::from_secs(2),
        );
        let result = process.start(&std::collections::HashMap::new()).await;
        assert!(result.is_err());
        assert_eq!(process.state(), State::Stopped);
    }
}
