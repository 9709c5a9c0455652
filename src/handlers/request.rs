//! JSON inference forwarding: the canonical path every OpenAI-style
//! endpoint in spec.md §6's table funnels into.
//!
//! Grounded on the teacher's original inline `proxy_handler`
//! (`proxy/mod.rs`) for the body-read/rewrite/forward shape, generalized
//! from "always the configured Anthropic API" to "resolve, ensure-ready,
//! then forward to that model's own process".

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures::Stream;

use crate::error::GatewayError;
use crate::manager::ProxyManager;
use crate::metrics::{RequestStatus, RequestTimer};
use crate::resolver::{rewrite_model_field, strip_params};
use crate::sse;

/// Usage scanning only needs the tail of a stream in practice (the final
/// SSE frame or the whole buffered JSON body); cap accumulation so a huge
/// streamed completion can't grow this buffer unbounded.
const MAX_SCAN_BYTES: usize = 256 * 1024;

pub async fn forward(manager: Arc<ProxyManager>, req: Request<Body>) -> Response<Body> {
    match forward_inner(manager, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_inner(
    manager: Arc<ProxyManager>,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::invalid_request(format!("failed to read body: {e}")))?;

    let mut json: serde_json::Value = if body_bytes.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body_bytes)
            .map_err(|e| GatewayError::invalid_request(format!("invalid JSON body: {e}")))?
    };

    let requested_model = json.get("model").and_then(|v| v.as_str()).map(String::from);

    let model_id = resolve_model(&manager, requested_model.as_deref())?;
    let model_config = manager
        .config
        .models
        .get(&model_id)
        .cloned()
        .ok_or_else(|| GatewayError::not_found(format!("unknown model {model_id}")))?;

    let process = manager.ensure_ready(&model_id).await?;

    rewrite_model_field(&mut json, &model_config.use_model_name);
    strip_params(&mut json, &model_config.filters);

    let rewritten_bytes = serde_json::to_vec(&json)
        .map_err(|e| GatewayError::internal(format!("failed to re-serialize body: {e}")))?;

    let is_streaming = json.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut out_req = Request::builder().method(parts.method.clone()).uri(parts.uri.clone());
    if let Some(out_headers) = out_req.headers_mut() {
        *out_headers = parts.headers.clone();
    }
    let out_req = out_req
        .body(Body::from(Bytes::from(rewritten_bytes)))
        .map_err(|e| GatewayError::internal(format!("failed to build upstream request: {e}")))?;

    let timer = RequestTimer::start(model_id.clone());
    let response = process.proxy_request(&path, out_req).await;

    match response {
        Ok(response) => {
            let (resp_parts, resp_body) = response.into_parts();
            let metered = MeteredStream {
                inner: Box::pin(resp_body.into_data_stream()),
                manager: manager.clone(),
                timer: Some(timer),
                buffer: Vec::new(),
                bytes: 0,
                is_streaming,
                status: RequestStatus::Success,
            };
            Ok(Response::from_parts(resp_parts, Body::from_stream(metered)))
        }
        Err(err) => {
            manager
                .metrics
                .record(timer.finish(0, None, RequestStatus::UpstreamError));
            Err(err)
        }
    }
}

/// Wraps the upstream response body so it forwards chunk-by-chunk with no
/// added buffering (spec.md §4.5's streaming-preservation requirement)
/// while still accumulating enough of the tail to extract token usage and
/// recording the final `MetricsRecord` when the stream ends or is dropped
/// (client disconnect cancels the stream, which still fires `Drop`).
struct MeteredStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    manager: Arc<ProxyManager>,
    timer: Option<RequestTimer>,
    buffer: Vec<u8>,
    bytes: u64,
    is_streaming: bool,
    status: RequestStatus,
}

impl Stream for MeteredStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(timer) = self.timer.as_mut() {
                    timer.mark_first_byte();
                }
                self.bytes += chunk.len() as u64;
                if self.buffer.len() < MAX_SCAN_BYTES {
                    self.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.status = RequestStatus::UpstreamError;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        let usage = if self.is_streaming {
            sse::extract_usage_from_stream(&String::from_utf8_lossy(&self.buffer))
        } else {
            serde_json::from_slice::<serde_json::Value>(&self.buffer)
                .ok()
                .and_then(|v| sse::extract_usage_from_json(&v))
        };
        self.manager
            .metrics
            .record(timer.finish(self.bytes, usage, self.status));
    }
}

fn resolve_model(manager: &ProxyManager, requested: Option<&str>) -> Result<String, GatewayError> {
    let resolver = manager.resolver();
    if let Some(name) = requested {
        return resolver
            .resolve(name, true)
            .map(|r| r.model_id)
            .ok_or_else(|| GatewayError::invalid_request(format!("unknown model {name}")));
    }

    let states: Vec<(String, crate::process::State)> = manager
        .groups
        .values()
        .flat_map(|g| g.members())
        .map(|p| (p.model_id().to_string(), p.state()))
        .collect();
    resolver
        .fallback(states.iter().map(|(id, state)| (id.as_str(), *state)))
        .ok_or_else(|| GatewayError::invalid_request("no model specified and none is running"))
}
