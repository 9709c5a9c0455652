//! Admin/query endpoints (spec.md §6): model listing, running-process
//! listing, unload-all, liveness, log snapshot/stream, and CORS preflight.
//!
//! Grounded on `proxy/api/mod.rs`'s admin-route style (small handlers each
//! reading straight off shared state and serializing a plain JSON shape)
//! and `proxy/helpers.rs`'s manual CORS header construction.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::{sse::Event, IntoResponse, Sse};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::logmon::LogLevel;
use crate::manager::ProxyManager;

/// Max value honored on an `OPTIONS` preflight's advertised cache lifetime.
const CORS_MAX_AGE_SECONDS: &str = "86400";

/// Echoes back the requesting origin and any `Access-Control-Request-*`
/// headers after stripping characters that don't belong in a header value,
/// matching the teacher's habit of hand-building CORS headers rather than
/// depending on `tower-http`'s `CorsLayer` (not in its dependency table).
pub async fn cors_preflight(req: Request<Body>) -> Response<Body> {
    let headers = req.headers();
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*");
    let requested_headers = headers
        .get("access-control-request-headers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("authorization, content-type, x-api-key");

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, sanitize_header_value(origin))
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, OPTIONS",
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            sanitize_header_value(requested_headers),
        )
        .header(header::ACCESS_CONTROL_MAX_AGE, CORS_MAX_AGE_SECONDS)
        .body(Body::empty())
        .unwrap()
}

/// Strips CR/LF so a reflected header can never inject extra header lines.
fn sanitize_header_value(value: &str) -> HeaderValue {
    let cleaned: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    HeaderValue::from_str(&cleaned).unwrap_or_else(|_| HeaderValue::from_static("*"))
}

/// Adds permissive CORS headers to an already-built response, for the
/// non-`OPTIONS` admin/inference responses an `Origin` header may arrive on.
pub fn with_cors(mut response: Response<Body>, origin: Option<&HeaderValue>) -> Response<Body> {
    let value = origin
        .and_then(|v| v.to_str().ok())
        .map(sanitize_header_value)
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    response
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelEntry>,
}

/// `GET /v1/models` — sorted by id ascending, `unlisted` models excluded,
/// aliases included iff `Config::include_aliases_in_list`.
pub async fn list_models(State(manager): State<Arc<ProxyManager>>) -> impl IntoResponse {
    let mut ids: Vec<String> = Vec::new();
    for model in manager.config.models.values() {
        if model.unlisted {
            continue;
        }
        ids.push(model.id.clone());
        if manager.config.include_aliases_in_list {
            ids.extend(model.aliases.iter().cloned());
        }
    }
    ids.sort();

    let data = ids
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created: 0,
            owned_by: "modelrelay",
        })
        .collect();

    axum::Json(ModelsResponse {
        object: "list",
        data,
    })
}

#[derive(Serialize)]
struct RunningEntry {
    model: String,
    state: &'static str,
}

#[derive(Serialize)]
struct RunningResponse {
    running: Vec<RunningEntry>,
}

fn state_name(state: crate::process::State) -> &'static str {
    match state {
        crate::process::State::Stopped => "stopped",
        crate::process::State::Starting => "starting",
        crate::process::State::Ready => "ready",
        crate::process::State::ShuttingDown => "shutting_down",
        crate::process::State::Stopping => "stopping",
        crate::process::State::Failed => "failed",
    }
}

/// `GET /running` — every process currently not Stopped.
pub async fn running(State(manager): State<Arc<ProxyManager>>) -> impl IntoResponse {
    let running = manager
        .running()
        .into_iter()
        .map(|(model, state)| RunningEntry {
            model,
            state: state_name(state),
        })
        .collect();
    axum::Json(RunningResponse { running })
}

/// `GET /unload` — stop every group's members immediately, in parallel.
pub async fn unload(State(manager): State<Arc<ProxyManager>>) -> impl IntoResponse {
    match manager.unload_all().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /health` — liveness only; never touches process state.
pub async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    since: u64,
}

#[derive(Serialize)]
struct LogsResponse {
    records: Vec<LogRecordJson>,
}

#[derive(Serialize)]
struct LogRecordJson {
    seq: u64,
    timestamp: String,
    level: &'static str,
    source: String,
    line: String,
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// `GET /logs` — bounded snapshot of the aggregate (proxy + upstream) log
/// ring from sequence `since` onward.
pub async fn logs_snapshot(
    State(manager): State<Arc<ProxyManager>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let records = manager
        .proxy_logs
        .snapshot(query.since, LogLevel::Debug)
        .into_iter()
        .map(|r| LogRecordJson {
            seq: r.seq,
            timestamp: r.timestamp.to_rfc3339(),
            level: level_name(r.level),
            source: r.source,
            line: r.line,
        })
        .collect();
    axum::Json(LogsResponse { records })
}

/// `GET /logs/stream` — SSE stream of every new log record, unfiltered.
pub async fn logs_stream(
    State(manager): State<Arc<ProxyManager>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    logs_stream_for(manager, None)
}

/// `GET /logs/stream/<model>` — SSE stream narrowed to one model's own
/// captured stdout/stderr (matched against `LogRecord::source`). The ring
/// itself is shared (one mux `LogMonitor` carries every process's output);
/// narrowing happens by filtering the subscription, not by a separate ring.
pub async fn logs_stream_for_model(
    State(manager): State<Arc<ProxyManager>>,
    Path(model): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    logs_stream_for(manager, Some(model))
}

fn logs_stream_for(
    manager: Arc<ProxyManager>,
    wanted_source: Option<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = manager.proxy_logs.subscribe(0, LogLevel::Debug);

    let stream = ReceiverStream::new(rx).filter_map(move |record| {
        if let Some(source) = &wanted_source {
            if &record.source != source {
                return None;
            }
        }
        let payload = serde_json::json!({
            "seq": record.seq,
            "timestamp": record.timestamp.to_rfc3339(),
            "level": level_name(record.level),
            "source": record.source,
            "line": record.line,
        });
        Some(Ok(Event::default().data(payload.to_string())))
    });

    Sse::new(stream)
}

/// `GET /props` — forwarded to the first Ready process, matching llama.cpp
/// back-ends' own `/props` introspection endpoint.
pub async fn props(
    State(manager): State<Arc<ProxyManager>>,
    headers: HeaderMap,
) -> Response<Body> {
    let first_ready = manager
        .groups
        .values()
        .flat_map(|g| g.members())
        .find(|p| p.state() == crate::process::State::Ready)
        .cloned();

    let Some(process) = first_ready else {
        return crate::error::GatewayError::not_found("no model is ready").into_response_for(&headers);
    };

    let req = Request::builder()
        .method(Method::GET)
        .uri("/props")
        .body(Body::empty())
        .unwrap();

    match process.proxy_request("/props", req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response_for(&headers),
    }
}
