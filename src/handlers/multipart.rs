//! Multipart inference forwarding (audio transcription, image edits):
//! parse the incoming form, rewrite the `model` field, and rebuild a new
//! multipart body preserving every other field and file part byte-for-byte.
//!
//! `multer` is the crate axum's own `Multipart` extractor is built on;
//! used directly here so rebuilding doesn't round-trip through a
//! higher-level wrapper that would lose byte-for-byte fidelity.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;

use crate::error::GatewayError;
use crate::manager::ProxyManager;

struct Part {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    bytes: bytes::Bytes,
}

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

    let content_type = parts
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::invalid_request("missing content-type"))?;
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| GatewayError::invalid_request(format!("invalid multipart boundary: {e}")))?;

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::invalid_request(format!("failed to read body: {e}")))?;

    let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(body_bytes) });
    let mut multipart = multer::Multipart::new(stream, boundary.clone());

    let mut parts_out = Vec::new();
    let mut requested_model: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::invalid_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|s| s.to_string());
        let content_type = field.content_type().map(|m| m.to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| GatewayError::invalid_request(format!("invalid multipart field: {e}")))?;

        if name == "model" && file_name.is_none() {
            requested_model = Some(String::from_utf8_lossy(&bytes).to_string());
        }

        parts_out.push(Part {
            name,
            file_name,
            content_type,
            bytes,
        });
    }

    let resolver = manager.resolver();
    let resolved = resolver
        .resolve(
            requested_model
                .as_deref()
                .ok_or_else(|| GatewayError::invalid_request("multipart form missing model field"))?,
            true,
        )
        .ok_or_else(|| GatewayError::invalid_request("unknown model"))?;

    let model_config = manager
        .config
        .models
        .get(&resolved.model_id)
        .cloned()
        .ok_or_else(|| GatewayError::not_found(format!("unknown model {}", resolved.model_id)))?;

    let rewrite = model_config
        .use_model_name
        .clone()
        .filter(|name| !name.is_empty());

    let process = manager.ensure_ready(&resolved.model_id).await?;

    let mut form = reqwest::multipart::Form::new();
    for part in parts_out {
        let value = if part.name == "model" {
            rewrite.clone().unwrap_or_else(|| {
                String::from_utf8_lossy(&part.bytes).to_string()
            })
        } else {
            String::new()
        };

        let mut reqwest_part = if part.name == "model" {
            reqwest::multipart::Part::text(value)
        } else {
            reqwest::multipart::Part::bytes(part.bytes.to_vec())
        };
        if let Some(file_name) = part.file_name {
            reqwest_part = reqwest_part.file_name(file_name);
        }
        if let Some(content_type) = part.content_type {
            reqwest_part = reqwest_part
                .mime_str(&content_type)
                .unwrap_or(reqwest_part);
        }
        form = form.part(part.name, reqwest_part);
    }

    let process_base = process
        .base_url()
        .await
        .ok_or_else(|| GatewayError::internal("process has no base url"))?;
    let base_url = format!("{}{}", process_base.trim_end_matches('/'), path);

    let response = manager
        .http_client()
        .post(&base_url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| GatewayError::upstream_with_cause("multipart forward failed", e.into()))?;

    let status = axum::http::StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::upstream_with_cause("failed reading upstream response", e.into()))?;

    Response::builder()
        .status(status)
        .body(Body::from(bytes))
        .map_err(|e| GatewayError::internal(format!("failed to build response: {e}")))
}
