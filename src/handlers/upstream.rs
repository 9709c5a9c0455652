//! `/upstream/<model>/<path>` transparent per-model proxy: the resolver's
//! greedy path walker picks the model out of the URL itself instead of a
//! JSON body, then the remainder of the path is forwarded unchanged.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;

use crate::error::GatewayError;
use crate::manager::ProxyManager;

pub async fn forward(
    axum::extract::State(manager): axum::extract::State<Arc<ProxyManager>>,
    req: Request<Body>,
) -> Response<Body> {
    if !crate::manager::is_authorized(req.headers(), &manager.config.required_api_keys) {
        return GatewayError::Unauthorized.into_response_for(req.headers());
    }

    match forward_inner(manager, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward_inner(
    manager: Arc<ProxyManager>,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let path = req.uri().path().to_string();
    let after_prefix = path.strip_prefix("/upstream/").unwrap_or("");

    let resolver = manager.resolver();
    let (resolved, remainder) = resolver
        .resolve_path(after_prefix)
        .ok_or_else(|| GatewayError::not_found("no model matches this upstream path"))?;

    // spec.md §6: redirect to add a trailing slash when the matched model
    // consumed the whole path (no remainder to forward).
    if remainder.is_empty() && !path.ends_with('/') {
        let location = format!("{path}/");
        return Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(axum::http::header::LOCATION, location)
            .body(Body::empty())
            .map_err(|e| GatewayError::internal(format!("failed to build redirect: {e}")));
    }

    let process = manager.ensure_ready(&resolved.model_id).await?;
    let upstream_path = format!("/{remainder}");
    process.proxy_request(&upstream_path, req).await
}
