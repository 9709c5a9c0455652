//! Peer-proxy federation stub (spec.md §9 Design Notes: "sketched in the
//! source but incomplete; treat as a stub interface ... and leave
//! unimplemented behind a feature flag").
//!
//! Compiled only under the `peer-proxy` Cargo feature, never constructed or
//! called from the router — the trait exists so a future implementation has
//! a contract to fill in without touching the forwarding path.

use axum::body::Body;
use axum::http::{Request, Response};

use crate::error::GatewayError;

pub trait PeerProxy: Send + Sync {
    /// Whether some peer in the federation (not this instance) owns `model_id`.
    fn has_peer_model(&self, model_id: &str) -> bool;

    /// Forward a request to the owning peer and relay its response.
    fn proxy_request(
        &self,
        model_id: &str,
        req: Request<Body>,
    ) -> impl std::future::Future<Output = Result<Response<Body>, GatewayError>> + Send;
}
