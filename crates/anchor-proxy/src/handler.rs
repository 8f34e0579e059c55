//! Per-request decision for intercepted traffic.
//!
//! Every non-loopback request is reported to the session as a visit, then
//! evaluated against the current [`StateCache`] snapshot. Blocked requests
//! never reach the network: they get a 302 to the local block page.

use std::sync::Arc;

use anchor_core::domain::is_loopback;
use anchor_core::rule_engine::{evaluate_target, VisitSink};
use hudsucker::{Body, HttpContext, HttpHandler, RequestOrResponse};
use hyper::header::{HeaderValue, CACHE_CONTROL, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode};

use crate::state_cache::StateCache;

/// hudsucker handler that applies the rule engine.
#[derive(Clone)]
pub struct ProxyHandler {
    state: StateCache,
    sink: Arc<dyn VisitSink>,
    web_port: u16,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("state", &self.state)
            .field("web_port", &self.web_port)
            .finish()
    }
}

impl ProxyHandler {
    pub fn new(state: StateCache, sink: Arc<dyn VisitSink>, web_port: u16) -> Self {
        Self {
            state,
            sink,
            web_port,
        }
    }

    /// Extracts the host from the request.
    fn extract_host(req: &Request<Body>) -> Option<String> {
        if let Some(host) = req.uri().host() {
            return Some(host.to_string());
        }

        req.headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Forwards the request or answers it with a redirect.
    fn decide(&self, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(host) = Self::extract_host(&req) else {
            return RequestOrResponse::Request(req);
        };
        if is_loopback(&host) {
            return RequestOrResponse::Request(req);
        }

        self.sink.visit(&host);

        let snapshot = self.state.snapshot();
        let decision = evaluate_target(&host, req.uri().path(), &snapshot);

        let Some(redirect) = decision.redirect.filter(|_| decision.action.is_block()) else {
            tracing::trace!(host = %host, reason = decision.reason.describe(), "Allowed");
            return RequestOrResponse::Request(req);
        };

        let location = redirect.url(self.web_port);
        tracing::info!(
            host = %host,
            action = ?decision.action,
            reason = decision.reason.describe(),
            "Blocked request"
        );
        self.sink.blocked(&redirect.domain);

        RequestOrResponse::Response(redirect_response(&location))
    }
}

/// 302 to `location`, uncached so unblocking takes effect immediately.
fn redirect_response(location: &str) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        res.headers_mut().insert(LOCATION, value);
    }
    res.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    res
}

/// True when the error chain ends in the peer going away.
fn is_peer_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.decide(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        res
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        if is_peer_disconnect(&err) {
            tracing::debug!("Upstream connection closed: {}", err);
        } else {
            tracing::warn!("Upstream request failed: {}", err);
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::BAD_GATEWAY;
        res
    }
}
