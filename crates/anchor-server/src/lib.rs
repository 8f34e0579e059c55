//! Anchor Server - control API and block pages.
//!
//! This crate serves Anchor's local HTTP surface on the web port.
//!
//! ## Endpoints
//!
//! - `GET /api/session` - Session status
//! - `POST /api/session/{start,end,break,break/end,idle,app}` - Drive the session
//! - `GET|PUT /api/config`, `POST /api/config/reset` - Persisted settings
//! - `GET|POST /api/nuclear` and `/api/nuclear/{id}/...` - Nuclear blocks
//! - `GET /api/history` - Session history, daily totals and streak
//! - `GET /blocked.html`, `/nuclear-blocked.html`,
//!   `/nuclear-block-last-chance.html` - Redirect targets of the proxy
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anchor_server::{Controller, Server, ServerConfig};
//! use anchor_storage::PersistentStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = PersistentStore::open_default().await.unwrap();
//!     let controller = Controller::spawn(Arc::new(store));
//!     let server = Server::new(ServerConfig::default(), controller).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
mod pages;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use anchor_storage::models::DEFAULT_WEB_PORT;

pub use error::{ApiError, Result};
pub use state::Controller;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8767).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_WEB_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API and page routes.
pub fn router(controller: Controller) -> Router {
    // The block pages and a local dashboard call in from browser origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/session", get(handlers::get_session))
        .route("/api/session/start", post(handlers::start_session))
        .route("/api/session/end", post(handlers::end_session))
        .route("/api/session/break", post(handlers::start_break))
        .route("/api/session/break/end", post(handlers::end_break))
        .route("/api/session/idle", post(handlers::set_idle))
        .route("/api/session/app", post(handlers::report_app))
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        .route("/api/config/reset", post(handlers::reset_config))
        .route(
            "/api/nuclear",
            get(handlers::list_nuclear).post(handlers::add_nuclear),
        )
        .route("/api/nuclear/{id}/unblock", post(handlers::click_unblock))
        .route("/api/nuclear/{id}/confirm", post(handlers::confirm_unblock))
        .route("/api/nuclear/{id}/block-again", post(handlers::block_again))
        .route(
            "/api/nuclear/{id}/exceptions",
            post(handlers::add_exception).delete(handlers::remove_exception),
        )
        .route("/api/history", get(handlers::get_history))
        .route("/blocked.html", get(pages::blocked))
        .route("/nuclear-blocked.html", get(pages::nuclear_blocked))
        .route("/nuclear-block-last-chance.html", get(pages::last_chance))
        .layer(cors)
        .with_state(controller)
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a server around a running controller.
    pub fn new(
        config: ServerConfig,
        controller: Controller,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(controller),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Binds the listening socket.
    ///
    /// Separate from [`Server::serve`] so callers learn about a taken port
    /// before they touch anything else.
    pub fn bind(&self) -> std::result::Result<TcpListener, ServerError> {
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Allow address reuse (helps with TIME_WAIT sockets after a restart)
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Set non-blocking for tokio
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).map_err(|e| ServerError::BindError(self.addr, e))
    }

    /// Serves on a bound listener until `shutdown` resolves.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().unwrap_or(self.addr);
        info!("Anchor control API listening on http://{}", addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    /// Binds and runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, std::future::pending()).await
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anchor_storage::PersistentStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;

    async fn create_test_app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("anchor.json"))
            .await
            .unwrap();
        (router(Controller::spawn(Arc::new(store))), dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (app, _dir) = create_test_app().await;

        let (status, json) = send(&app, "GET", "/api/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessionActive"], false);

        let (status, json) = send(&app, "POST", "/api/session/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessionActive"], true);
        assert!(json["sessionId"].is_string());

        let (status, json) = send(&app, "POST", "/api/session/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "session_active");

        let (status, _) = send(&app, "POST", "/api/session/idle", Some(json!({"idle": true}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = send(&app, "POST", "/api/session/end", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessionActive"], true);

        let (status, json) = send(&app, "GET", "/api/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sessionHistory"].as_array().unwrap().len(), 1);
        assert_eq!(json["today"]["sessions"], 1);
        assert_eq!(json["streak"]["currentDays"], 1);
    }

    #[tokio::test]
    async fn test_break_without_reward() {
        let (app, _dir) = create_test_app().await;

        let (status, json) = send(&app, "POST", "/api/session/break", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "session_inactive");

        send(&app, "POST", "/api/session/start", None).await;
        let (status, json) = send(&app, "POST", "/api/session/break", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "no_reward");

        let (status, _) = send(&app, "POST", "/api/session/break/end", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_report_app_requires_name() {
        let (app, _dir) = create_test_app().await;

        let (status, _) = send(&app, "POST", "/api/session/app", Some(json!({"app": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/api/session/app", Some(json!({"app": "code"}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_config_update_and_reset() {
        let (app, _dir) = create_test_app().await;

        let (status, json) = send(&app, "PUT", "/api/config", Some(json!({"workMinutes": 50}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["workMinutes"], 50);
        assert_eq!(json["rewardMinutes"], 5);

        let (status, json) = send(&app, "PUT", "/api/config", Some(json!({"workMinutes": "lots"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_config");

        let bad_window = json!({"lists": [{
            "id": "work",
            "schedules": [{
                "days": ["monday"],
                "start": {"hour": 99, "minute": 0},
                "end": {"hour": 17, "minute": 0}
            }]
        }]});
        let (status, json) = send(&app, "PUT", "/api/config", Some(bad_window)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_config");

        let (status, json) = send(&app, "PUT", "/api/config", Some(json!({"streak": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");

        let (_, json) = send(&app, "GET", "/api/config", None).await;
        assert_eq!(json["workMinutes"], 50);

        let (status, json) = send(&app, "POST", "/api/config/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["workMinutes"], 25);
    }

    #[tokio::test]
    async fn test_nuclear_lifecycle() {
        let (app, _dir) = create_test_app().await;

        let (status, json) = send(&app, "POST", "/api/nuclear", Some(json!({"domains": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "no_domains");

        let (status, json) = send(
            &app,
            "POST",
            "/api/nuclear",
            Some(json!({"domains": ["Reddit.com"], "cooldown1Ms": 3_600_000, "cooldown2Ms": 60_000})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["stage"], "locked");
        assert_eq!(json["domains"][0], "reddit.com");
        let id = json["id"].as_str().unwrap().to_string();

        let (status, json) = send(&app, "POST", "/api/nuclear", Some(json!({"domains": ["reddit.com"]}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "already_covered");

        let (status, json) = send(&app, "POST", &format!("/api/nuclear/{id}/unblock"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "not_ready");

        let (status, json) = send(
            &app,
            "POST",
            &format!("/api/nuclear/{id}/exceptions"),
            Some(json!({"path": "reddit.com/r/rust"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["exceptions"][0], "reddit.com/r/rust");

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/nuclear/{id}/exceptions"),
            Some(json!({"path": "example.com/x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(
            &app,
            "POST",
            &format!("/api/nuclear/{id}/block-again"),
            Some(json!({"cooldown1Ms": -5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "negative_cooldown");

        let (status, json) = send(&app, "POST", &format!("/api/nuclear/{id}/block-again"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cooldown1Ms"], 3_600_000);

        let (_, json) = send(&app, "GET", "/api/nuclear", None).await;
        assert_eq!(json["sites"].as_array().unwrap().len(), 1);
        assert!(json["sites"][0]["nextTransitionAt"].is_string());

        let (status, _) = send(&app, "POST", &format!("/api/nuclear/{id}/confirm"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = send(&app, "POST", &format!("/api/nuclear/{id}/confirm"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn test_unblock_without_second_cooldown_removes() {
        let (app, _dir) = create_test_app().await;

        let (_, json) = send(&app, "POST", "/api/nuclear", Some(json!({"domains": ["x.com"]}))).await;
        let id = json["id"].as_str().unwrap().to_string();

        let (status, json) = send(&app, "POST", &format!("/api/nuclear/{id}/unblock"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], true);

        let (_, json) = send(&app, "GET", "/api/config", None).await;
        assert!(json["nuclearSites"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nuclear_rejects_oversized_cooldown() {
        let (app, _dir) = create_test_app().await;

        let body = json!({"domains": ["x.com"], "cooldown1Ms": i64::MAX});
        let (status, json) = send(&app, "POST", "/api/nuclear", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "cooldown_too_long");

        let (status, json) = send(&app, "GET", "/api/nuclear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["sites"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_pages() {
        let (app, _dir) = create_test_app().await;

        for page in [
            "/blocked.html",
            "/nuclear-blocked.html",
            "/nuclear-block-last-chance.html",
        ] {
            let request = Request::builder()
                .uri(format!("{page}?domain=youtube.com"))
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["cache-control"], "no-store");

            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let html = String::from_utf8(body.to_vec()).unwrap();
            assert!(html.contains("youtube.com"));
        }
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let (app, _dir) = create_test_app().await;
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Server {
            router: app,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        };
        assert!(matches!(server.bind(), Err(ServerError::BindError(..))));
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8767);
        assert_eq!(ServerConfig::default().with_port(9000).port, 9000);
    }
}
