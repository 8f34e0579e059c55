//! Intercepting proxy server.
//!
//! Binds the listener up front so a port conflict is reported to the caller
//! before anything touches the OS proxy settings.

use std::net::SocketAddr;
use std::sync::Arc;

use anchor_core::rule_engine::VisitSink;
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::state_cache::StateCache;
use crate::{DEFAULT_PROXY_PORT, DEFAULT_WEB_PORT};

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Port of the local web server hosting block pages.
    pub web_port: u16,
}

impl ProxyConfig {
    /// Creates a configuration on the default ports.
    pub fn new(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            web_port: DEFAULT_WEB_PORT,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the block page port.
    pub fn with_web_port(mut self, web_port: u16) -> Self {
        self.web_port = web_port;
        self
    }
}

/// Intercepting proxy for focus enforcement.
pub struct ProxyServer {
    config: ProxyConfig,
    state: StateCache,
    sink: Arc<dyn VisitSink>,
}

impl ProxyServer {
    /// Creates a server that evaluates against `state` and reports to `sink`.
    pub fn new(config: ProxyConfig, state: StateCache, sink: Arc<dyn VisitSink>) -> Self {
        Self {
            config,
            state,
            sink,
        }
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Binds the listener and serves in the background.
    ///
    /// Fails without spawning anything if the CA cannot be loaded or the port
    /// is taken.
    pub async fn start(self) -> Result<ProxyHandle> {
        let authority = self.config.ca_manager.ensure().map_err(ProxyError::Ca)?;

        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let handler = ProxyHandler::new(self.state, self.sink, self.config.web_port);

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tracing::info!("Intercepting proxy listening on {}", addr);

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use anchor_core::rule_engine::BlockingState;
    use tempfile::TempDir;

    use super::*;

    struct NullSink;

    impl VisitSink for NullSink {
        fn visit(&self, _host: &str) {}
        fn blocked(&self, _host: &str) {}
    }

    fn server(dir: &TempDir, addr: SocketAddr) -> ProxyServer {
        let config = ProxyConfig::new(CaManager::new(dir.path().join("ca"))).with_addr(addr);
        ProxyServer::new(config, StateCache::new(BlockingState::default()), Arc::new(NullSink))
    }

    #[test]
    fn proxy_config_builders() {
        let config = ProxyConfig::new(CaManager::new("/tmp/ca"))
            .with_port(8888)
            .with_web_port(9999);
        assert_eq!(config.addr, SocketAddr::from(([127, 0, 0, 1], 8888)));
        assert_eq!(config.web_port, 9999);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_stops() {
        let dir = TempDir::new().unwrap();
        let handle = server(&dir, SocketAddr::from(([127, 0, 0, 1], 0)))
            .start()
            .await
            .unwrap();

        assert_ne!(handle.addr().port(), 0);
        assert!(dir.path().join("ca").join("anchor-ca.crt").exists());
        handle.stop().await;
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = server(&dir, addr).start().await.err().unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
