//! Anchor Proxy - TLS-intercepting proxy and OS integration.
//!
//! This crate puts the rule engine in the path of the user's web traffic.
//!
//! ## Features
//!
//! - Generates a root CA on first run and signs per-host certificates on the fly
//! - Installs the root into the OS trust store
//! - Evaluates every request against an atomically swapped snapshot
//! - Redirects blocked requests to local block pages
//! - Points the OS proxy at itself and restores the user's settings on exit,
//!   or on the next start after a crash
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy → Loopback/CONNECT? ── yes ──→ Forward
//!                              │ no
//!                              ▼
//!                       report visit → evaluate(snapshot)
//!                                           │
//!                          ┌────────────────┴────────────────┐
//!                          │ Allow                           │ Block / NuclearBlock
//!                          ▼                                 ▼
//!                     Forward Request              302 → localhost block page
//! ```

mod ca;
pub mod command;
mod error;
mod handler;
pub mod instance;
mod proxy;
pub mod state_cache;
pub mod system_proxy;
pub mod trust;

pub use anchor_storage::models::{DEFAULT_PROXY_PORT, DEFAULT_WEB_PORT};
pub use ca::{CaConfig, CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use handler::ProxyHandler;
pub use instance::InstanceLock;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use state_cache::StateCache;
pub use system_proxy::{
    platform_backend, MemoryBackend, ProxyBackend, ProxySettings, SystemProxyManager,
};
pub use trust::SetupResult;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        assert_eq!(DEFAULT_PROXY_PORT, 8766);
        assert_eq!(DEFAULT_WEB_PORT, 8767);
    }
}
