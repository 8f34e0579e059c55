//! Anchor - personal focus enforcement.
//!
//! This is the main binary that runs the full Anchor engine:
//! - Control API and block pages (local HTTP)
//! - MITM proxy that applies the block rules
//! - OS proxy settings, restored on exit or on the next start after a crash

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anchor_core::session::SessionEvent;
use anchor_proxy::{CaManager, ProxyConfig, ProxyServer, SystemProxyManager};
use anchor_server::{Controller, Server, ServerConfig};
use anchor_storage::store::DOCUMENT_FILE;
use anchor_storage::{default_data_dir, PersistentStore};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time allowed for putting the user's proxy settings back.
const RESTORE_BUDGET: Duration = Duration::from_secs(3);

/// Anchor - blocks distractions while you focus
#[derive(Parser, Debug)]
#[command(name = "anchor", version, about)]
struct Args {
    /// Proxy listen port (overrides the saved setting)
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Control API and block page port (overrides the saved setting)
    #[arg(long)]
    web_port: Option<u16>,

    /// Directory for settings, the CA and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Leave the OS proxy settings alone
    #[arg(long)]
    no_system_proxy: bool,

    /// Don't add the CA to the OS trust store
    #[arg(long)]
    skip_ca_install: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn filter_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args, data_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("anchor={},warn", args.filter_level())));

    let log_dir = data_dir.join("logs");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("anchor")
            .filename_suffix("log")
            .build(&log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Logs panics, puts the OS proxy settings back, and ends the process.
///
/// A panic inside a spawned task ends the process too: with the settings
/// restored, nothing is filtered any more.
fn install_panic_hook(system_proxy: Arc<SystemProxyManager>) {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        restore_blocking(&system_proxy);
        default_hook(panic_info);
        std::process::abort();
    }));
}

/// Restores the proxy settings from outside any runtime.
fn restore_blocking(system_proxy: &Arc<SystemProxyManager>) {
    // The caller may be on a runtime thread, which can't block_on.
    let manager = Arc::clone(system_proxy);
    let restore = std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Cannot restore proxy settings: {}", e);
                return;
            }
        };
        match runtime.block_on(tokio::time::timeout(RESTORE_BUDGET, manager.disable())) {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Failed to restore proxy settings: {}", e),
            Err(_) => tracing::error!("Timed out restoring proxy settings"),
        }
    });
    let _ = restore.join();
}

/// Waits for Ctrl-C or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl-C");
}

/// Logs session events the user should hear about.
fn spawn_event_logger(controller: &Controller) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::RewardGranted { amount_ms, .. }) => {
                    tracing::info!(amount_ms, "Break time earned");
                }
                Ok(SessionEvent::BreakExpired) => {
                    tracing::warn!("Break is over; close blocked apps");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Puts the user's proxy settings back within the restore budget.
async fn restore_system_proxy(system_proxy: &SystemProxyManager) {
    match tokio::time::timeout(RESTORE_BUDGET, system_proxy.disable()).await {
        Ok(Ok(true)) => tracing::info!("System proxy settings restored"),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => tracing::error!("Failed to restore system proxy: {}", e),
        Err(_) => tracing::error!(
            "Timed out restoring system proxy; it will be restored on next start"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)?;

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&args, &data_dir);

    tracing::info!("Starting Anchor...");
    tracing::debug!("Args: {:?}", args);

    // A second launch must stop here, before it can touch the running
    // instance's proxy backup.
    let system_proxy = Arc::new(SystemProxyManager::for_platform(&data_dir));
    if let Err(e) = system_proxy.claim() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    // A leftover backup means the last run never restored the user's settings.
    if let Err(e) = system_proxy.recover_on_startup().await {
        tracing::error!("Failed to recover proxy settings from last run: {}", e);
    }

    let store = PersistentStore::open(data_dir.join(DOCUMENT_FILE)).await?;
    let saved = store.get_all();
    let proxy_port = args.proxy_port.unwrap_or(saved.proxy_port);
    let web_port = args.web_port.unwrap_or(saved.web_port);

    let ca = CaManager::new(data_dir.join("ca"));
    ca.ensure()?;
    tracing::info!("CA certificate: {:?}", ca.cert_path());
    if args.skip_ca_install {
        tracing::info!("Skipping CA install");
    } else if ca.is_trusted().await {
        tracing::debug!("CA already trusted");
    } else {
        let result = ca.install().await;
        if result.success {
            tracing::info!("{}", result.message);
        }
    }

    let controller = Controller::spawn(Arc::new(store));
    let events = spawn_event_logger(&controller);

    // Both listeners are bound before the OS proxy is touched.
    let server = Server::new(ServerConfig::default().with_port(web_port), controller.clone())?;
    let listener = server.bind()?;

    let proxy_config = ProxyConfig::new(ca)
        .with_port(proxy_port)
        .with_web_port(web_port);
    let proxy = ProxyServer::new(proxy_config, controller.cache(), controller.visit_sink())
        .start()
        .await?;

    install_panic_hook(Arc::clone(&system_proxy));
    if args.no_system_proxy {
        tracing::info!("Leaving system proxy settings alone; point clients at {}", proxy.addr());
    } else if let Err(e) = system_proxy.enable(proxy.addr().port()).await {
        tracing::error!("Could not set the system proxy; traffic is not filtered: {}", e);
    }

    let (stop_server, server_stopped) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(server.serve(listener, async move {
        let _ = server_stopped.await;
    }));

    tracing::info!("Anchor is running");
    wait_for_shutdown().await;

    tracing::info!("Anchor shutting down");
    restore_system_proxy(&system_proxy).await;
    proxy.stop().await;
    controller.shutdown().await;
    events.abort();

    let _ = stop_server.send(());
    match server_task.await {
        Ok(Err(e)) => tracing::error!("Control API error: {}", e),
        Err(e) => tracing::error!("Control API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}
