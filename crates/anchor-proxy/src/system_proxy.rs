//! OS proxy configuration with crash-safe restore.
//!
//! Before pointing the OS at the local proxy, [`SystemProxyManager`] saves the
//! user's current settings to `proxy-backup.json`. The file exists only while
//! this process owns the system proxy. If it is still there at startup, the
//! previous run died without restoring, and [`SystemProxyManager::recover_on_startup`]
//! puts the user's settings back.
//!
//! A backup is only ever touched by the process holding the data directory's
//! [`InstanceLock`]. A second launch sees a live owner, leaves the backup
//! alone, and fails with [`ProxyError::AlreadyRunning`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command;
use crate::error::{ProxyError, Result};
use crate::instance::InstanceLock;

/// Backup file name in the data directory.
pub const BACKUP_FILE: &str = "proxy-backup.json";

/// Hosts that bypass the proxy while Anchor owns it.
pub const DEFAULT_BYPASS: &str = "localhost;127.0.0.1;::1;<local>";

/// Proxy settings as the OS reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    pub enabled: bool,
    /// `host:port`.
    pub server: Option<String>,
    /// Semicolon-separated bypass entries.
    pub bypass: Option<String>,
}

impl ProxySettings {
    /// Settings that route through a local proxy on `port`.
    pub fn local(port: u16) -> Self {
        Self {
            enabled: true,
            server: Some(format!("127.0.0.1:{port}")),
            bypass: Some(DEFAULT_BYPASS.to_string()),
        }
    }

    fn bypass_entries(&self) -> Vec<String> {
        split_bypass(self.bypass.as_deref().unwrap_or_default())
    }
}

/// Splits a bypass string on `;` or `,`, dropping blanks and `<local>`.
fn split_bypass(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "<local>")
        .map(str::to_string)
        .collect()
}

/// Splits `host:port`, accepting only a numeric port.
fn split_server(server: &str) -> Option<(&str, u16)> {
    let (host, port) = server.rsplit_once(':')?;
    let port = port.parse().ok()?;
    (!host.is_empty()).then_some((host, port))
}

/// OS-specific proxy configuration surface.
#[async_trait]
pub trait ProxyBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reads the current settings.
    async fn read(&self) -> Result<ProxySettings>;

    /// Writes `settings`.
    async fn apply(&self, settings: &ProxySettings) -> Result<()>;

    /// Tells running applications that the settings changed.
    async fn notify(&self) -> Result<()>;
}

/// Returns the backend for the current OS.
pub fn platform_backend() -> Arc<dyn ProxyBackend> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(WindowsRegistryBackend)
    }

    #[cfg(target_os = "macos")]
    {
        Arc::new(MacNetworkSetupBackend::default())
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        Arc::new(GnomeBackend)
    }
}

async fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let out = command::run(program, args).await?;
    if out.success {
        Ok(out.stdout)
    } else {
        Err(ProxyError::SystemProxy(format!(
            "{program} {} failed: {}",
            args.first().copied().unwrap_or_default(),
            out.stderr.trim()
        )))
    }
}

// ============================================================================
// Windows registry
// ============================================================================

const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Calls `InternetSetOption` with SETTINGS_CHANGED (39) then REFRESH (37).
const WININET_REFRESH_SCRIPT: &str = r#"$sig = '[DllImport("wininet.dll", SetLastError = true)] public static extern bool InternetSetOption(IntPtr hInternet, int dwOption, IntPtr lpBuffer, int dwBufferLength);'; $t = Add-Type -MemberDefinition $sig -Name WinInet -Namespace AnchorProxy -PassThru; $t::InternetSetOption([IntPtr]::Zero, 39, [IntPtr]::Zero, 0) | Out-Null; $t::InternetSetOption([IntPtr]::Zero, 37, [IntPtr]::Zero, 0) | Out-Null"#;

/// Per-user WinINet settings under `HKCU`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistryBackend;

/// Extracts a value from `reg query` output.
fn parse_reg_value(stdout: &str, name: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if !parts.next()?.eq_ignore_ascii_case(name) {
            return None;
        }
        let _kind = parts.next()?;
        Some(parts.collect::<Vec<_>>().join(" "))
    })
}

fn parse_reg_dword(value: &str) -> Option<u32> {
    let hex = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

impl WindowsRegistryBackend {
    async fn query(&self, name: &str) -> Result<Option<String>> {
        let out = command::run("reg", &["query", INTERNET_SETTINGS_KEY, "/v", name]).await?;
        // A missing value exits non-zero.
        Ok(out
            .success
            .then(|| parse_reg_value(&out.stdout, name))
            .flatten()
            .filter(|v| !v.is_empty()))
    }

    async fn set(&self, name: &str, kind: &str, data: &str) -> Result<()> {
        run_checked(
            "reg",
            &["add", INTERNET_SETTINGS_KEY, "/v", name, "/t", kind, "/d", data, "/f"],
        )
        .await
        .map(|_| ())
    }

    async fn delete(&self, name: &str) {
        let _ = command::run("reg", &["delete", INTERNET_SETTINGS_KEY, "/v", name, "/f"]).await;
    }
}

#[async_trait]
impl ProxyBackend for WindowsRegistryBackend {
    fn name(&self) -> &'static str {
        "windows-registry"
    }

    async fn read(&self) -> Result<ProxySettings> {
        let enabled = self
            .query("ProxyEnable")
            .await?
            .and_then(|v| parse_reg_dword(&v))
            .is_some_and(|v| v != 0);

        Ok(ProxySettings {
            enabled,
            server: self.query("ProxyServer").await?,
            bypass: self.query("ProxyOverride").await?,
        })
    }

    async fn apply(&self, settings: &ProxySettings) -> Result<()> {
        match &settings.server {
            Some(server) => self.set("ProxyServer", "REG_SZ", server).await?,
            None => self.delete("ProxyServer").await,
        }
        match &settings.bypass {
            Some(bypass) => self.set("ProxyOverride", "REG_SZ", bypass).await?,
            None => self.delete("ProxyOverride").await,
        }
        let flag = if settings.enabled { "1" } else { "0" };
        self.set("ProxyEnable", "REG_DWORD", flag).await
    }

    async fn notify(&self) -> Result<()> {
        run_checked(
            "powershell",
            &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", WININET_REFRESH_SCRIPT],
        )
        .await
        .map(|_| ())
    }
}

// ============================================================================
// macOS networksetup
// ============================================================================

/// Web and secure web proxy of one network service.
#[derive(Debug, Default, Clone)]
pub struct MacNetworkSetupBackend {
    /// Service to configure; detected when `None`.
    service: Option<String>,
}

impl MacNetworkSetupBackend {
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
        }
    }

    async fn service(&self) -> Result<String> {
        if let Some(service) = &self.service {
            return Ok(service.clone());
        }
        let stdout = run_checked("networksetup", &["-listallnetworkservices"]).await?;
        pick_network_service(&stdout)
            .ok_or_else(|| ProxyError::SystemProxy("Could not find active network service".into()))
    }
}

/// Prefers common interfaces, then the first enabled service.
fn pick_network_service(stdout: &str) -> Option<String> {
    let services: Vec<&str> = stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .collect();

    ["Wi-Fi", "Ethernet", "USB 10/100/1000 LAN"]
        .iter()
        .find(|preferred| services.contains(*preferred))
        .copied()
        .or_else(|| services.first().copied())
        .map(str::to_string)
}

/// Parses `networksetup -getwebproxy` output into enabled flag and `host:port`.
fn parse_networksetup_proxy(stdout: &str) -> (bool, Option<String>) {
    let mut enabled = false;
    let mut server = None;
    let mut port = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => enabled = value.eq_ignore_ascii_case("yes"),
            "Server" if !value.is_empty() => server = Some(value.to_string()),
            "Port" => port = value.parse::<u16>().ok().filter(|p| *p > 0),
            _ => {}
        }
    }
    let server = server.zip(port).map(|(host, port)| format!("{host}:{port}"));
    (enabled, server)
}

fn parse_networksetup_bypass(stdout: &str) -> Option<String> {
    if stdout.contains("aren't any") {
        return None;
    }
    let entries: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    (!entries.is_empty()).then(|| entries.join(";"))
}

#[async_trait]
impl ProxyBackend for MacNetworkSetupBackend {
    fn name(&self) -> &'static str {
        "networksetup"
    }

    async fn read(&self) -> Result<ProxySettings> {
        let service = self.service().await?;
        let web = run_checked("networksetup", &["-getwebproxy", &service]).await?;
        let (enabled, server) = parse_networksetup_proxy(&web);
        let bypass = run_checked("networksetup", &["-getproxybypassdomains", &service])
            .await
            .ok()
            .and_then(|out| parse_networksetup_bypass(&out));

        Ok(ProxySettings {
            enabled,
            server,
            bypass,
        })
    }

    async fn apply(&self, settings: &ProxySettings) -> Result<()> {
        let service = self.service().await?;

        if let Some((host, port)) = settings.server.as_deref().and_then(split_server) {
            let port = port.to_string();
            run_checked("networksetup", &["-setwebproxy", &service, host, &port]).await?;
            run_checked("networksetup", &["-setsecurewebproxy", &service, host, &port]).await?;
        }

        let mut args = vec!["-setproxybypassdomains".to_string(), service.clone()];
        let entries = settings.bypass_entries();
        if entries.is_empty() {
            args.push("Empty".into());
        } else {
            args.extend(entries);
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("networksetup", &args).await?;

        let state = if settings.enabled { "on" } else { "off" };
        run_checked("networksetup", &["-setwebproxystate", &service, state]).await?;
        run_checked("networksetup", &["-setsecurewebproxystate", &service, state]).await?;
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        // configd broadcasts networksetup changes itself.
        Ok(())
    }
}

// ============================================================================
// GNOME gsettings
// ============================================================================

/// `org.gnome.system.proxy` through `gsettings`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GnomeBackend;

/// Strips GVariant string quoting: `'manual'` becomes `manual`.
fn unquote_gvariant(raw: &str) -> String {
    raw.trim().trim_matches('\'').to_string()
}

/// Parses a GVariant string array such as `['localhost', '127.0.0.0/8']`.
fn parse_gvariant_list(raw: &str) -> Vec<String> {
    let raw = raw.trim().trim_start_matches("@as").trim();
    raw.trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(unquote_gvariant)
        .filter(|s| !s.is_empty())
        .collect()
}

fn format_gvariant_list(entries: &[String]) -> String {
    let quoted: Vec<String> = entries
        .iter()
        .map(|e| format!("'{}'", e.replace('\'', "")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

impl GnomeBackend {
    async fn get(&self, schema: &str, key: &str) -> Result<String> {
        run_checked("gsettings", &["get", schema, key]).await
    }

    async fn set(&self, schema: &str, key: &str, value: &str) -> Result<()> {
        run_checked("gsettings", &["set", schema, key, value]).await.map(|_| ())
    }
}

#[async_trait]
impl ProxyBackend for GnomeBackend {
    fn name(&self) -> &'static str {
        "gsettings"
    }

    async fn read(&self) -> Result<ProxySettings> {
        let mode = unquote_gvariant(&self.get("org.gnome.system.proxy", "mode").await?);
        let host = unquote_gvariant(&self.get("org.gnome.system.proxy.http", "host").await?);
        let port = self
            .get("org.gnome.system.proxy.http", "port")
            .await?
            .trim()
            .parse::<u16>()
            .unwrap_or(0);
        let ignore = parse_gvariant_list(&self.get("org.gnome.system.proxy", "ignore-hosts").await?);

        Ok(ProxySettings {
            enabled: mode == "manual",
            server: (!host.is_empty() && port > 0).then(|| format!("{host}:{port}")),
            bypass: (!ignore.is_empty()).then(|| ignore.join(";")),
        })
    }

    async fn apply(&self, settings: &ProxySettings) -> Result<()> {
        if let Some((host, port)) = settings.server.as_deref().and_then(split_server) {
            let port = port.to_string();
            for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
                self.set(schema, "host", host).await?;
                self.set(schema, "port", &port).await?;
            }
        }

        let ignore = format_gvariant_list(&settings.bypass_entries());
        self.set("org.gnome.system.proxy", "ignore-hosts", &ignore).await?;

        let mode = if settings.enabled { "manual" } else { "none" };
        self.set("org.gnome.system.proxy", "mode", mode).await
    }

    async fn notify(&self) -> Result<()> {
        // dconf change notifications reach GNOME applications directly.
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Backend that keeps settings in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    settings: Arc<parking_lot::Mutex<ProxySettings>>,
    notifications: Arc<std::sync::atomic::AtomicUsize>,
}

impl MemoryBackend {
    pub fn with_settings(settings: ProxySettings) -> Self {
        let backend = Self::default();
        *backend.settings.lock() = settings;
        backend
    }

    /// Settings as last applied.
    pub fn current(&self) -> ProxySettings {
        self.settings.lock().clone()
    }

    /// Number of `notify` calls.
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(&self) -> Result<ProxySettings> {
        Ok(self.current())
    }

    async fn apply(&self, settings: &ProxySettings) -> Result<()> {
        *self.settings.lock() = settings.clone();
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Points the OS at the local proxy and puts the user's settings back.
pub struct SystemProxyManager {
    backend: Arc<dyn ProxyBackend>,
    data_dir: PathBuf,
    backup_path: PathBuf,
    owns_backup: AtomicBool,
    instance: parking_lot::Mutex<Option<InstanceLock>>,
}

impl std::fmt::Debug for SystemProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProxyManager")
            .field("backend", &self.backend.name())
            .field("backup_path", &self.backup_path)
            .field("owns_backup", &self.owns_backup())
            .field("claimed", &self.instance.lock().is_some())
            .finish()
    }
}

impl SystemProxyManager {
    /// Creates a manager that keeps its backup in `data_dir`.
    pub fn new(backend: Arc<dyn ProxyBackend>, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            backend,
            backup_path: data_dir.join(BACKUP_FILE),
            data_dir,
            owns_backup: AtomicBool::new(false),
            instance: parking_lot::Mutex::new(None),
        }
    }

    /// Creates a manager for the current OS.
    pub fn for_platform(data_dir: impl AsRef<Path>) -> Self {
        Self::new(platform_backend(), data_dir)
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Takes the data directory's instance lock, once.
    ///
    /// Fails with [`ProxyError::AlreadyRunning`] while another live instance
    /// holds it.
    pub fn claim(&self) -> Result<()> {
        let mut instance = self.instance.lock();
        if instance.is_some() {
            return Ok(());
        }

        match InstanceLock::try_acquire(&self.data_dir)? {
            Some(lock) => {
                *instance = Some(lock);
                Ok(())
            }
            None => Err(ProxyError::AlreadyRunning(self.data_dir.clone())),
        }
    }

    /// Whether this instance wrote the backup it would restore.
    pub fn owns_backup(&self) -> bool {
        self.owns_backup.load(Ordering::SeqCst)
    }

    /// Saves the current settings and routes the OS through `127.0.0.1:port`.
    ///
    /// An existing backup is kept: it holds the settings from before Anchor
    /// first took over. If applying fails, the backup is restored.
    pub async fn enable(&self, port: u16) -> Result<()> {
        self.claim()?;
        if tokio::fs::try_exists(&self.backup_path).await? {
            debug!("Keeping existing proxy backup at {:?}", self.backup_path);
        } else {
            let current = self.backend.read().await?;
            let bytes = serde_json::to_vec_pretty(&current)?;
            let path = self.backup_path.clone();
            tokio::task::spawn_blocking(move || anchor_storage::store::atomic_write(&path, &bytes))
                .await
                .map_err(|e| ProxyError::SystemProxy(e.to_string()))??;
            debug!(?current, "Saved proxy settings backup");
        }
        self.owns_backup.store(true, Ordering::SeqCst);

        let settings = ProxySettings::local(port);
        let applied = match self.backend.apply(&settings).await {
            Ok(()) => self.backend.notify().await,
            Err(e) => Err(e),
        };

        if let Err(e) = applied {
            warn!(backend = self.backend.name(), "Failed to enable system proxy: {}", e);
            if let Err(restore_err) = self.restore_from_backup().await {
                warn!("Rollback after failed enable also failed: {}", restore_err);
            }
            return Err(e);
        }

        info!(backend = self.backend.name(), port, "System proxy enabled");
        Ok(())
    }

    /// Restores the user's settings if this instance changed them.
    ///
    /// Returns whether anything was restored.
    pub async fn disable(&self) -> Result<bool> {
        if !self.owns_backup() {
            debug!("System proxy not owned by this instance, nothing to disable");
            return Ok(false);
        }
        self.restore_from_backup().await
    }

    /// Applies the saved settings and deletes the backup.
    ///
    /// Succeeds without doing anything when there is no backup. A corrupt
    /// backup restores a disabled proxy.
    pub async fn restore_from_backup(&self) -> Result<bool> {
        let raw = match tokio::fs::read_to_string(&self.backup_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.owns_backup.store(false, Ordering::SeqCst);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let settings = serde_json::from_str::<ProxySettings>(&raw).unwrap_or_else(|e| {
            warn!("Proxy backup is corrupt, disabling proxy instead: {}", e);
            ProxySettings::default()
        });

        self.backend.apply(&settings).await?;
        if let Err(e) = self.backend.notify().await {
            warn!(backend = self.backend.name(), "Proxy change notification failed: {}", e);
        }

        match tokio::fs::remove_file(&self.backup_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.owns_backup.store(false, Ordering::SeqCst);

        info!(backend = self.backend.name(), enabled = settings.enabled, "System proxy restored");
        Ok(true)
    }

    /// Restores settings left behind by a run that did not shut down cleanly.
    ///
    /// A backup belonging to a live instance is left alone.
    pub async fn recover_on_startup(&self) -> Result<bool> {
        self.claim()?;
        if !tokio::fs::try_exists(&self.backup_path).await? {
            return Ok(false);
        }
        warn!("Found proxy backup from an unclean shutdown, restoring");
        self.restore_from_backup().await
    }
}
