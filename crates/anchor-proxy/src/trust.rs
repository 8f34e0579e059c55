//! Root CA installation into the OS trust store.
//!
//! Every function shells out through [`crate::command`], so nothing here can
//! block forever. Failures come back as a [`SetupResult`] rather than an
//! error: a missing trust entry degrades interception but never stops it.

use std::path::Path;

use crate::command::{self, CommandOutput, ELEVATED_COMMAND_TIMEOUT};

/// Outcome of a trust-store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable message.
    pub message: String,
    /// Whether admin/root privileges are required.
    pub needs_admin: bool,
}

impl SetupResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            needs_admin: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            needs_admin: false,
        }
    }

    pub fn needs_admin(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            needs_admin: true,
        }
    }
}

/// File name the certificate is installed under in Linux anchor directories.
pub const INSTALLED_CERT_NAME: &str = "anchor-ca.crt";

/// Linux anchor directories with the command that refreshes each store.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const LINUX_ANCHORS: &[(&str, &[&str], &str)] = &[
    (
        "/usr/local/share/ca-certificates",
        &["update-ca-certificates"],
        "Debian/Ubuntu",
    ),
    (
        "/etc/pki/ca-trust/source/anchors",
        &["update-ca-trust", "extract"],
        "Fedora/RHEL",
    ),
    (
        "/etc/ca-certificates/trust-source/anchors",
        &["trust", "extract-compat"],
        "Arch Linux",
    ),
];

/// Installs `cert_path` as a trusted root.
pub async fn install(cert_path: &Path, common_name: &str) -> SetupResult {
    #[cfg(target_os = "windows")]
    {
        install_windows(cert_path, common_name).await
    }

    #[cfg(target_os = "macos")]
    {
        let _ = common_name;
        install_macos(cert_path).await
    }

    #[cfg(target_os = "linux")]
    {
        let _ = common_name;
        install_linux(cert_path).await
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = (cert_path, common_name);
        SetupResult::failure("Unsupported operating system")
    }
}

/// Removes every trusted root named `common_name`.
pub async fn uninstall(common_name: &str) -> SetupResult {
    #[cfg(target_os = "windows")]
    {
        uninstall_windows(common_name).await
    }

    #[cfg(target_os = "macos")]
    {
        uninstall_macos(common_name).await
    }

    #[cfg(target_os = "linux")]
    {
        let _ = common_name;
        uninstall_linux().await
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = common_name;
        SetupResult::failure("Unsupported operating system")
    }
}

/// Checks whether a root named `common_name` is trusted.
pub async fn is_installed(common_name: &str) -> bool {
    #[cfg(target_os = "windows")]
    {
        for args in [["-store", "Root"].as_slice(), ["-store", "-user", "Root"].as_slice()] {
            if let Ok(out) = command::run("certutil", args).await {
                if out.stdout.contains(common_name) {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(target_os = "macos")]
    {
        // Admin domain (system keychain install) first, then the user domain.
        for args in [
            ["dump-trust-settings", "-d"].as_slice(),
            ["dump-trust-settings"].as_slice(),
        ] {
            if let Ok(out) = command::run("security", args).await {
                if out.success && trust_settings_allow(&out.stdout, common_name) {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(target_os = "linux")]
    {
        let _ = common_name;
        LINUX_ANCHORS
            .iter()
            .any(|(dir, _, _)| Path::new(dir).join(INSTALLED_CERT_NAME).exists())
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = common_name;
        false
    }
}

/// Checks `security dump-trust-settings` output for a root named
/// `common_name` whose settings neither deny nor leave trust unspecified.
///
/// A cert listed with no settings at all is trusted as a root.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn trust_settings_allow(stdout: &str, common_name: &str) -> bool {
    let mut in_block = false;
    let mut trusted = false;

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Cert ") {
            if in_block && trusted {
                return true;
            }
            in_block = rest
                .split_once(':')
                .is_some_and(|(_, name)| name.trim() == common_name);
            trusted = in_block;
        } else if in_block
            && (line.contains("kSecTrustSettingsResultDeny")
                || line.contains("kSecTrustSettingsResultUnspecified"))
        {
            trusted = false;
        }
    }

    in_block && trusted
}

/// Maps a failed privileged command to a result, spotting a dismissed prompt.
#[cfg_attr(
    not(any(target_os = "windows", target_os = "macos", target_os = "linux")),
    allow(dead_code)
)]
fn elevation_failure(out: &CommandOutput, action: &str) -> SetupResult {
    let stderr = out.stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("dismissed") || lower.contains("cancelled") || lower.contains("canceled") {
        SetupResult::needs_admin("Authentication cancelled by user")
    } else if lower.contains("not authorized") || lower.contains("permission denied") {
        SetupResult::needs_admin(format!("{action} requires administrator privileges"))
    } else {
        SetupResult::failure(format!("{action} failed: {stderr}"))
    }
}

/// Picks the graphical prompt when a display is available.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn linux_elevation_tool(has_display: bool) -> &'static str {
    if has_display {
        "pkexec"
    } else {
        "sudo"
    }
}

// ============================================================================
// Windows
// ============================================================================

#[cfg(target_os = "windows")]
async fn install_windows(cert_path: &Path, common_name: &str) -> SetupResult {
    let cert = cert_path.to_string_lossy();

    // Machine store first, through a UAC prompt.
    let script = format!(
        "$p = Start-Process -FilePath 'certutil' -ArgumentList '-addstore', 'Root', '{}' -Verb RunAs -Wait -PassThru -WindowStyle Hidden; exit $p.ExitCode",
        cert.replace('\'', "''")
    );
    let elevated = command::run_with_timeout(
        "powershell",
        &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", &script],
        ELEVATED_COMMAND_TIMEOUT,
    )
    .await;

    if matches!(&elevated, Ok(out) if out.success) {
        return SetupResult::success("CA certificate installed to machine trust store");
    }

    tracing::debug!(common_name, "Elevated install declined, trying user store");
    match command::run("certutil", &["-addstore", "-user", "Root", &cert]).await {
        Ok(out) if out.success => {
            SetupResult::success("CA certificate installed to user trust store (current user only)")
        }
        Ok(out) => elevation_failure(&out, "Certificate install"),
        Err(e) => SetupResult::failure(e.to_string()),
    }
}

#[cfg(target_os = "windows")]
async fn uninstall_windows(common_name: &str) -> SetupResult {
    let mut removed = false;
    for args in [
        ["-delstore", "-user", "Root", common_name].as_slice(),
        ["-delstore", "Root", common_name].as_slice(),
    ] {
        if let Ok(out) = command::run("certutil", args).await {
            removed |= out.success;
        }
    }

    if removed {
        SetupResult::success("CA certificate removed from trust store")
    } else {
        SetupResult::needs_admin("Could not remove certificate; machine store needs elevation")
    }
}

// ============================================================================
// macOS
// ============================================================================

#[cfg(target_os = "macos")]
async fn install_macos(cert_path: &Path) -> SetupResult {
    let cert = cert_path.to_string_lossy();

    // System keychain through the native admin dialog.
    let script = format!(
        r#"do shell script "security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain '{}'" with administrator privileges"#,
        cert.replace('\'', "'\\''")
    );
    let elevated =
        command::run_with_timeout("osascript", &["-e", &script], ELEVATED_COMMAND_TIMEOUT).await;
    if matches!(&elevated, Ok(out) if out.success) {
        return SetupResult::success("CA certificate installed to system keychain");
    }

    let keychain = format!(
        "{}/Library/Keychains/login.keychain-db",
        std::env::var("HOME").unwrap_or_default()
    );
    match command::run_with_timeout(
        "security",
        &["add-trusted-cert", "-r", "trustRoot", "-k", &keychain, &cert],
        ELEVATED_COMMAND_TIMEOUT,
    )
    .await
    {
        Ok(out) if out.success => {
            SetupResult::success("CA certificate installed to user keychain (current user only)")
        }
        Ok(out) => elevation_failure(&out, "Certificate install"),
        Err(e) => SetupResult::failure(e.to_string()),
    }
}

#[cfg(target_os = "macos")]
async fn uninstall_macos(common_name: &str) -> SetupResult {
    let script = format!(
        r#"do shell script "security delete-certificate -c '{}' /Library/Keychains/System.keychain" with administrator privileges"#,
        common_name.replace('\'', "'\\''")
    );
    let system =
        command::run_with_timeout("osascript", &["-e", &script], ELEVATED_COMMAND_TIMEOUT).await;
    let user = command::run("security", &["delete-certificate", "-c", common_name]).await;

    let removed = [system, user]
        .iter()
        .any(|r| matches!(r, Ok(out) if out.success));
    if removed {
        SetupResult::success("CA certificate removed from keychain")
    } else {
        SetupResult::failure("No certificate found to remove (may not be installed)")
    }
}

// ============================================================================
// Linux
// ============================================================================

#[cfg(target_os = "linux")]
fn has_display() -> bool {
    std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
}

#[cfg(target_os = "linux")]
async fn install_linux(cert_path: &Path) -> SetupResult {
    let elevate = linux_elevation_tool(has_display());
    let cert = cert_path.to_string_lossy();

    let Some((dir, refresh, distro)) = LINUX_ANCHORS
        .iter()
        .find(|(dir, _, _)| Path::new(dir).exists())
    else {
        return SetupResult::failure(
            "Unknown Linux distribution. Please install the CA certificate manually.",
        );
    };

    let dest = Path::new(dir).join(INSTALLED_CERT_NAME);
    let dest = dest.to_string_lossy();
    match command::run_with_timeout(elevate, &["cp", &cert, &dest], ELEVATED_COMMAND_TIMEOUT).await
    {
        Ok(out) if out.success => {}
        Ok(out) => return elevation_failure(&out, "Certificate install"),
        Err(e) => return SetupResult::failure(e.to_string()),
    }

    match command::run_with_timeout(elevate, refresh, ELEVATED_COMMAND_TIMEOUT).await {
        Ok(out) if out.success => SetupResult::success(format!("CA certificate installed ({distro})")),
        Ok(out) => elevation_failure(&out, "Trust store refresh"),
        Err(e) => SetupResult::failure(e.to_string()),
    }
}

#[cfg(target_os = "linux")]
async fn uninstall_linux() -> SetupResult {
    let elevate = linux_elevation_tool(has_display());
    let mut removed = false;

    for (dir, refresh, _) in LINUX_ANCHORS {
        let installed = Path::new(dir).join(INSTALLED_CERT_NAME);
        if !installed.exists() {
            continue;
        }
        let installed = installed.to_string_lossy();
        if let Ok(out) =
            command::run_with_timeout(elevate, &["rm", &installed], ELEVATED_COMMAND_TIMEOUT).await
        {
            if out.success {
                removed = true;
                let _ = command::run_with_timeout(elevate, refresh, ELEVATED_COMMAND_TIMEOUT).await;
            }
        }
    }

    if removed {
        SetupResult::success("CA certificate removed")
    } else {
        SetupResult::failure("No certificate found to remove (may not be installed)")
    }
}
