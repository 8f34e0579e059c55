//! Root certificate authority for TLS interception.
//!
//! Generates the root CA once, keeps it as PEM in the CA directory, and hands
//! hudsucker an authority that signs per-host leaf certificates on demand.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, Utc};
use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;
use crate::trust::{self, SetupResult};

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "anchor-ca.crt";
const CA_KEY_FILENAME: &str = "anchor-ca.key";

/// Number of leaf certificates kept in the signing cache.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Identity of the generated root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    /// Subject common name, also used to find the root in trust stores.
    pub common_name: String,
    /// Validity from generation time.
    pub validity_days: u32,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: "Anchor Focus Root CA".to_string(),
            validity_days: 3650,
        }
    }
}

/// Manages the root CA certificate for the interception proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    config: CaConfig,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self::with_config(ca_dir, CaConfig::default())
    }

    /// Creates a CA manager with a custom identity.
    pub fn with_config(ca_dir: impl AsRef<Path>, config: CaConfig) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            config,
        }
    }

    /// Creates a CA manager under the default Anchor data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let data_dir = anchor_storage::default_data_dir()
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        Ok(Self::new(data_dir.join("ca")))
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating it first if either file is missing.
    ///
    /// Returns the hudsucker authority ready for use with the proxy.
    pub fn ensure(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate()?;
        }
        self.load_authority()
    }

    /// Generates a new root key pair and self-signed certificate.
    pub fn generate(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let cert = self
            .root_params()
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        write_private(&self.key_path(), &key_pair.serialize_pem())?;

        tracing::info!(
            common_name = %self.config.common_name,
            "Generated new CA certificate at {:?}",
            self.cert_path()
        );

        Ok(())
    }

    fn root_params(&self) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.config.common_name.as_str());
        dn.push(DnType::OrganizationName, "Anchor");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = Utc::now();
        let not_before = now - Duration::days(1);
        let not_after = now + Duration::days(i64::from(self.config.validity_days));
        params.not_before = date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );
        params.not_after = date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );

        params
    }

    /// Loads the CA files and creates a hudsucker authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }

    /// Reads the CA certificate PEM.
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }

    /// Checks whether the OS trusts this root.
    pub async fn is_trusted(&self) -> bool {
        trust::is_installed(&self.config.common_name).await
    }

    /// Installs the root into the OS trust store.
    pub async fn install(&self) -> SetupResult {
        let result = trust::install(&self.cert_path(), &self.config.common_name).await;
        if !result.success {
            tracing::warn!(needs_admin = result.needs_admin, "CA install failed: {}", result.message);
        }
        result
    }

    /// Removes the root from the OS trust store.
    pub async fn uninstall(&self) -> SetupResult {
        let result = trust::uninstall(&self.config.common_name).await;
        if !result.success {
            tracing::warn!(needs_admin = result.needs_admin, "CA uninstall failed: {}", result.message);
        }
        result
    }
}

/// Writes the private key readable by the owner only.
fn write_private(path: &Path, contents: &str) -> Result<(), CaManagerError> {
    fs::write(path, contents).map_err(|e| CaManagerError::Write(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/test-ca/anchor-ca.crt"));
        assert_eq!(manager.key_path(), PathBuf::from("/tmp/test-ca/anchor-ca.key"));
        assert_eq!(manager.config().common_name, "Anchor Focus Root CA");
        assert_eq!(manager.config().validity_days, 3650);
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn generate_writes_pem_files() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate().unwrap();
        assert!(manager.ca_exists());

        let cert = manager.read_cert_pem().unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        let key = fs::read_to_string(manager.key_path()).unwrap();
        assert!(key.contains("PRIVATE KEY"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn generated_root_is_a_ca_with_configured_name() {
        let temp_dir = TempDir::new().unwrap();
        let config = CaConfig {
            common_name: "Test Focus Root".into(),
            validity_days: 30,
        };
        let manager = CaManager::with_config(temp_dir.path(), config);
        manager.generate().unwrap();

        let params = CertificateParams::from_ca_cert_pem(&manager.read_cert_pem().unwrap()).unwrap();
        assert!(matches!(params.is_ca, IsCa::Ca(_)));
        let cn = params.distinguished_name.get(&DnType::CommonName).unwrap();
        assert!(format!("{cn:?}").contains("Test Focus Root"));
        assert!(params.not_before < params.not_after);
    }

    #[test]
    fn ensure_generates_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        assert!(manager.ensure().is_ok());
        assert!(manager.ca_exists());
    }

    #[test]
    fn ensure_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.ensure().unwrap();
        let first = manager.read_cert_pem().unwrap();
        manager.ensure().unwrap();
        assert_eq!(manager.read_cert_pem().unwrap(), first);
    }

    #[test]
    fn corrupt_key_is_a_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path());
        manager.generate().unwrap();
        fs::write(manager.key_path(), "garbage").unwrap();

        assert!(matches!(manager.ensure(), Err(CaManagerError::Parse(_))));
    }
}
