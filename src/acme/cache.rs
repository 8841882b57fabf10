//! Per-hostname certificate records and their on-disk cache
//!
//! Layout: `<cache_dir>/<hostname>/cert.pem` and `key.pem`. Private keys are
//! written 0600 on Unix and stored unencrypted, so the cache directory should
//! only be readable by the service user.

use super::IssueError;
use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Maximum DNS hostname length
const MAX_HOSTNAME_LEN: usize = 253;

/// A certificate usable for TLS handshakes on one hostname
pub struct CertificateRecord {
    pub hostname: String,
    pub expiry: DateTime<Utc>,
    cert_chain_pem: String,
    private_key_pem: String,
    tls: Arc<ServerConfig>,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("hostname", &self.hostname)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl CertificateRecord {
    /// Parse a PEM chain and key, read the leaf's expiry and build the
    /// per-host TLS configuration (h2 and http/1.1 over ALPN)
    pub fn from_pem(
        hostname: &str,
        cert_chain_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self, IssueError> {
        let invalid = |reason: String| IssueError::Invalid {
            host: hostname.to_string(),
            reason,
        };

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        let leaf = certs
            .first()
            .ok_or_else(|| invalid("no certificate in chain".to_string()))?;
        let expiry = certificate_expiry(leaf).map_err(invalid)?;

        let key = load_private_key(private_key_pem.as_bytes())
            .ok_or_else(|| invalid("no private key".to_string()))?;

        let mut tls = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| invalid(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid(e.to_string()))?;
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            hostname: hostname.to_string(),
            expiry,
            cert_chain_pem: cert_chain_pem.to_string(),
            private_key_pem: private_key_pem.to_string(),
            tls: Arc::new(tls),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls)
    }

    pub fn cert_chain_pem(&self) -> &str {
        &self.cert_chain_pem
    }

    pub fn is_expired(&self) -> bool {
        self.expiry <= Utc::now()
    }

    /// Whether the certificate expires within `window`
    pub fn needs_renewal(&self, window: Duration) -> bool {
        self.expiry - Utc::now() < window
    }

    /// Read the record for `hostname` from `cache_dir`, if present and valid
    pub fn load(cache_dir: &Path, hostname: &str) -> Option<Self> {
        let dir = cache_dir.join(hostname);
        let cert = std::fs::read_to_string(dir.join(CERT_FILE)).ok()?;
        let key = std::fs::read_to_string(dir.join(KEY_FILE)).ok()?;
        match Self::from_pem(hostname, &cert, &key) {
            Ok(record) => {
                debug!(hostname = %hostname, expiry = %record.expiry, "Loaded cached certificate");
                Some(record)
            }
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Ignoring unusable cached certificate");
                None
            }
        }
    }

    /// Every valid record below `cache_dir`
    pub fn load_all(cache_dir: &Path) -> Vec<Self> {
        let Ok(entries) = std::fs::read_dir(cache_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|name| is_valid_hostname(name))
            .filter_map(|name| Self::load(cache_dir, &name))
            .collect()
    }

    /// Persist the record, key with restricted permissions
    pub fn save(&self, cache_dir: &Path) -> anyhow::Result<()> {
        let dir = cache_dir.join(&self.hostname);
        std::fs::create_dir_all(&dir)?;

        let key_path = dir.join(KEY_FILE);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, self.private_key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, &self.private_key_pem)?;
        }

        let cert_path = dir.join(CERT_FILE);
        std::fs::write(&cert_path, &self.cert_chain_pem)?;

        info!(hostname = %self.hostname, path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }
}

/// `notAfter` of a DER certificate
pub fn certificate_expiry(cert: &CertificateDer<'_>) -> Result<DateTime<Utc>, String> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| format!("failed to parse X.509 certificate: {}", e))?;
    let timestamp = parsed.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| format!("certificate expiry {} out of range", timestamp))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// DNS name check; hostnames double as cache directory names
pub fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && !hostname.starts_with('.')
        && !hostname.contains("..")
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Validate and canonicalize the certificate cache directory path
pub fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("certificate cache directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize certificate cache directory '{}': {}", path, e)
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("certificate cache path '{}' exists but is not a directory", path);
        }
        return Ok(canonical);
    }

    // Not created yet: canonicalize the parent when it exists
    if let (Some(parent), Some(name)) = (path_buf.parent(), path_buf.file_name()) {
        if !parent.as_os_str().is_empty() && parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| {
                anyhow::anyhow!("Failed to canonicalize parent directory: {}", e)
            })?;
            return Ok(canonical_parent.join(name));
        }
    }

    Ok(path_buf)
}
