//! On-demand TLS certificates
//!
//! The [`CertificateManager`] hands out a [`CertificateRecord`] per SNI
//! hostname. A hostname moves through
//! `Unissued -> Issuing -> Valid -> Renewing -> Valid | Failed`:
//!
//! - only hostnames in the current routing snapshot are ever issued
//! - concurrent handshakes for a hostname share one issuance
//! - a record inside the renewal window keeps being served while a
//!   replacement is issued in the background
//! - `Failed` is advisory: the next handshake retries

mod cache;
mod issuer;

pub use cache::{certificate_expiry, is_valid_hostname, validate_cache_dir, CertificateRecord};
pub use issuer::{
    AcmeIssuer, CertificateIssuer, Http01Challenges, IssuedCertificate, ACME_CHALLENGE_PREFIX,
};

use crate::config::normalize_host;
use crate::store::ConfigStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Why a hostname has no certificate to present
#[derive(Debug, Clone, Error)]
pub enum IssueError {
    /// Hostname is not a configured virtual host
    #[error("certificates are not issued for {0}")]
    NotAllowed(String),
    /// The issuer could not obtain a certificate
    #[error("issuance failed for {host}: {reason}")]
    Failed { host: String, reason: String },
    /// The issuer or cache produced something unusable
    #[error("invalid certificate for {host}: {reason}")]
    Invalid { host: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    Unissued,
    Issuing,
    Valid,
    Renewing,
    Failed,
}

/// Per-hostname view for operators
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub hostname: String,
    pub state: CertificateState,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CertificateSettings {
    pub cache_dir: PathBuf,
    /// Renew certificates expiring within this window
    pub renew_before: Duration,
}

#[derive(Debug, Clone)]
struct Failure {
    at: DateTime<Utc>,
    reason: String,
}

type Issuance = Shared<BoxFuture<'static, Result<Arc<CertificateRecord>, IssueError>>>;

pub struct CertificateManager {
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<ConfigStore>,
    settings: CertificateSettings,
    certificates: DashMap<String, Arc<CertificateRecord>>,
    in_flight: Mutex<HashMap<String, Issuance>>,
    failures: DashMap<String, Failure>,
}

impl CertificateManager {
    /// Create a manager and load every usable certificate from the cache
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        store: Arc<ConfigStore>,
        settings: CertificateSettings,
    ) -> Arc<Self> {
        let certificates = DashMap::new();
        for record in CertificateRecord::load_all(&settings.cache_dir) {
            certificates.insert(record.hostname.clone(), Arc::new(record));
        }
        info!(
            cache_dir = %settings.cache_dir.display(),
            cached = certificates.len(),
            "Certificate manager initialized"
        );

        Arc::new(Self {
            issuer,
            store,
            settings,
            certificates,
            in_flight: Mutex::new(HashMap::new()),
            failures: DashMap::new(),
        })
    }

    fn renew_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.renew_before).unwrap_or(chrono::Duration::days(30))
    }

    /// Certificate to present for `sni`, issuing one on first use
    pub async fn certificate_for(
        self: &Arc<Self>,
        sni: &str,
    ) -> Result<Arc<CertificateRecord>, IssueError> {
        let hostname = normalize_host(sni);
        if !is_valid_hostname(&hostname) || !self.store.snapshot().allows_certificate(&hostname) {
            debug!(sni = %sni, "Refusing certificate for unconfigured hostname");
            return Err(IssueError::NotAllowed(hostname));
        }

        let cached = self.certificates.get(&hostname).map(|r| Arc::clone(r.value()));
        if let Some(record) = cached {
            if !record.needs_renewal(self.renew_window()) {
                return Ok(record);
            }
            if !record.is_expired() {
                // Keep serving the current certificate while renewing
                debug!(hostname = %hostname, expiry = %record.expiry, "Certificate inside renewal window");
                let _ = self.issuance(&hostname);
                return Ok(record);
            }
            info!(hostname = %hostname, expiry = %record.expiry, "Cached certificate expired");
        }

        self.issuance(&hostname).await
    }

    /// The single in-flight issuance for `hostname`, started if needed. The
    /// work runs on its own task, so it completes even if every waiter
    /// goes away.
    fn issuance(self: &Arc<Self>, hostname: &str) -> Issuance {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(hostname) {
            debug!(hostname = %hostname, "Joining in-flight issuance");
            return existing.clone();
        }

        let manager = Arc::clone(self);
        let host = hostname.to_string();
        let task = tokio::spawn(async move { manager.issue(host).await });

        let failed_host = hostname.to_string();
        let issuance = async move {
            task.await.map_err(|e| IssueError::Failed {
                host: failed_host,
                reason: format!("issuance task failed: {}", e),
            })?
        }
        .boxed()
        .shared();

        in_flight.insert(hostname.to_string(), issuance.clone());
        issuance
    }

    async fn issue(self: Arc<Self>, hostname: String) -> Result<Arc<CertificateRecord>, IssueError> {
        let started = Instant::now();
        let renewing = self.certificates.contains_key(&hostname);
        info!(hostname = %hostname, renewing, "Issuing certificate");

        let result = match self.issuer.issue(&hostname).await {
            Ok(issued) => CertificateRecord::from_pem(
                &hostname,
                &issued.cert_chain_pem,
                &issued.private_key_pem,
            )
            .map(Arc::new),
            Err(e) => Err(IssueError::Failed {
                host: hostname.clone(),
                reason: format!("{:#}", e),
            }),
        };

        match &result {
            Ok(record) => {
                if let Err(e) = record.save(&self.settings.cache_dir) {
                    error!(hostname = %hostname, error = %e, "Failed to persist certificate");
                }
                self.certificates.insert(hostname.clone(), Arc::clone(record));
                self.failures.remove(&hostname);
                info!(
                    hostname = %hostname,
                    expiry = %record.expiry,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Certificate ready"
                );
            }
            Err(e) => {
                warn!(hostname = %hostname, error = %e, renewing, "Certificate issuance failed");
                self.failures.insert(
                    hostname.clone(),
                    Failure {
                        at: Utc::now(),
                        reason: e.to_string(),
                    },
                );
            }
        }

        self.in_flight.lock().remove(&hostname);
        result
    }

    pub fn state(&self, hostname: &str) -> CertificateState {
        let hostname = normalize_host(hostname);
        let issuing = self.in_flight.lock().contains_key(&hostname);
        let cached = self.certificates.get(&hostname).map(|r| r.is_expired());
        match (issuing, cached) {
            (true, Some(false)) => CertificateState::Renewing,
            (true, _) => CertificateState::Issuing,
            (false, Some(false)) => CertificateState::Valid,
            (false, _) if self.failures.contains_key(&hostname) => CertificateState::Failed,
            (false, _) => CertificateState::Unissued,
        }
    }

    /// Status of every configured hostname and every cached certificate
    pub fn statuses(&self) -> Vec<CertificateStatus> {
        let routing = self.store.snapshot();
        let mut hostnames: BTreeSet<String> = routing.hosts().map(String::from).collect();
        hostnames.extend(self.certificates.iter().map(|r| r.key().clone()));

        hostnames
            .into_iter()
            .map(|hostname| CertificateStatus {
                state: self.state(&hostname),
                expires_at: self.certificates.get(&hostname).map(|r| r.expiry),
                last_error: self.failures.get(&hostname).map(|f| {
                    format!("{} ({})", f.reason, f.at.to_rfc3339())
                }),
                hostname,
            })
            .collect()
    }

    /// Renew every cached, still-configured certificate inside the window.
    /// Returns the number of renewals attempted.
    pub async fn renew_due(self: &Arc<Self>) -> usize {
        let routing = self.store.snapshot();
        let window = self.renew_window();
        let due: Vec<String> = self
            .certificates
            .iter()
            .filter(|r| r.needs_renewal(window) && routing.allows_certificate(r.key()))
            .map(|r| r.key().clone())
            .collect();

        if due.is_empty() {
            debug!("No certificates due for renewal");
            return 0;
        }

        info!(count = due.len(), "Renewing certificates");
        let renewals: Vec<Issuance> = due.iter().map(|h| self.issuance(h)).collect();
        for (hostname, result) in due.iter().zip(futures::future::join_all(renewals).await) {
            if let Err(e) = result {
                warn!(hostname = %hostname, error = %e, "Renewal failed, keeping current certificate");
            }
        }
        due.len()
    }

    /// Periodic renewal check until shutdown
    pub async fn run_renewals(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.renew_due().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate renewal loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
