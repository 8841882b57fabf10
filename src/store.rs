//! Atomically swappable routing configuration
//!
//! Readers take a snapshot with [`ConfigStore::snapshot`] at request start and
//! keep it for the whole request. A reload builds a complete new
//! [`RoutingConfig`] first and then swaps the pointer, so readers never see a
//! half-built snapshot and never block on a reload.

use crate::config::{Config, ConfigError, RoutingConfig};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What to do with a reload requested while another one is running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReloadPolicy {
    /// Wait for the running reload, then reload again
    #[default]
    Queue,
    /// Return immediately without reloading
    Skip,
}

/// Result of a reload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new snapshot is active
    Reloaded { hosts: usize, users: usize },
    /// Another reload was running and the policy is [`ReloadPolicy::Skip`]
    Skipped,
}

pub struct ConfigStore {
    current: ArcSwap<RoutingConfig>,
    source: Option<PathBuf>,
    policy: ReloadPolicy,
    reload_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store with no file to reload from
    pub fn new(initial: RoutingConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            source: None,
            policy: ReloadPolicy::default(),
            reload_lock: Mutex::new(()),
        }
    }

    /// Create a store that reloads from `path`
    pub fn with_source(initial: RoutingConfig, path: impl AsRef<Path>) -> Self {
        Self {
            source: Some(path.as_ref().to_path_buf()),
            ..Self::new(initial)
        }
    }

    pub fn with_policy(mut self, policy: ReloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.current.load_full()
    }

    /// Swap in an already-built snapshot
    pub fn replace(&self, routing: RoutingConfig) {
        self.current.store(Arc::new(routing));
    }

    /// Re-read the source file and swap the new snapshot in. On error the
    /// previous snapshot stays active.
    pub async fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let path = self.source.as_ref().ok_or(ConfigError::NoSource)?;

        let _guard = match self.policy {
            ReloadPolicy::Queue => self.reload_lock.lock().await,
            ReloadPolicy::Skip => match self.reload_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    info!(path = %path.display(), "Reload already in progress, skipping");
                    return Ok(ReloadOutcome::Skipped);
                }
            },
        };

        let path_owned = path.clone();
        let routing = tokio::task::spawn_blocking(move || {
            Config::load_compiled(&path_owned).map(|(_, routing)| routing)
        })
        .await
        .map_err(|e| ConfigError::Invalid(vec![format!("reload task failed: {}", e)]))?;

        let routing = match routing {
            Ok(routing) => routing,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Reload failed, keeping current configuration");
                return Err(e);
            }
        };

        let outcome = ReloadOutcome::Reloaded {
            hosts: routing.subdomains.len(),
            users: routing.users.len(),
        };
        self.replace(routing);
        info!(path = %path.display(), ?outcome, "Configuration reloaded");
        Ok(outcome)
    }
}
