//! Per-service mapping lifecycle.
//!
//! [`MappingManager`] owns the table of mappings believed to exist on the
//! router for each service and replaces them wholesale on every apply.
//!
//! Locking: the table sits behind a synchronous `RwLock` that is only taken
//! to snapshot or to commit, never across a device call. Calls for the same
//! service are serialized by a per-service async mutex held for the whole
//! snapshot / I/O / commit sequence, so they reach the table in call order
//! while other services proceed independently.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::upnp::{IgdClient, MappingError, PortMapping, Protocol};

/// Stable identity of a load-balancer service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid service key {0:?} (expected namespace/name)")]
pub struct InvalidServiceKey(pub String);

impl FromStr for ServiceKey {
    type Err = InvalidServiceKey;

    /// `namespace/name`, or a bare `name` in the empty namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = match s.split('/').collect::<Vec<_>>().as_slice() {
            [name] => ("", *name),
            [namespace, name] => (*namespace, *name),
            _ => return Err(InvalidServiceKey(s.to_string())),
        };
        if name.is_empty() {
            return Err(InvalidServiceKey(s.to_string()));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Callback fired when a service's forwarding status changed
pub type StatusNotifier = Arc<dyn Fn(&ServiceKey) + Send + Sync>;

/// What the manager believes is on the router for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub mappings: Vec<PortMapping>,
    /// When the mappings were committed
    pub updated_at: DateTime<Utc>,
}

/// Result of one [`MappingManager::apply`]
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Mappings confirmed created, now recorded for the service
    pub created: Vec<PortMapping>,
    /// Desired mappings that were not attempted, with the reason
    pub skipped: Vec<(PortMapping, String)>,
    /// Desired mappings the device refused or never answered for
    pub failed: Vec<(PortMapping, MappingError)>,
    /// Previously recorded mappings whose deletion failed
    pub stale: Vec<(PortMapping, MappingError)>,
}

/// Result of one [`MappingManager::remove`]
#[derive(Debug, Default)]
pub struct RemoveReport {
    /// Mappings whose deletion was attempted
    pub attempted: Vec<PortMapping>,
    /// Subset of `attempted` whose deletion failed
    pub failed: Vec<(PortMapping, MappingError)>,
}

/// Mapping Lifecycle Manager.
pub struct MappingManager {
    client: Arc<IgdClient>,
    records: RwLock<HashMap<ServiceKey, ServiceRecord>>,
    key_locks: Mutex<HashMap<ServiceKey, Arc<AsyncMutex<()>>>>,
    notify: StatusNotifier,
}

impl MappingManager {
    pub fn new(client: Arc<IgdClient>, notify: StatusNotifier) -> Self {
        Self {
            client,
            records: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            notify,
        }
    }

    pub fn client(&self) -> &Arc<IgdClient> {
        &self.client
    }

    /// Mappings currently recorded for `key`
    pub fn mappings(&self, key: &ServiceKey) -> Vec<PortMapping> {
        self.records
            .read()
            .get(key)
            .map(|record| record.mappings.clone())
            .unwrap_or_default()
    }

    /// Recorded mappings of `key` together with their commit time
    pub fn record(&self, key: &ServiceKey) -> Option<ServiceRecord> {
        self.records.read().get(key).cloned()
    }

    /// Services with at least one recorded mapping, sorted
    pub fn services(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<_> = self.records.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Replace the mappings of `key` with `desired`.
    ///
    /// Every previously recorded mapping is deleted first, best-effort. Each
    /// desired mapping is then created independently: a port of 0 or an
    /// unsupported protocol is skipped, a failed creation is left out of the
    /// record without stopping the rest. The record ends up holding exactly
    /// the mappings that were created.
    pub async fn apply(&self, key: &ServiceKey, desired: Vec<PortMapping>) -> ApplyReport {
        let lock = self.key_lock(key);
        let guard = lock.lock().await;

        let previous = self.mappings(key);
        let mut report = ApplyReport {
            stale: self.delete_all(key, &previous).await,
            ..ApplyReport::default()
        };

        for mapping in desired {
            if mapping.external_port == 0 {
                tracing::warn!(service = %key, %mapping, "skipping mapping without a port");
                report.skipped.push((mapping, "port is 0".to_string()));
                continue;
            }
            if let Err(e) = mapping.protocol() {
                tracing::warn!(service = %key, %mapping, "unsupported protocol for UPnP");
                report.skipped.push((mapping, e.to_string()));
                continue;
            }

            match self.client.add_mapping(&mapping).await {
                Ok(()) => {
                    tracing::info!(service = %key, %mapping, "created UPnP port mapping");
                    report.created.push(mapping);
                }
                Err(e) => {
                    tracing::error!(service = %key, %mapping, error = %e, "failed to add UPnP port mapping");
                    report.failed.push((mapping, e));
                }
            }
        }

        {
            let mut records = self.records.write();
            if report.created.is_empty() {
                records.remove(key);
            } else {
                records.insert(
                    key.clone(),
                    ServiceRecord {
                        mappings: report.created.clone(),
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        drop(guard);
        self.release_key_lock(key, lock);

        if !report.created.is_empty() {
            (self.notify)(key);
        }
        report
    }

    /// Delete every recorded mapping of `key` and forget the service.
    ///
    /// The record is cleared and the status notification fires even when
    /// some deletions failed.
    pub async fn remove(&self, key: &ServiceKey, reason: &str) -> RemoveReport {
        let lock = self.key_lock(key);
        let guard = lock.lock().await;

        let attempted = self.mappings(key);
        let failed = self.delete_all(key, &attempted).await;
        self.records.write().remove(key);

        drop(guard);
        self.release_key_lock(key, lock);

        tracing::info!(
            service = %key,
            reason,
            deleted = attempted.len() - failed.len(),
            failed = failed.len(),
            "removed UPnP port mappings"
        );
        (self.notify)(key);

        RemoveReport { attempted, failed }
    }

    /// Delete router mappings that carry our description prefix but are not
    /// recorded by this process, e.g. leftovers from before a restart.
    ///
    /// Meant to run once before reconciliation starts; mappings created by
    /// concurrent applies are not visible to the snapshot taken here.
    pub async fn sweep_orphans(&self, description_prefix: &str) -> Result<Vec<PortMapping>, MappingError> {
        let present = self.client.enumerate_mappings().await?;

        let recorded: HashSet<(u16, Protocol)> = self
            .records
            .read()
            .values()
            .flat_map(|record| record.mappings.iter())
            .filter_map(|m| m.protocol().ok().map(|p| (m.external_port, p)))
            .collect();

        let mut swept = Vec::new();
        for mapping in present {
            let Ok(protocol) = mapping.protocol() else { continue };
            if !mapping.description.starts_with(description_prefix)
                || recorded.contains(&(mapping.external_port, protocol))
            {
                continue;
            }

            match self.client.delete_mapping(mapping.external_port, &mapping.protocol).await {
                Ok(()) => {
                    tracing::info!(%mapping, description = %mapping.description, "deleted orphaned UPnP port mapping");
                    swept.push(mapping);
                }
                Err(e) => {
                    tracing::warn!(%mapping, error = %e, "failed to delete orphaned UPnP port mapping");
                }
            }
        }

        Ok(swept)
    }

    async fn delete_all(&self, key: &ServiceKey, mappings: &[PortMapping]) -> Vec<(PortMapping, MappingError)> {
        let mut failed = Vec::new();
        for mapping in mappings {
            if let Err(e) = self.client.delete_mapping(mapping.external_port, &mapping.protocol).await {
                tracing::warn!(service = %key, %mapping, error = %e, "failed to delete UPnP port mapping");
                failed.push((mapping.clone(), e));
            }
        }
        failed
    }

    fn key_lock(&self, key: &ServiceKey) -> Arc<AsyncMutex<()>> {
        self.key_locks.lock().entry(key.clone()).or_default().clone()
    }

    /// Drop the per-service lock once nobody else holds or waits on it.
    fn release_key_lock(&self, key: &ServiceKey, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.key_locks.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
