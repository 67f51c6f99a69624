//! Reconcile adapter.
//!
//! Translates "service appeared / changed / removed" calls from the owning
//! reconciliation loop into [`MappingManager`] operations, gated by the pool
//! election in [`crate::election`].

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::election::{self, NodeState, Pool};
use crate::mapping::{ApplyReport, MappingManager, RemoveReport, ServiceKey, StatusNotifier};
use crate::upnp::{discover, DiscoveryError, IgdClient, PortMapping};

pub const REASON_MAPPING_FAILED: &str = "UPnPMappingFailed";
pub const REASON_MAPPING_CREATED: &str = "UPnPMappingCreated";

/// Sink for user-visible events attached to a service
pub trait EventRecorder: Send + Sync {
    fn normal(&self, service: &ServiceKey, reason: &str, message: &str);
    fn warning(&self, service: &ServiceKey, reason: &str, message: &str);
}

/// Writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl EventRecorder for TracingEvents {
    fn normal(&self, service: &ServiceKey, reason: &str, message: &str) {
        tracing::info!(service = %service, reason, "{}", message);
    }

    fn warning(&self, service: &ServiceKey, reason: &str, message: &str) {
        tracing::warn!(service = %service, reason, "{}", message);
    }
}

/// One port exposed by a load-balancer service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    /// `TCP` or `UDP`, any case; other values are skipped at apply time
    pub protocol: String,
}

impl ServicePort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: "TCP".to_string(),
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: "UDP".to_string(),
        }
    }
}

/// What the reconciliation loop knows about a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// The service asked for UPnP forwarding
    pub upnp_enabled: bool,
    /// Address pool the service's addresses come from
    pub pool: String,
    pub has_active_endpoints: bool,
    /// Overrides the advertisement and default description base
    pub description: Option<String>,
    /// Overrides the advertisement lease
    pub lease_seconds: Option<u32>,
    pub ports: Vec<ServicePort>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            upnp_enabled: false,
            pool: String::new(),
            has_active_endpoints: true,
            description: None,
            lease_seconds: None,
            ports: Vec::new(),
        }
    }
}

/// Why the local node must leave a service alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotOwnerReason {
    UpnpNotRequested,
    PoolWithoutUpnp,
    NoActiveEndpoints,
    NodeNotAdvertised,
    NoEligibleNodes,
    ElectedElsewhere(String),
}

impl fmt::Display for NotOwnerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpnpNotRequested => write!(f, "service did not request UPnP"),
            Self::PoolWithoutUpnp => write!(f, "pool has no UPnP advertisement"),
            Self::NoActiveEndpoints => write!(f, "service has no active endpoints"),
            Self::NodeNotAdvertised => write!(f, "local node is not in any enabled advertisement"),
            Self::NoEligibleNodes => write!(f, "no eligible node for the pool"),
            Self::ElectedElsewhere(owner) => write!(f, "{owner} is the elected owner"),
        }
    }
}

/// Ownership verdict for one service on the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Owner,
    NotOwner(NotOwnerReason),
}

impl Verdict {
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Every mapping the service asked for was refused by the device
    #[error("all {failed} UPnP port mapping(s) failed for {service}")]
    AllMappingsFailed { service: ServiceKey, failed: usize },
}

/// One forwarded port as published in the service status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_address: IpAddr,
    pub protocol: String,
    pub description: String,
    pub lease_seconds: u32,
}

impl From<&PortMapping> for StatusPortMapping {
    fn from(m: &PortMapping) -> Self {
        Self {
            external_port: m.external_port,
            internal_port: m.internal_port,
            internal_address: m.internal_address,
            protocol: m.protocol.to_uppercase(),
            description: m.description.clone(),
            lease_seconds: m.lease_seconds,
        }
    }
}

/// UPnP section of a service's published status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpnpStatus {
    pub external_ip: Option<IpAddr>,
    /// Node that created the mappings
    pub node: String,
    pub port_mappings: Vec<StatusPortMapping>,
    pub updated_at: DateTime<Utc>,
}

/// Reconcile adapter for one node
pub struct UpnpController {
    my_node: String,
    manager: MappingManager,
    pools: RwLock<HashMap<String, Pool>>,
    events: Arc<dyn EventRecorder>,
    default_description: String,
}

impl UpnpController {
    pub fn new(
        my_node: impl Into<String>,
        client: Arc<IgdClient>,
        config: &Config,
        events: Arc<dyn EventRecorder>,
        notify: StatusNotifier,
    ) -> Self {
        Self {
            my_node: my_node.into(),
            manager: MappingManager::new(client, notify),
            pools: RwLock::new(HashMap::new()),
            events,
            default_description: config.default_description.clone(),
        }
    }

    /// Discover a gateway and build a controller around it.
    ///
    /// A [`DiscoveryError`] only means UPnP is unavailable on this node; the
    /// caller is expected to carry on without a controller. Orphan sweeping
    /// needs pool and node snapshots, so it is left to the caller
    /// ([`UpnpController::sweep_orphans`]) once pools are configured.
    pub async fn start(
        my_node: impl Into<String>,
        config: &Config,
        events: Arc<dyn EventRecorder>,
        notify: StatusNotifier,
    ) -> Result<Self, DiscoveryError> {
        let device = discover(&config.discovery_options()).await?;
        let client = IgdClient::connect(device, config.client_options()).await?;
        Ok(Self::new(my_node, Arc::new(client), config, events, notify))
    }

    pub fn node(&self) -> &str {
        &self.my_node
    }

    pub fn client(&self) -> &Arc<IgdClient> {
        self.manager.client()
    }

    pub fn manager(&self) -> &MappingManager {
        &self.manager
    }

    /// Replace the known pool configuration
    pub fn set_pool_config(&self, pools: impl IntoIterator<Item = Pool>) {
        let pools: HashMap<String, Pool> = pools.into_iter().map(|p| (p.name.clone(), p)).collect();
        tracing::debug!(pools = pools.len(), "updated pool configuration");
        *self.pools.write() = pools;
    }

    pub fn pool(&self, name: &str) -> Option<Pool> {
        self.pools.read().get(name).cloned()
    }

    /// Decide whether the local node should forward ports for `service`.
    ///
    /// Gates, in order: the service asked for UPnP, the pool advertises it,
    /// the service has active endpoints, the local node is named by an
    /// enabled advertisement, and the local node wins the pool election.
    pub fn should_handle(&self, key: &ServiceKey, service: &ServiceSpec, pool: &Pool, nodes: &[NodeState]) -> Verdict {
        let verdict = self.verdict(service, pool, nodes);
        match &verdict {
            Verdict::Owner => tracing::debug!(service = %key, pool = %pool.name, "local node owns service"),
            Verdict::NotOwner(reason) => {
                tracing::debug!(service = %key, pool = %pool.name, %reason, "local node does not own service")
            }
        }
        verdict
    }

    fn verdict(&self, service: &ServiceSpec, pool: &Pool, nodes: &[NodeState]) -> Verdict {
        if !service.upnp_enabled {
            return Verdict::NotOwner(NotOwnerReason::UpnpNotRequested);
        }
        if !pool.supports_upnp() {
            return Verdict::NotOwner(NotOwnerReason::PoolWithoutUpnp);
        }
        if !service.has_active_endpoints {
            return Verdict::NotOwner(NotOwnerReason::NoActiveEndpoints);
        }
        if pool.advertisement_for(&self.my_node).is_none() {
            return Verdict::NotOwner(NotOwnerReason::NodeNotAdvertised);
        }

        match election::elect_owner(&pool.advertisements, nodes) {
            Some(owner) if owner == self.my_node => Verdict::Owner,
            Some(owner) => Verdict::NotOwner(NotOwnerReason::ElectedElsewhere(owner)),
            None => Verdict::NotOwner(NotOwnerReason::NoEligibleNodes),
        }
    }

    /// Mappings the service should have: one per (target address, port).
    pub fn desired_mappings(&self, key: &ServiceKey, service: &ServiceSpec, targets: &[IpAddr]) -> Vec<PortMapping> {
        let pools = self.pools.read();
        let advertisement = pools
            .get(&service.pool)
            .and_then(|pool| pool.advertisement_for(&self.my_node));

        let base = service
            .description
            .as_deref()
            .filter(|d| !d.is_empty())
            .or_else(|| advertisement.and_then(|a| a.description.as_deref()).filter(|d| !d.is_empty()))
            .unwrap_or(self.default_description.as_str());
        let lease = service
            .lease_seconds
            .or_else(|| advertisement.map(|a| a.lease_seconds))
            .unwrap_or(0);

        targets
            .iter()
            .flat_map(|address| {
                service.ports.iter().map(move |port| {
                    PortMapping::new(port.port, port.port, *address, port.protocol.clone())
                        .with_description(format!("{} ({}:{})", base, key.name, port.port))
                        .with_lease(lease)
                })
            })
            .collect()
    }

    /// Create the service's port mappings on the gateway, replacing any it had.
    ///
    /// Per-port failures become warning events. Succeeds when at least one
    /// mapping was created or nothing could be attempted.
    pub async fn apply_balancer(
        &self,
        key: &ServiceKey,
        service: &ServiceSpec,
        targets: &[IpAddr],
    ) -> Result<ApplyReport, ControllerError> {
        if !service.upnp_enabled {
            tracing::debug!(service = %key, "UPnP not requested, leaving service alone");
            return Ok(ApplyReport::default());
        }

        let desired = self.desired_mappings(key, service, targets);
        tracing::info!(service = %key, desired = desired.len(), "applying UPnP port mappings");

        let report = self.manager.apply(key, desired).await;

        for (mapping, error) in &report.failed {
            self.events.warning(
                key,
                REASON_MAPPING_FAILED,
                &format!(
                    "Failed to create UPnP port mapping for port {}/{}: {}",
                    mapping.external_port,
                    mapping.protocol.to_uppercase(),
                    error
                ),
            );
        }

        if !report.created.is_empty() {
            let external_ip = self
                .client()
                .external_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.events.normal(
                key,
                REASON_MAPPING_CREATED,
                &format!(
                    "Created {} UPnP port mapping(s) with external IP {}",
                    report.created.len(),
                    external_ip
                ),
            );
        }

        if report.created.is_empty() && !report.failed.is_empty() {
            return Err(ControllerError::AllMappingsFailed {
                service: key.clone(),
                failed: report.failed.len(),
            });
        }

        Ok(report)
    }

    /// Delete every mapping of the service. The service is forgotten even
    /// when some deletions failed.
    pub async fn delete_balancer(&self, key: &ServiceKey, reason: &str) -> RemoveReport {
        self.manager.remove(key, reason).await
    }

    /// Published UPnP status, or `None` when the service has no mappings
    pub fn status(&self, key: &ServiceKey) -> Option<ServiceUpnpStatus> {
        let record = self.manager.record(key)?;
        Some(ServiceUpnpStatus {
            external_ip: self.client().external_ip(),
            node: self.my_node.clone(),
            port_mappings: record.mappings.iter().map(StatusPortMapping::from).collect(),
            updated_at: record.updated_at,
        })
    }

    /// Remove leftovers carrying our default description from earlier runs.
    ///
    /// Router descriptions do not say which pool created a mapping, so only
    /// a node that is the elected owner of every UPnP pool in `nodes` may
    /// sweep; anywhere else the mappings may be another owner's live ones.
    pub async fn sweep_orphans(&self, nodes: &[NodeState]) -> Vec<PortMapping> {
        let pools: Vec<Pool> = self
            .pools
            .read()
            .values()
            .filter(|pool| pool.supports_upnp())
            .cloned()
            .collect();

        if pools.is_empty() {
            tracing::debug!("no UPnP pools configured, skipping orphan sweep");
            return Vec::new();
        }
        if let Some(pool) = pools
            .iter()
            .find(|pool| !election::is_owner(&self.my_node, &pool.advertisements, nodes))
        {
            tracing::info!(pool = %pool.name, "not the elected owner, skipping orphan sweep");
            return Vec::new();
        }

        match self.manager.sweep_orphans(&self.default_description).await {
            Ok(swept) => {
                tracing::info!(count = swept.len(), "orphan sweep finished");
                swept
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to sweep orphaned UPnP port mappings");
                Vec::new()
            }
        }
    }
}
