use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::timeout;

use super::device::{GatewayDevice, IgdVersion};
use super::error::{ActionError, MappingError, TransportError, ValidationError};
use super::soap::{AddPortMappingRequest, IgdControl, SoapControl};
use super::{PortMapping, Protocol};

/// Limits applied to every device interaction
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upper bound for a single control action, including the HTTP round trip
    pub action_timeout: Duration,

    /// Maximum number of `GetGenericPortMappingEntry` calls per enumeration
    pub max_enumeration_entries: u16,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(5),
            max_enumeration_entries: 1000,
        }
    }
}

/// Snapshot of the selected gateway for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub version: IgdVersion,
    pub location: String,
    pub control_url: String,
    pub external_ip: Option<IpAddr>,
}

/// Protocol client for one discovered gateway.
///
/// The device and its protocol version are fixed at construction. Only the
/// cached external address changes afterwards, and only through
/// [`IgdClient::refresh_external_ip`].
pub struct IgdClient {
    device: GatewayDevice,
    control: Arc<dyn IgdControl>,
    options: ClientOptions,
    external_ip: RwLock<Option<IpAddr>>,
}

impl IgdClient {
    /// Build a client over an arbitrary control transport.
    ///
    /// The external address is queried once; a failure is logged and leaves
    /// the cache empty, it never fails construction.
    pub async fn new(device: GatewayDevice, control: Arc<dyn IgdControl>, options: ClientOptions) -> Self {
        let client = Self {
            device,
            control,
            options,
            external_ip: RwLock::new(None),
        };

        if let Err(e) = client.refresh_external_ip().await {
            tracing::warn!(error = %e, "failed to get external IP address");
        }

        client
    }

    /// Build a client speaking SOAP over HTTP to `device`.
    pub async fn connect(device: GatewayDevice, options: ClientOptions) -> Result<Self, TransportError> {
        let control = SoapControl::new(&device, options.action_timeout)?;
        Ok(Self::new(device, Arc::new(control), options).await)
    }

    pub fn device(&self) -> &GatewayDevice {
        &self.device
    }

    /// Cached external address, if it was ever retrieved
    pub fn external_ip(&self) -> Option<IpAddr> {
        *self.external_ip.read()
    }

    /// A constructed client always has a negotiated device.
    pub fn is_available(&self) -> bool {
        !self.device.control_url.is_empty()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            version: self.device.version,
            location: self.device.location.clone(),
            control_url: self.device.control_url.clone(),
            external_ip: self.external_ip(),
        }
    }

    /// Re-query the external address and replace the cache.
    pub async fn refresh_external_ip(&self) -> Result<IpAddr, MappingError> {
        let raw = self
            .call("GetExternalIPAddress", self.control.get_external_ip_address())
            .await?;

        let ip: IpAddr = raw.trim().parse().map_err(|_| MappingError::InvalidResponse {
            field: "NewExternalIPAddress",
            value: raw.clone(),
        })?;

        *self.external_ip.write() = Some(ip);
        tracing::info!(ip = %ip, "retrieved external IP address");
        Ok(ip)
    }

    /// Create `mapping` on the gateway. Not retried.
    pub async fn add_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError> {
        let protocol = mapping.protocol()?;
        if mapping.internal_address.is_unspecified() {
            return Err(ValidationError::InvalidMapping(format!(
                "internal address {} is unspecified",
                mapping.internal_address
            ))
            .into());
        }

        tracing::debug!(
            external_port = mapping.external_port,
            internal_ip = %mapping.internal_address,
            internal_port = mapping.internal_port,
            %protocol,
            description = %mapping.description,
            lease_seconds = mapping.lease_seconds,
            "adding port mapping"
        );

        let request = AddPortMappingRequest {
            external_port: mapping.external_port,
            protocol,
            internal_port: mapping.internal_port,
            internal_client: mapping.internal_address.to_string(),
            enabled: true,
            description: mapping.description.clone(),
            lease_duration: mapping.lease_seconds,
        };
        self.call("AddPortMapping", self.control.add_port_mapping(&request))
            .await?;

        tracing::info!(
            external_port = mapping.external_port,
            internal_ip = %mapping.internal_address,
            internal_port = mapping.internal_port,
            %protocol,
            "added port mapping"
        );
        Ok(())
    }

    /// Remove the mapping for (`external_port`, `protocol`).
    ///
    /// A "no such entry" fault counts as success.
    pub async fn delete_mapping(&self, external_port: u16, protocol: &str) -> Result<(), MappingError> {
        let protocol: Protocol = protocol.parse()?;

        tracing::debug!(external_port, %protocol, "deleting port mapping");

        match self
            .call("DeletePortMapping", self.control.delete_port_mapping(external_port, protocol))
            .await
        {
            Ok(()) => {
                tracing::info!(external_port, %protocol, "deleted port mapping");
                Ok(())
            }
            Err(e) if e.fault().is_some_and(|f| f.is_no_such_entry()) => {
                tracing::debug!(external_port, %protocol, "port mapping does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Walk the gateway's mapping table by index.
    ///
    /// Stops at the end-of-table fault or after `max_enumeration_entries`
    /// queries. Disabled entries and entries with an unparseable client or
    /// protocol are skipped; order is the device's own.
    pub async fn enumerate_mappings(&self) -> Result<Vec<PortMapping>, MappingError> {
        let mut mappings = Vec::new();
        let bound = self.options.max_enumeration_entries;
        let mut exhausted = false;

        for index in 0..bound {
            let entry = match self
                .call(
                    "GetGenericPortMappingEntry",
                    self.control.get_generic_port_mapping_entry(index),
                )
                .await
            {
                Ok(entry) => entry,
                Err(e) if e.fault().is_some_and(|f| f.is_array_index_invalid() || f.is_no_such_entry()) => {
                    exhausted = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            if !entry.enabled {
                continue;
            }

            let Ok(internal_address) = entry.internal_client.trim().parse::<IpAddr>() else {
                tracing::debug!(index, client = %entry.internal_client, "skipping entry with unparseable internal client");
                continue;
            };
            let Ok(protocol) = entry.protocol.parse::<Protocol>() else {
                tracing::debug!(index, protocol = %entry.protocol, "skipping entry with unsupported protocol");
                continue;
            };

            mappings.push(PortMapping {
                external_port: entry.external_port,
                internal_port: entry.internal_port,
                internal_address,
                protocol: protocol.as_str().to_string(),
                description: entry.description,
                lease_seconds: entry.lease_duration,
            });
        }

        if !exhausted {
            tracing::warn!(bound, "port mapping enumeration stopped at safety bound");
        }

        tracing::debug!(count = mappings.len(), "retrieved port mappings");
        Ok(mappings)
    }

    async fn call<T>(
        &self,
        action: &'static str,
        fut: impl Future<Output = Result<T, ActionError>>,
    ) -> Result<T, MappingError> {
        match timeout(self.options.action_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(MappingError::action(action, e)),
            Err(_) => Err(MappingError::Timeout {
                action,
                timeout: self.options.action_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upnp::error::UpnpErrorCode;
    use crate::upnp::memory::MemoryGateway;

    fn device() -> GatewayDevice {
        GatewayDevice::new(
            IgdVersion::V2,
            "http://192.168.1.1:5000/rootDesc.xml",
            "http://192.168.1.1:5000/ctl/IPConn",
        )
    }

    async fn client_with(gateway: Arc<MemoryGateway>, options: ClientOptions) -> IgdClient {
        IgdClient::new(device(), gateway, options).await
    }

    fn web(port: u16, protocol: &str) -> PortMapping {
        PortMapping::new(port, port, "192.168.1.100".parse().unwrap(), protocol).with_description("Test")
    }

    #[tokio::test]
    async fn test_external_ip_cached_at_construction() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway, ClientOptions::default()).await;

        assert_eq!(client.external_ip(), Some("203.0.113.7".parse().unwrap()));
        assert!(client.is_available());
        assert_eq!(client.device_info().version, IgdVersion::V2);
    }

    #[tokio::test]
    async fn test_external_ip_failure_is_not_fatal() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        gateway.fail_external_ip(true);
        let client = client_with(gateway.clone(), ClientOptions::default()).await;
        assert_eq!(client.external_ip(), None);

        // Mapping operations still work without a known address.
        client.add_mapping(&web(80, "tcp")).await.unwrap();

        gateway.fail_external_ip(false);
        gateway.set_external_ip("198.51.100.1".parse().unwrap());
        let refreshed = client.refresh_external_ip().await.unwrap();
        assert_eq!(client.external_ip(), Some(refreshed));
    }

    #[tokio::test]
    async fn test_invalid_protocol_issues_no_call() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway.clone(), ClientOptions::default()).await;
        let calls_before = gateway.calls().len();

        let err = client.add_mapping(&web(80, "INVALID")).await.unwrap_err();
        assert!(matches!(err, MappingError::Validation(ValidationError::InvalidProtocol(_))));

        let err = client.delete_mapping(80, "sctp").await.unwrap_err();
        assert!(matches!(err, MappingError::Validation(_)));

        assert_eq!(gateway.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_add_passes_wire_arguments() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway.clone(), ClientOptions::default()).await;

        client.add_mapping(&web(8080, "udp").with_lease(3600)).await.unwrap();

        let table = gateway.table();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].external_port, 8080);
        assert_eq!(table[0].protocol, "UDP");
        assert_eq!(table[0].internal_client, "192.168.1.100");
        assert!(table[0].enabled);
        assert_eq!(table[0].lease_duration, 3600);
        assert_eq!(table[0].remote_host, "");
    }

    #[tokio::test]
    async fn test_delete_absent_mapping_is_success() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway.clone(), ClientOptions::default()).await;

        client.delete_mapping(9999, "TCP").await.unwrap();
        assert!(gateway.calls().iter().any(|c| c == "DeletePortMapping 9999/TCP"));
    }

    #[tokio::test]
    async fn test_delete_other_fault_surfaces() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway.clone(), ClientOptions::default()).await;
        gateway.fail_delete(80, UpnpErrorCode::ActionNotAuthorized.code());

        let err = client.delete_mapping(80, "tcp").await.unwrap_err();
        assert_eq!(err.fault().map(|f| f.code), Some(606));
    }

    #[tokio::test]
    async fn test_enumerate_skips_disabled_entries() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let client = client_with(gateway.clone(), ClientOptions::default()).await;

        client.add_mapping(&web(80, "tcp")).await.unwrap();
        client.add_mapping(&web(443, "tcp")).await.unwrap();
        client.add_mapping(&web(53, "udp")).await.unwrap();
        gateway.set_enabled(443, Protocol::Tcp, false);

        let mappings = client.enumerate_mappings().await.unwrap();
        let ports: Vec<_> = mappings.iter().map(|m| (m.external_port, m.protocol.as_str())).collect();
        assert_eq!(ports, vec![(80, "TCP"), (53, "UDP")]);
    }

    #[tokio::test]
    async fn test_enumerate_is_bounded() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        gateway.never_end_enumeration(true);
        let options = ClientOptions {
            max_enumeration_entries: 25,
            ..ClientOptions::default()
        };
        let client = client_with(gateway.clone(), options).await;

        let mappings = client.enumerate_mappings().await.unwrap();
        assert_eq!(mappings.len(), 25);
        let queries = gateway
            .calls()
            .iter()
            .filter(|c| c.starts_with("GetGenericPortMappingEntry"))
            .count();
        assert_eq!(queries, 25);
    }

    #[tokio::test]
    async fn test_hung_device_times_out() {
        let gateway = Arc::new(MemoryGateway::new("203.0.113.7".parse().unwrap()));
        let options = ClientOptions {
            action_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };
        let client = client_with(gateway.clone(), options).await;
        gateway.hang_actions(Some(Duration::from_secs(30)));

        let err = client.add_mapping(&web(80, "tcp")).await.unwrap_err();
        assert!(matches!(err, MappingError::Timeout { action: "AddPortMapping", .. }));
    }
}
