//! UPnP Internet Gateway Device control.
//!
//! Discovery ([`discover`]) locates a gateway and negotiates IGDv2 or IGDv1;
//! [`IgdClient`] then drives the gateway's port-mapping table through the
//! [`IgdControl`] transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub mod client;
pub mod device;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod soap;

pub use client::{ClientOptions, DeviceInfo, IgdClient};
pub use device::{GatewayDevice, IgdVersion};
pub use discovery::{discover, discover_with, DiscoveryOptions, NetworkSsdp, SsdpTransport};
pub use error::{
    ActionError, DiscoveryError, MappingError, ProtocolFault, TransportError, UpnpErrorCode, ValidationError,
};
pub use memory::MemoryGateway;
pub use soap::{AddPortMappingRequest, GenericPortMappingEntry, IgdControl, SoapControl};

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    /// Wire spelling used in SOAP arguments
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    /// Case-insensitive; anything other than tcp/udp is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(ValidationError::InvalidProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single router port forward.
///
/// The protocol is kept as given by the caller and validated by the client
/// before any device call, so malformed input from upstream configuration is
/// rejected locally instead of at the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub internal_address: IpAddr,
    pub protocol: String,
    pub description: String,
    /// Requested lease in seconds, 0 for a permanent mapping
    pub lease_seconds: u32,
}

impl PortMapping {
    pub fn new(
        external_port: u16,
        internal_port: u16,
        internal_address: IpAddr,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            external_port,
            internal_port,
            internal_address,
            protocol: protocol.into(),
            description: String::new(),
            lease_seconds: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_lease(mut self, lease_seconds: u32) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    /// Parsed protocol, or the validation error for an unsupported value
    pub fn protocol(&self) -> Result<Protocol, ValidationError> {
        self.protocol.parse()
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> {}:{}",
            self.external_port, self.protocol, self.internal_address, self.internal_port
        )
    }
}
