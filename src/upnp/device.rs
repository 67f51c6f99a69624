use serde::Serialize;
use std::fmt;

/// IGD device class revision negotiated during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IgdVersion {
    V1,
    V2,
}

impl IgdVersion {
    /// SSDP search target for the root device
    pub fn device_urn(self) -> &'static str {
        match self {
            Self::V1 => "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
            Self::V2 => "urn:schemas-upnp-org:device:InternetGatewayDevice:2",
        }
    }

    /// WANIPConnection service type controlled on that device class
    pub fn service_urn(self) -> &'static str {
        match self {
            Self::V1 => "urn:schemas-upnp-org:service:WANIPConnection:1",
            Self::V2 => "urn:schemas-upnp-org:service:WANIPConnection:2",
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for IgdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IGDv{}", self.number())
    }
}

/// A discovered gateway, fixed for the lifetime of the client built on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayDevice {
    /// Negotiated protocol revision
    pub version: IgdVersion,

    /// Description URL from the SSDP `LOCATION` header
    pub location: String,

    /// Absolute SOAP control endpoint of the WANIPConnection service
    pub control_url: String,

    /// Service type used as the SOAP action namespace
    pub service_type: String,
}

impl GatewayDevice {
    pub fn new(version: IgdVersion, location: impl Into<String>, control_url: impl Into<String>) -> Self {
        Self {
            version,
            location: location.into(),
            control_url: control_url.into(),
            service_type: version.service_urn().to_string(),
        }
    }
}

impl fmt::Display for GatewayDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} gateway at {} (control {})", self.version, self.location, self.control_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urns_follow_version() {
        assert!(IgdVersion::V2.device_urn().ends_with(":2"));
        assert!(IgdVersion::V1.service_urn().ends_with("WANIPConnection:1"));

        let device = GatewayDevice::new(
            IgdVersion::V2,
            "http://192.168.1.1:5000/rootDesc.xml",
            "http://192.168.1.1:5000/ctl/IPConn",
        );
        assert_eq!(device.service_type, "urn:schemas-upnp-org:service:WANIPConnection:2");
        assert_eq!(device.version.to_string(), "IGDv2");
    }
}
