//! Gateway discovery.
//!
//! SSDP M-SEARCH for the IGDv2 device class first, IGDv1 second. Every
//! responder's description is fetched and searched for the matching
//! WANIPConnection service. When several devices answer, candidates are tried
//! in ascending `LOCATION` order so every run over the same set of responders
//! picks the same device.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use url::Url;
use xmltree::{Element, XMLNode};

use super::device::{GatewayDevice, IgdVersion};
use super::error::{DiscoveryError, TransportError};

const SSDP_MULTICAST: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
    Ipv4Addr::new(239, 255, 255, 250),
    1900,
));

/// Knobs for one discovery run
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long to collect SSDP responses per protocol version
    pub search_window: Duration,

    /// Timeout for each device description fetch
    pub fetch_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            search_window: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

/// Network side of discovery: SSDP search and description fetch.
#[async_trait]
pub trait SsdpTransport: Send + Sync {
    /// `LOCATION`s of every responder to an M-SEARCH for `version`, in
    /// arrival order. May contain duplicates.
    async fn search(&self, version: IgdVersion, window: Duration) -> Result<Vec<String>, DiscoveryError>;

    /// Device description document at `location`
    async fn fetch_description(&self, location: &str) -> Result<String, TransportError>;
}

/// SSDP over UDP multicast, descriptions over HTTP
pub struct NetworkSsdp {
    http: reqwest::Client,
}

impl NetworkSsdp {
    pub fn new(fetch_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| TransportError::Http {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SsdpTransport for NetworkSsdp {
    async fn search(&self, version: IgdVersion, window: Duration) -> Result<Vec<String>, DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(search_request(version).as_bytes(), SSDP_MULTICAST).await?;

        let mut locations = Vec::new();
        let mut buf = vec![0u8; 2048];
        let deadline = Instant::now() + window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((size, from))) => {
                    let response = String::from_utf8_lossy(&buf[..size]);
                    if let Some(location) = parse_location(&response) {
                        tracing::trace!(%from, %location, "SSDP response");
                        locations.push(location);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "SSDP receive failed");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(locations)
    }

    async fn fetch_description(&self, location: &str) -> Result<String, TransportError> {
        let response = self.http.get(location).send().await.map_err(|e| TransportError::Http {
            url: location.to_string(),
            reason: e.to_string(),
        })?;
        response.text().await.map_err(|e| TransportError::Http {
            url: location.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Locate a controllable gateway on the local network, preferring IGDv2.
pub async fn discover(options: &DiscoveryOptions) -> Result<GatewayDevice, DiscoveryError> {
    let transport = NetworkSsdp::new(options.fetch_timeout)?;
    discover_with(&transport, options).await
}

/// Locate a gateway through `transport`: IGDv2 first, IGDv1 when v2 finds
/// nothing usable or fails.
pub async fn discover_with(
    transport: &dyn SsdpTransport,
    options: &DiscoveryOptions,
) -> Result<GatewayDevice, DiscoveryError> {
    for version in [IgdVersion::V2, IgdVersion::V1] {
        match discover_version(transport, version, options).await {
            Ok(Some(device)) => return Ok(device),
            Ok(None) => {
                tracing::debug!(%version, "no usable devices answered, trying next version");
            }
            Err(e) => {
                tracing::debug!(%version, error = %e, "discovery failed, trying next version");
            }
        }
    }

    Err(DiscoveryError::NoGatewayFound)
}

async fn discover_version(
    transport: &dyn SsdpTransport,
    version: IgdVersion,
    options: &DiscoveryOptions,
) -> Result<Option<GatewayDevice>, DiscoveryError> {
    // Ascending order, so the same responders always yield the same device.
    let locations: BTreeSet<String> = transport
        .search(version, options.search_window)
        .await?
        .into_iter()
        .collect();
    tracing::debug!(%version, responders = locations.len(), "SSDP search finished");

    let candidates = locations.len();
    for location in locations {
        match inspect_location(transport, &location, version, options.fetch_timeout).await {
            Ok(Some(device)) => {
                tracing::info!(
                    %version,
                    location = %device.location,
                    control_url = %device.control_url,
                    candidates,
                    "selected UPnP IGD device"
                );
                return Ok(Some(device));
            }
            Ok(None) => {
                tracing::debug!(%version, %location, "device has no matching WANIPConnection service");
            }
            Err(e) => {
                tracing::debug!(%version, %location, error = %e, "failed to inspect device");
            }
        }
    }

    Ok(None)
}

async fn inspect_location(
    transport: &dyn SsdpTransport,
    location: &str,
    version: IgdVersion,
    fetch_timeout: Duration,
) -> Result<Option<GatewayDevice>, TransportError> {
    let xml = timeout(fetch_timeout, transport.fetch_description(location))
        .await
        .map_err(|_| TransportError::Http {
            url: location.to_string(),
            reason: format!("description fetch timed out after {fetch_timeout:?}"),
        })??;

    let control_url = find_control_url(&xml, location, version.service_urn())?;
    Ok(control_url.map(|url| GatewayDevice::new(version, location, url)))
}

pub(crate) fn search_request(version: IgdVersion) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\r\n",
        version.device_urn()
    )
}

/// Extract the `LOCATION` header from an SSDP response.
pub(crate) fn parse_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Find the absolute control URL of `service_urn` in a device description.
pub(crate) fn find_control_url(
    description: &str,
    location: &str,
    service_urn: &str,
) -> Result<Option<String>, TransportError> {
    let root = Element::parse(description.as_bytes()).map_err(|e| TransportError::Xml(e.to_string()))?;

    let Some(device) = root.get_child("device") else {
        return Ok(None);
    };
    let Some(service) = find_service(device, service_urn) else {
        return Ok(None);
    };
    let Some(control) = service.get_child("controlURL").and_then(|c| c.get_text()) else {
        return Ok(None);
    };

    let base = root
        .get_child("URLBase")
        .and_then(|b| b.get_text())
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| location.to_string());

    let resolved = Url::parse(&base)
        .and_then(|base| base.join(control.trim()))
        .map_err(|e| TransportError::InvalidUrl {
            url: control.to_string(),
            reason: e.to_string(),
        })?;

    Ok(Some(resolved.to_string()))
}

fn find_service<'a>(device: &'a Element, service_urn: &str) -> Option<&'a Element> {
    if let Some(services) = device.get_child("serviceList") {
        for child in &services.children {
            if let XMLNode::Element(service) = child {
                let matches = service
                    .get_child("serviceType")
                    .and_then(|t| t.get_text())
                    .map(|t| t.trim() == service_urn)
                    .unwrap_or(false);
                if matches {
                    return Some(service);
                }
            }
        }
    }

    let embedded = device.get_child("deviceList")?;
    embedded.children.iter().find_map(|child| match child {
        XMLNode::Element(sub) if sub.name == "device" => find_service(sub, service_urn),
        _ => None,
    })
}
