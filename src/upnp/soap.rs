//! SOAP control transport for the WANIPConnection service.
//!
//! Every device interaction is one of four actions. [`IgdControl`] is the seam
//! between the protocol client and the wire: [`SoapControl`] speaks SOAP over
//! HTTP to a real gateway, while [`MemoryGateway`](super::MemoryGateway)
//! simulates one in-process.

use std::time::Duration;

use async_trait::async_trait;
use xmltree::{Element, XMLNode};

use super::device::GatewayDevice;
use super::error::{ActionError, ProtocolFault, TransportError};
use super::Protocol;

/// Arguments of `AddPortMapping`. The remote host is always the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPortMappingRequest {
    pub external_port: u16,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub internal_client: String,
    pub enabled: bool,
    pub description: String,
    pub lease_duration: u32,
}

/// Raw output arguments of `GetGenericPortMappingEntry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericPortMappingEntry {
    pub remote_host: String,
    pub external_port: u16,
    pub protocol: String,
    pub internal_port: u16,
    pub internal_client: String,
    pub enabled: bool,
    pub description: String,
    pub lease_duration: u32,
}

/// The four control actions the client needs from a gateway.
#[async_trait]
pub trait IgdControl: Send + Sync {
    /// `GetExternalIPAddress`, returning the raw address string
    async fn get_external_ip_address(&self) -> Result<String, ActionError>;

    /// `AddPortMapping` with `NewRemoteHost` empty
    async fn add_port_mapping(&self, request: &AddPortMappingRequest) -> Result<(), ActionError>;

    /// `DeletePortMapping` with `NewRemoteHost` empty
    async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), ActionError>;

    /// `GetGenericPortMappingEntry` at `index`
    async fn get_generic_port_mapping_entry(&self, index: u16) -> Result<GenericPortMappingEntry, ActionError>;
}

/// SOAP-over-HTTP control client bound to one gateway's control URL
pub struct SoapControl {
    http: reqwest::Client,
    control_url: String,
    service_type: String,
}

impl SoapControl {
    pub fn new(device: &GatewayDevice, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http {
                url: device.control_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            control_url: device.control_url.clone(),
            service_type: device.service_type.clone(),
        })
    }

    async fn invoke(&self, action: &str, args: &[(&str, String)]) -> Result<Element, ActionError> {
        let body = envelope(&self.service_type, action, args);
        let soap_action = format!("\"{}#{}\"", self.service_type, action);

        tracing::trace!(action, url = %self.control_url, "sending SOAP request");

        let response = self
            .http
            .post(&self.control_url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", soap_action)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Http {
                url: self.control_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| TransportError::Http {
            url: self.control_url.clone(),
            reason: e.to_string(),
        })?;

        parse_response(action, status, &text).map_err(|e| match e {
            ActionError::Transport(TransportError::Status { status, .. }) => {
                TransportError::Status {
                    url: self.control_url.clone(),
                    status,
                }
                .into()
            }
            other => other,
        })
    }
}

#[async_trait]
impl IgdControl for SoapControl {
    async fn get_external_ip_address(&self) -> Result<String, ActionError> {
        let response = self.invoke("GetExternalIPAddress", &[]).await?;
        Ok(required_arg(&response, "NewExternalIPAddress")?)
    }

    async fn add_port_mapping(&self, request: &AddPortMappingRequest) -> Result<(), ActionError> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", request.external_port.to_string()),
            ("NewProtocol", request.protocol.as_str().to_string()),
            ("NewInternalPort", request.internal_port.to_string()),
            ("NewInternalClient", request.internal_client.clone()),
            ("NewEnabled", if request.enabled { "1" } else { "0" }.to_string()),
            ("NewPortMappingDescription", request.description.clone()),
            ("NewLeaseDuration", request.lease_duration.to_string()),
        ];
        self.invoke("AddPortMapping", &args).await?;
        Ok(())
    }

    async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), ActionError> {
        let args = [
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", external_port.to_string()),
            ("NewProtocol", protocol.as_str().to_string()),
        ];
        self.invoke("DeletePortMapping", &args).await?;
        Ok(())
    }

    async fn get_generic_port_mapping_entry(&self, index: u16) -> Result<GenericPortMappingEntry, ActionError> {
        let response = self
            .invoke("GetGenericPortMappingEntry", &[("NewPortMappingIndex", index.to_string())])
            .await?;
        Ok(parse_generic_entry(&response)?)
    }
}

/// Build the request envelope for `action` in the `service_type` namespace.
pub fn envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut arguments = String::new();
    for (name, value) in args {
        arguments.push_str(&format!("<{name}>{}</{name}>", escape(value)));
    }

    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{arguments}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

/// Decode a control response: the `{action}Response` element on success, the
/// structured fault when the body carries one.
pub fn parse_response(action: &str, status: u16, body: &str) -> Result<Element, ActionError> {
    let success = (200..300).contains(&status);

    let root = match Element::parse(body.as_bytes()) {
        Ok(root) => root,
        Err(_) if !success => {
            return Err(TransportError::Status {
                url: String::new(),
                status,
            }
            .into())
        }
        Err(e) => return Err(TransportError::Xml(e.to_string()).into()),
    };

    let soap_body = root
        .get_child("Body")
        .ok_or_else(|| TransportError::InvalidResponse("missing SOAP Body".to_string()))?;

    if let Some(fault) = soap_body.get_child("Fault") {
        return Err(parse_fault(fault)?.into());
    }

    if !success {
        return Err(TransportError::Status {
            url: String::new(),
            status,
        }
        .into());
    }

    let expected = format!("{action}Response");
    soap_body
        .children
        .iter()
        .find_map(|child| match child {
            XMLNode::Element(elem) if elem.name == expected => Some(elem.clone()),
            _ => None,
        })
        .ok_or_else(|| TransportError::InvalidResponse(format!("missing {expected}")).into())
}

fn parse_fault(fault: &Element) -> Result<ProtocolFault, TransportError> {
    let upnp_error = fault
        .get_child("detail")
        .and_then(|d| d.get_child("UPnPError"))
        .ok_or_else(|| TransportError::InvalidResponse("SOAP fault without UPnPError detail".to_string()))?;

    let code_text = optional_arg(upnp_error, "errorCode")
        .ok_or_else(|| TransportError::InvalidResponse("UPnPError without errorCode".to_string()))?;
    let code = code_text
        .trim()
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidResponse(format!("non-numeric errorCode {code_text:?}")))?;

    let description = optional_arg(upnp_error, "errorDescription").unwrap_or_default();
    Ok(ProtocolFault::new(code, description.trim()))
}

fn parse_generic_entry(response: &Element) -> Result<GenericPortMappingEntry, TransportError> {
    Ok(GenericPortMappingEntry {
        remote_host: optional_arg(response, "NewRemoteHost").unwrap_or_default(),
        external_port: numeric_arg(response, "NewExternalPort")?,
        protocol: required_arg(response, "NewProtocol")?,
        internal_port: numeric_arg(response, "NewInternalPort")?,
        internal_client: required_arg(response, "NewInternalClient")?,
        enabled: parse_bool(&required_arg(response, "NewEnabled")?),
        description: optional_arg(response, "NewPortMappingDescription").unwrap_or_default(),
        lease_duration: numeric_arg(response, "NewLeaseDuration")?,
    })
}

/// Text of child `name`; an empty element yields `""`, a missing one `None`.
fn optional_arg(elem: &Element, name: &str) -> Option<String> {
    elem.get_child(name)
        .map(|child| child.get_text().map(|t| t.into_owned()).unwrap_or_default())
}

fn required_arg(elem: &Element, name: &str) -> Result<String, TransportError> {
    optional_arg(elem, name)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| TransportError::InvalidResponse(format!("missing {name}")))
}

fn numeric_arg<T: std::str::FromStr>(elem: &Element, name: &str) -> Result<T, TransportError> {
    let text = required_arg(elem, name)?;
    text.parse()
        .map_err(|_| TransportError::InvalidResponse(format!("invalid {name}: {text:?}")))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
