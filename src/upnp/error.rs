use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// No controllable gateway could be located at startup.
///
/// Fatal to the UPnP component only: the owning process keeps running with
/// port forwarding disabled.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// SSDP socket setup or send failed
    #[error("SSDP search failed: {0}")]
    Search(#[from] std::io::Error),

    /// Every responder was queried and none exposed a usable WANIPConnection service
    #[error("No UPnP IGD device found (tried IGDv2 and IGDv1)")]
    NoGatewayFound,

    /// A device was selected but its control transport could not be set up
    #[error("Failed to set up control transport: {0}")]
    Transport(#[from] TransportError),
}

/// Network or HTTP level failure while talking to the device.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP client error (connect, send, read)
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// Non-success status without a SOAP fault in the body
    #[error("HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// Response body could not be parsed
    #[error("XML parsing error: {0}")]
    Xml(String),

    /// Response parsed but did not carry the expected fields
    #[error("Invalid UPnP response: {0}")]
    InvalidResponse(String),

    /// Control URL could not be resolved against the device location
    #[error("Invalid control URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// A structured SOAP fault reported by the device (`UPnPError` detail).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SOAP fault {code}: {description}")]
pub struct ProtocolFault {
    /// The `errorCode` element of the fault detail
    pub code: u16,
    /// The `errorDescription` element of the fault detail
    pub description: String,
}

impl ProtocolFault {
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Known classification of the numeric code, if any
    pub fn kind(&self) -> Option<UpnpErrorCode> {
        UpnpErrorCode::from_code(self.code)
    }

    /// The device has no entry for the (port, protocol) pair.
    pub fn is_no_such_entry(&self) -> bool {
        self.kind() == Some(UpnpErrorCode::NoSuchEntryInArray)
    }

    /// The generic-entry index is past the end of the table.
    pub fn is_array_index_invalid(&self) -> bool {
        self.kind() == Some(UpnpErrorCode::SpecifiedArrayIndexInvalid)
    }
}

/// Input rejected before any network call was made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid protocol: {0} (must be TCP or UDP)")]
    InvalidProtocol(String),

    #[error("Invalid port mapping: {0}")]
    InvalidMapping(String),
}

/// Outcome of a single failed control action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fault(#[from] ProtocolFault),
}

impl ActionError {
    pub fn fault(&self) -> Option<&ProtocolFault> {
        match self {
            Self::Fault(fault) => Some(fault),
            Self::Transport(_) => None,
        }
    }
}

/// Error surfaced by the mapping CRUD operations of [`IgdClient`](super::IgdClient).
#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{action} failed: {source}")]
    Action {
        action: &'static str,
        #[source]
        source: ActionError,
    },

    #[error("{action} timed out after {timeout:?}")]
    Timeout {
        action: &'static str,
        timeout: Duration,
    },

    #[error("Invalid {field} in device response: {value}")]
    InvalidResponse { field: &'static str, value: String },
}

impl MappingError {
    pub(crate) fn action(action: &'static str, source: ActionError) -> Self {
        Self::Action { action, source }
    }

    /// The device fault behind this error, when there is one
    pub fn fault(&self) -> Option<&ProtocolFault> {
        match self {
            Self::Action { source, .. } => source.fault(),
            _ => None,
        }
    }
}

/// WANIPConnection fault codes this crate classifies or produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UpnpErrorCode {
    ActionNotAuthorized = 606,

    /// Generic mapping index past the end of the table
    SpecifiedArrayIndexInvalid = 713,

    /// No mapping for the given (port, protocol)
    NoSuchEntryInArray = 714,

    /// External port already forwarded to another client
    ConflictInMappingEntry = 718,
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ActionNotAuthorized => "ActionNotAuthorized",
            Self::SpecifiedArrayIndexInvalid => "SpecifiedArrayIndexInvalid",
            Self::NoSuchEntryInArray => "NoSuchEntryInArray",
            Self::ConflictInMappingEntry => "ConflictInMappingEntry",
        };
        f.write_str(name)
    }
}

impl UpnpErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            606 => Some(Self::ActionNotAuthorized),
            713 => Some(Self::SpecifiedArrayIndexInvalid),
            714 => Some(Self::NoSuchEntryInArray),
            718 => Some(Self::ConflictInMappingEntry),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}
