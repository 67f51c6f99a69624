//! IGD Speaker (lib.rs)
//!
//! UPnP port forwarding for load-balancer services: gateway discovery,
//! IGD control, a full-replace mapping lifecycle and a coordination-free
//! election deciding which node talks to the router.

#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod election;
pub mod mapping;
pub mod upnp;

// Re-export main types
pub use config::Config;
pub use controller::{
    ControllerError, EventRecorder, NotOwnerReason, ServicePort, ServiceSpec, ServiceUpnpStatus, StatusPortMapping,
    TracingEvents, UpnpController, Verdict,
};
pub use election::{elect_owner, AdvertisementConfig, NodeState, Pool};
pub use mapping::{ApplyReport, MappingManager, RemoveReport, ServiceKey, ServiceRecord, StatusNotifier};
pub use upnp::{
    discover, discover_with, ClientOptions, DeviceInfo, DiscoveryError, DiscoveryOptions, GatewayDevice, IgdClient,
    IgdVersion, MappingError, MemoryGateway, NetworkSsdp, PortMapping, Protocol, SsdpTransport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```no_run
/// igd_speaker::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["hyper=warn", "reqwest=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
