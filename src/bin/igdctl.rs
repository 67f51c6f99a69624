use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use igd_speaker::{
    discover, init_logging, Config, GatewayDevice, IgdClient, IgdVersion, MemoryGateway, NodeState, Pool, PortMapping,
    ServiceKey, ServiceSpec, TracingEvents, UpnpController, VERSION,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP IGD port forwarding control", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Name of the local node for election
    #[arg(long, default_value = "localhost")]
    node: String,

    /// Talk to an in-process simulated gateway instead of the network
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the gateway and print its details
    Discover,

    /// Print the gateway's external IP address
    ExternalIp,

    /// List the gateway's port mappings
    List,

    /// Create a port mapping
    Add {
        /// External port on the gateway
        external_port: u16,

        /// Internal client address
        address: IpAddr,

        /// Internal port (defaults to the external port)
        #[arg(long)]
        internal_port: Option<u16>,

        #[arg(short, long, default_value = "TCP")]
        protocol: String,

        #[arg(short, long)]
        description: Option<String>,

        /// Lease in seconds, 0 for permanent
        #[arg(long, default_value_t = 0)]
        lease: u32,
    },

    /// Delete a port mapping
    Delete {
        external_port: u16,

        #[arg(short, long, default_value = "TCP")]
        protocol: String,
    },

    /// Run one reconciliation pass over a JSON snapshot of pools, nodes and services
    Reconcile {
        #[arg(long)]
        state: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    pools: Vec<Pool>,
    #[serde(default)]
    nodes: Vec<NodeState>,
    #[serde(default)]
    services: Vec<SnapshotService>,
}

#[derive(Debug, Deserialize)]
struct SnapshotService {
    /// `namespace/name`
    key: String,
    #[serde(flatten)]
    spec: ServiceSpec,
    #[serde(default)]
    targets: Vec<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    tracing::debug!(version = VERSION, ?config, "starting igdctl");

    match &args.command {
        Command::Discover => {
            let client = connect(&args, &config).await?;
            println!("{}", serde_json::to_string_pretty(&client.device_info())?);
        }
        Command::ExternalIp => {
            let client = connect(&args, &config).await?;
            println!("{}", client.refresh_external_ip().await?);
        }
        Command::List => {
            let client = connect(&args, &config).await?;
            let mappings = client.enumerate_mappings().await?;
            if mappings.is_empty() {
                println!("No port mappings");
            }
            for mapping in mappings {
                println!("{}  lease={}s  \"{}\"", mapping, mapping.lease_seconds, mapping.description);
            }
        }
        Command::Add {
            external_port,
            address,
            internal_port,
            protocol,
            description,
            lease,
        } => {
            let client = connect(&args, &config).await?;
            let mapping = PortMapping::new(
                *external_port,
                internal_port.unwrap_or(*external_port),
                *address,
                protocol.clone(),
            )
            .with_description(description.clone().unwrap_or_else(|| config.default_description.clone()))
            .with_lease(*lease);

            client.add_mapping(&mapping).await?;
            println!("Created {}", mapping);
        }
        Command::Delete { external_port, protocol } => {
            let client = connect(&args, &config).await?;
            client.delete_mapping(*external_port, protocol).await?;
            println!("Deleted {}/{}", external_port, protocol.to_uppercase());
        }
        Command::Reconcile { state } => reconcile(&args, &config, state).await?,
    }

    Ok(())
}

async fn connect(args: &Args, config: &Config) -> Result<Arc<IgdClient>> {
    if args.simulate {
        let gateway = Arc::new(MemoryGateway::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
        let device = GatewayDevice::new(
            IgdVersion::V2,
            "memory://gateway/rootDesc.xml",
            "memory://gateway/ctl/IPConn",
        );
        return Ok(Arc::new(IgdClient::new(device, gateway, config.client_options()).await));
    }

    let device = discover(&config.discovery_options())
        .await
        .context("UPnP gateway discovery failed")?;
    let client = IgdClient::connect(device, config.client_options()).await?;
    Ok(Arc::new(client))
}

async fn reconcile(args: &Args, config: &Config, state: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(state).with_context(|| format!("Failed to read {}", state.display()))?;
    let snapshot: Snapshot =
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", state.display()))?;

    let client = connect(args, config).await?;
    let controller = UpnpController::new(
        args.node.clone(),
        client,
        config,
        Arc::new(TracingEvents),
        Arc::new(|key: &ServiceKey| tracing::debug!(service = %key, "status changed")),
    );
    controller.set_pool_config(snapshot.pools);
    if config.sweep_orphans_on_startup {
        let swept = controller.sweep_orphans(&snapshot.nodes).await;
        println!("Swept {} orphaned port mapping(s)", swept.len());
    }

    for service in &snapshot.services {
        let key: ServiceKey = service.key.parse()?;
        let Some(pool) = controller.pool(&service.spec.pool) else {
            println!("{key}: skipped, unknown pool {:?}", service.spec.pool);
            continue;
        };

        let verdict = controller.should_handle(&key, &service.spec, &pool, &snapshot.nodes);
        if !verdict.is_owner() {
            println!("{key}: not handled ({verdict:?})");
            continue;
        }

        match controller.apply_balancer(&key, &service.spec, &service.targets).await {
            Ok(report) => {
                println!(
                    "{key}: created {}, failed {}, skipped {}",
                    report.created.len(),
                    report.failed.len(),
                    report.skipped.len()
                );
                if let Some(status) = controller.status(&key) {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
            Err(e) => println!("{key}: {e}"),
        }
    }

    Ok(())
}
