// tests/integration_tests.rs
//! Integration tests for the UPnP port forwarding stack.
//!
//! Each node runs its own controller against one shared simulated gateway,
//! the way several cluster nodes would share one home router.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use igd_speaker::{
    AdvertisementConfig, ClientOptions, Config, GatewayDevice, IgdClient, IgdVersion, MemoryGateway, NodeState, Pool,
    Protocol, ServiceKey, ServicePort, ServiceSpec, TracingEvents, UpnpController,
};

/// Test logging setup
fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

struct Node {
    controller: UpnpController,
    notified: Arc<AtomicUsize>,
}

async fn node(name: &str, gateway: &Arc<MemoryGateway>, pools: &[Pool]) -> Node {
    let device = GatewayDevice::new(IgdVersion::V1, "http://192.168.1.1:5000/rootDesc.xml", "http://192.168.1.1:5000/ctl");
    let client = IgdClient::new(device, gateway.clone(), ClientOptions::default()).await;

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let controller = UpnpController::new(
        name,
        Arc::new(client),
        &Config::default(),
        Arc::new(TracingEvents),
        Arc::new(move |_key: &ServiceKey| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    controller.set_pool_config(pools.to_vec());

    Node { controller, notified }
}

fn home_pool(nodes: &[&str]) -> Pool {
    Pool::new("home", vec![AdvertisementConfig::enabled_for("home-upnp", nodes.iter().copied())])
}

fn web_service() -> ServiceSpec {
    ServiceSpec {
        upnp_enabled: true,
        pool: "home".to_string(),
        ports: vec![ServicePort::tcp(80), ServicePort::tcp(443)],
        ..ServiceSpec::default()
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_single_owner_across_nodes() {
    setup_test_logging();
    info!("Only the elected node forwards ports");

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let pools = vec![home_pool(&["worker-1", "worker-2", "worker-3"])];
    let cluster: Vec<NodeState> = ["worker-1", "worker-2", "worker-3"]
        .into_iter()
        .map(NodeState::ready)
        .collect();

    let key = ServiceKey::new("media", "jellyfin");
    let spec = web_service();
    let pool = &pools[0];

    let mut owners = Vec::new();
    for name in ["worker-3", "worker-1", "worker-2"] {
        let n = node(name, &gateway, &pools).await;
        if n.controller.should_handle(&key, &spec, pool, &cluster).is_owner() {
            n.controller
                .apply_balancer(&key, &spec, &[ip("192.168.1.240")])
                .await
                .unwrap();
            owners.push(name);
        }
    }

    assert_eq!(owners, vec!["worker-1"]);
    assert_eq!(gateway.table().len(), 2);
    let adds: Vec<String> = gateway
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("AddPortMapping"))
        .collect();
    assert_eq!(adds, vec!["AddPortMapping 80/TCP", "AddPortMapping 443/TCP"]);
}

#[tokio::test]
async fn test_failover_moves_forwarding() {
    setup_test_logging();

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let pools = vec![home_pool(&["worker-1", "worker-2"])];
    let key = ServiceKey::new("media", "jellyfin");
    let spec = web_service();

    let first = node("worker-1", &gateway, &pools).await;
    let second = node("worker-2", &gateway, &pools).await;

    let mut cluster = vec![NodeState::ready("worker-1"), NodeState::ready("worker-2")];
    assert!(first.controller.should_handle(&key, &spec, &pools[0], &cluster).is_owner());
    first
        .controller
        .apply_balancer(&key, &spec, &[ip("192.168.1.240")])
        .await
        .unwrap();

    // worker-1 loses readiness: it stops owning and releases, worker-2 takes over.
    cluster[0].ready = false;
    assert!(!first.controller.should_handle(&key, &spec, &pools[0], &cluster).is_owner());
    first.controller.delete_balancer(&key, "no longer elected").await;
    assert!(gateway.table().is_empty());

    assert!(second.controller.should_handle(&key, &spec, &pools[0], &cluster).is_owner());
    second
        .controller
        .apply_balancer(&key, &spec, &[ip("192.168.1.240")])
        .await
        .unwrap();

    assert_eq!(gateway.table().len(), 2);
    assert_eq!(second.controller.status(&key).unwrap().node, "worker-2");
    assert!(first.controller.status(&key).is_none());
    assert_eq!(first.notified.load(Ordering::SeqCst), 2);
    assert_eq!(second.notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_port_change_replaces_mappings() {
    setup_test_logging();

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let pools = vec![home_pool(&["worker-1"])];
    let n = node("worker-1", &gateway, &pools).await;
    let key = ServiceKey::new("games", "minecraft");

    let mut spec = ServiceSpec {
        upnp_enabled: true,
        pool: "home".to_string(),
        ports: vec![ServicePort::tcp(25565), ServicePort::udp(19132)],
        ..ServiceSpec::default()
    };
    n.controller
        .apply_balancer(&key, &spec, &[ip("192.168.1.50")])
        .await
        .unwrap();
    assert!(gateway.contains(19132, Protocol::Udp));

    spec.ports = vec![ServicePort::tcp(25566)];
    n.controller
        .apply_balancer(&key, &spec, &[ip("192.168.1.50")])
        .await
        .unwrap();

    let table = gateway.table();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].external_port, 25566);
    assert_eq!(table[0].description, "LoadBalancer (minecraft:25566)");
    assert_eq!(n.controller.manager().mappings(&key).len(), 1);
}

#[tokio::test]
async fn test_unresponsive_gateway_times_out() {
    setup_test_logging();

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let device = GatewayDevice::new(IgdVersion::V2, "http://gw/rootDesc.xml", "http://gw/ctl");
    let options = ClientOptions {
        action_timeout: Duration::from_millis(50),
        ..ClientOptions::default()
    };
    let client = Arc::new(IgdClient::new(device, gateway.clone(), options).await);
    let controller = UpnpController::new(
        "worker-1",
        client,
        &Config::default(),
        Arc::new(TracingEvents),
        Arc::new(|_key: &ServiceKey| {}),
    );
    controller.set_pool_config([home_pool(&["worker-1"])]);

    gateway.hang_actions(Some(Duration::from_secs(30)));
    let key = ServiceKey::new("media", "jellyfin");
    let started = std::time::Instant::now();
    let result = controller
        .apply_balancer(&key, &web_service(), &[ip("192.168.1.240")])
        .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(controller.status(&key).is_none());
}

#[tokio::test]
async fn test_sweep_removes_leftovers_from_previous_run() {
    setup_test_logging();

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let pools = vec![home_pool(&["worker-1"])];
    let key = ServiceKey::new("media", "jellyfin");

    {
        let before_restart = node("worker-1", &gateway, &pools).await;
        before_restart
            .controller
            .apply_balancer(&key, &web_service(), &[ip("192.168.1.240")])
            .await
            .unwrap();
    }
    assert_eq!(gateway.table().len(), 2);

    let after_restart = node("worker-1", &gateway, &pools).await;
    let swept = after_restart.controller.sweep_orphans(&[NodeState::ready("worker-1")]).await;
    assert_eq!(swept.len(), 2);
    assert!(gateway.table().is_empty());
}

#[tokio::test]
async fn test_restarting_standby_keeps_owner_mappings() {
    setup_test_logging();

    let gateway = Arc::new(MemoryGateway::new(ip("198.51.100.20")));
    let pools = vec![home_pool(&["worker-1", "worker-2"])];
    let cluster = vec![NodeState::ready("worker-1"), NodeState::ready("worker-2")];
    let key = ServiceKey::new("media", "jellyfin");
    let spec = web_service();

    let owner = node("worker-1", &gateway, &pools).await;
    assert!(owner.controller.should_handle(&key, &spec, &pools[0], &cluster).is_owner());
    owner
        .controller
        .apply_balancer(&key, &spec, &[ip("192.168.1.240")])
        .await
        .unwrap();

    // worker-2 restarts with sweeping enabled while worker-1 still owns the pool.
    let standby = node("worker-2", &gateway, &pools).await;
    assert!(!standby.controller.should_handle(&key, &spec, &pools[0], &cluster).is_owner());
    let swept = standby.controller.sweep_orphans(&cluster).await;

    assert!(swept.is_empty());
    assert_eq!(gateway.table().len(), 2);
    assert_eq!(owner.controller.manager().mappings(&key).len(), 2);
    assert!(gateway.calls().iter().all(|c| !c.starts_with("DeletePortMapping")));
}
