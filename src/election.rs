//! Single-owner election per address pool.
//!
//! Every node runs the same pure computation over the same pool and node
//! snapshots, so all nodes agree on the owner without talking to each other.
//! Agreement is only as good as the snapshots: while configuration is still
//! propagating, two nodes holding different views may both consider
//! themselves owner for a short time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// UPnP advertisement attached to a pool. Read-only here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisementConfig {
    pub name: String,
    pub enabled: bool,
    /// Nodes allowed to forward ports for the pool
    pub allowed_nodes: BTreeSet<String>,
    /// Default lease for mappings created under this advertisement
    pub lease_seconds: u32,
    /// Default description for mappings created under this advertisement
    pub description: Option<String>,
}

impl AdvertisementConfig {
    pub fn enabled_for<I, S>(name: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            enabled: true,
            allowed_nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// An address pool as seen by the election
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pool {
    pub name: String,
    pub advertisements: Vec<AdvertisementConfig>,
}

impl Pool {
    pub fn new(name: impl Into<String>, advertisements: Vec<AdvertisementConfig>) -> Self {
        Self {
            name: name.into(),
            advertisements,
        }
    }

    /// The pool advertises UPnP at all
    pub fn supports_upnp(&self) -> bool {
        !self.advertisements.is_empty()
    }

    /// First enabled advertisement naming `node`
    pub fn advertisement_for(&self, node: &str) -> Option<&AdvertisementConfig> {
        self.advertisements
            .iter()
            .find(|adv| adv.enabled && adv.allowed_nodes.contains(node))
    }
}

/// Live state of one cluster node, refreshed per reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub name: String,
    pub ready: bool,
    #[serde(default)]
    pub excluded_from_balancers: bool,
}

impl NodeState {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            excluded_from_balancers: false,
        }
    }

    fn eligible(&self) -> bool {
        self.ready && !self.excluded_from_balancers
    }
}

/// Nodes eligible to own the pool, ascending by name.
///
/// The union over every enabled advertisement of its allowed nodes that exist
/// in `nodes`, are ready, and are not excluded from load balancing.
pub fn candidates(advertisements: &[AdvertisementConfig], nodes: &[NodeState]) -> Vec<String> {
    let live: HashMap<&str, &NodeState> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let eligible: BTreeSet<&str> = advertisements
        .iter()
        .filter(|adv| adv.enabled)
        .flat_map(|adv| adv.allowed_nodes.iter())
        .filter(|name| live.get(name.as_str()).is_some_and(|n| n.eligible()))
        .map(String::as_str)
        .collect();

    eligible.into_iter().map(str::to_string).collect()
}

/// The smallest eligible node name, or `None` when nobody is eligible.
pub fn elect_owner(advertisements: &[AdvertisementConfig], nodes: &[NodeState]) -> Option<String> {
    candidates(advertisements, nodes).into_iter().next()
}

/// `node` is the elected owner for the pool described by `advertisements`.
pub fn is_owner(node: &str, advertisements: &[AdvertisementConfig], nodes: &[NodeState]) -> bool {
    elect_owner(advertisements, nodes).as_deref() == Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeState> {
        names.iter().map(|n| NodeState::ready(*n)).collect()
    }

    #[test]
    fn test_smallest_candidate_wins() {
        let ads = vec![AdvertisementConfig::enabled_for("adv", ["c", "b", "d"])];
        let live = nodes(&["a", "b", "c", "d"]);

        assert_eq!(candidates(&ads, &live), vec!["b", "c", "d"]);
        assert_eq!(elect_owner(&ads, &live).as_deref(), Some("b"));
        assert!(is_owner("b", &ads, &live));
        assert!(!is_owner("a", &ads, &live));
    }

    #[test]
    fn test_election_is_deterministic() {
        let ads = vec![
            AdvertisementConfig::enabled_for("one", ["node-3", "node-1"]),
            AdvertisementConfig::enabled_for("two", ["node-2", "node-1"]),
        ];
        let mut live = nodes(&["node-1", "node-2", "node-3"]);
        let first = elect_owner(&ads, &live);

        live.reverse();
        assert_eq!(elect_owner(&ads, &live), first);
        assert_eq!(elect_owner(&ads, &live), first);
    }

    #[test]
    fn test_reelection_when_owner_leaves() {
        let ads = vec![AdvertisementConfig::enabled_for("adv", ["a", "b", "c"])];
        let other_pool = vec![AdvertisementConfig::enabled_for("other", ["c", "a"])];

        let mut live = nodes(&["a", "b", "c"]);
        live[0].ready = false;
        assert_eq!(elect_owner(&ads, &live).as_deref(), Some("b"));
        assert_eq!(elect_owner(&other_pool, &live).as_deref(), Some("c"));

        live[1].ready = false;
        assert_eq!(elect_owner(&ads, &live).as_deref(), Some("c"));
        assert_eq!(elect_owner(&other_pool, &live).as_deref(), Some("c"));
    }

    #[test]
    fn test_ineligible_nodes_are_filtered() {
        let ads = vec![
            AdvertisementConfig::enabled_for("adv", ["a", "b", "ghost"]),
            AdvertisementConfig {
                enabled: false,
                ..AdvertisementConfig::enabled_for("disabled", ["0-first"])
            },
        ];
        let mut live = nodes(&["0-first", "a", "b"]);
        live[1].excluded_from_balancers = true;

        // "ghost" is not a live node, "0-first" only appears in a disabled advertisement.
        assert_eq!(candidates(&ads, &live), vec!["b"]);
    }

    #[test]
    fn test_no_owner_without_candidates() {
        let ads = vec![AdvertisementConfig::enabled_for("adv", ["a"])];
        assert_eq!(elect_owner(&ads, &[]), None);
        assert_eq!(elect_owner(&[], &nodes(&["a"])), None);
    }

    #[test]
    fn test_pool_advertisement_lookup() {
        let pool = Pool::new(
            "default",
            vec![
                AdvertisementConfig {
                    enabled: false,
                    ..AdvertisementConfig::enabled_for("off", ["a"])
                },
                AdvertisementConfig {
                    lease_seconds: 600,
                    ..AdvertisementConfig::enabled_for("on", ["a", "b"])
                },
            ],
        );
        assert!(pool.supports_upnp());
        assert_eq!(pool.advertisement_for("a").map(|a| a.name.as_str()), Some("on"));
        assert!(pool.advertisement_for("z").is_none());
        assert!(!Pool::new("empty", vec![]).supports_upnp());
    }
}
