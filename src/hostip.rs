//! Host IP and node-pair discovery (spec.md §6 "External interfaces").
//!
//! Both are collaborators the spec explicitly treats as external (the node
//! object and its `Spec.PodCIDR`/`InternalIP`, and the split-mode peer
//! lookup) — there is no Kubernetes client here, only the trait seam a real
//! one would plug into, plus pure selection logic that is fully testable
//! without one.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::config::Role;
use crate::error::{AgentError, AgentResult};

/// What the agent needs from the node object (spec.md §6).
pub trait NodeInfoSource {
    fn pod_cidr(&self) -> Option<Ipv4Net>;
    fn internal_ip(&self) -> Ipv4Addr;
}

/// Picks the host IP: the local address inside `Spec.PodCIDR` if set,
/// otherwise the node's `InternalIP` (spec.md §6).
pub fn discover_host_ip(node: &dyn NodeInfoSource, local_addrs: &[Ipv4Addr]) -> Ipv4Addr {
    if let Some(cidr) = node.pod_cidr() {
        if let Some(addr) = local_addrs.iter().find(|a| cidr.contains(*a)) {
            return *addr;
        }
    }
    node.internal_ip()
}

/// Local IPv4 addresses, parsed from `ip -4 -o addr show`.
pub fn local_ipv4_addresses() -> AgentResult<Vec<Ipv4Addr>> {
    let out = crate::cmd::run("ip", &["-4", "-o", "addr", "show"])?;
    Ok(out
        .lines()
        .filter_map(|line| {
            let addr_field = line.split_whitespace().nth(3)?;
            let addr_str = addr_field.split('/').next()?;
            addr_str.parse::<Ipv4Addr>().ok()
        })
        .collect())
}

/// The split-mode peer lookup `GetPair(nodeName, role) -> {IP, ...}`
/// (spec.md §6).
pub trait NodePairSource {
    fn get_pair(&self, node_name: &str, role: Role) -> AgentResult<Ipv4Addr>;
}

/// A `GetPair` backed by a small JSON map, keyed by the `offmeshCluster`
/// table name from the configuration surface (spec.md §6).
///
/// Format: `{"<node-name>": {"cpu": "<ip>", "dpu": "<ip>"}}`.
#[derive(Debug, Deserialize)]
pub struct JsonNodePairSource {
    pairs: std::collections::HashMap<String, PairEntry>,
}

#[derive(Debug, Deserialize)]
struct PairEntry {
    cpu: Option<Ipv4Addr>,
    dpu: Option<Ipv4Addr>,
}

impl JsonNodePairSource {
    pub fn load(path: &std::path::Path) -> AgentResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let pairs = serde_json::from_str(&text)?;
        Ok(Self { pairs })
    }
}

impl NodePairSource for JsonNodePairSource {
    fn get_pair(&self, node_name: &str, role: Role) -> AgentResult<Ipv4Addr> {
        let entry = self.pairs.get(node_name).ok_or_else(|| {
            AgentError::msg(format!("no node-pair entry for {node_name}"))
        })?;
        let ip = match role {
            Role::Cpu => entry.dpu,
            Role::Dpu => entry.cpu,
            Role::Collapsed => None,
        };
        ip.ok_or_else(|| AgentError::msg(format!("no paired address for {node_name} ({role:?})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNode {
        pod_cidr: Option<Ipv4Net>,
        internal_ip: Ipv4Addr,
    }

    impl NodeInfoSource for FakeNode {
        fn pod_cidr(&self) -> Option<Ipv4Net> {
            self.pod_cidr
        }
        fn internal_ip(&self) -> Ipv4Addr {
            self.internal_ip
        }
    }

    #[test]
    fn prefers_local_address_inside_pod_cidr() {
        let node = FakeNode {
            pod_cidr: Some("10.244.0.0/16".parse().unwrap()),
            internal_ip: "192.168.1.5".parse().unwrap(),
        };
        let local = vec!["192.168.1.5".parse().unwrap(), "10.244.2.1".parse().unwrap()];
        assert_eq!(discover_host_ip(&node, &local), "10.244.2.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn falls_back_to_internal_ip_without_pod_cidr() {
        let node = FakeNode {
            pod_cidr: None,
            internal_ip: "192.168.1.5".parse().unwrap(),
        };
        let local = vec!["10.244.2.1".parse().unwrap()];
        assert_eq!(discover_host_ip(&node, &local), "192.168.1.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn falls_back_when_pod_cidr_has_no_matching_local_address() {
        let node = FakeNode {
            pod_cidr: Some("10.244.0.0/16".parse().unwrap()),
            internal_ip: "192.168.1.5".parse().unwrap(),
        };
        let local = vec!["172.16.0.2".parse().unwrap()];
        assert_eq!(discover_host_ip(&node, &local), "192.168.1.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn json_node_pair_source_picks_field_by_requesting_roles_counterpart() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            r#"{"node-a": {"cpu": "10.0.0.1", "dpu": "10.0.0.2"}}"#,
        )
        .unwrap();
        let source = JsonNodePairSource::load(tmp.path()).unwrap();
        assert_eq!(
            source.get_pair("node-a", Role::Cpu).unwrap(),
            "10.0.0.2".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            source.get_pair("node-a", Role::Dpu).unwrap(),
            "10.0.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }
}
