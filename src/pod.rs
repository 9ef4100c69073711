//! Pod descriptor and the external pod event stream (spec.md §3, §6).

use std::net::Ipv4Addr;

use serde::Deserialize;

/// Stable identity, namespace, name, address, and membership of a pod. Owned
/// by the external pod source — the agent observes but never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Primary IPv4 address, if the pod has been assigned one yet.
    pub ip: Option<Ipv4Addr>,
    pub host_node: String,
    /// Whether the pod is a mesh member.
    pub mesh_member: bool,
}

impl Pod {
    /// True exactly when this pod should have a Membership Set entry and an
    /// Inbound route on the local node (spec.md §4.5 `Absent -> Tracked`).
    pub fn is_local_mesh_member(&self, local_node: &str) -> bool {
        self.mesh_member && self.host_node == local_node && self.ip.is_some()
    }
}

/// One event from the pod event source (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PodEvent {
    pub op: PodOp,
    pub pod: Pod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodOp {
    Add,
    Update,
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ip: Option<&str>, mesh_member: bool, host_node: &str) -> Pod {
        Pod {
            uid: "U1".into(),
            namespace: "default".into(),
            name: "a".into(),
            ip: ip.map(|s| s.parse().unwrap()),
            host_node: host_node.into(),
            mesh_member,
        }
    }

    #[test]
    fn local_mesh_member_requires_ip_membership_and_node_match() {
        assert!(pod(Some("10.244.2.7"), true, "node-a").is_local_mesh_member("node-a"));
        assert!(!pod(None, true, "node-a").is_local_mesh_member("node-a"));
        assert!(!pod(Some("10.244.2.7"), false, "node-a").is_local_mesh_member("node-a"));
        assert!(!pod(Some("10.244.2.7"), true, "node-b").is_local_mesh_member("node-a"));
    }
}
