//! Configuration surface (spec.md §6) and the fixed, bit-exact constants
//! §6 calls out: table IDs, rule priorities, VNIs, and the DNS capture port.

use std::net::Ipv4Addr;

use serde::Deserialize;

/// Role selector choosing the classifier/route variant (spec.md §4.2/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Proxy runs on the same node (veth to a local ztunnel pod).
    Collapsed,
    /// Compute node in a split CPU/DPU deployment.
    Cpu,
    /// Smart-NIC/DPU node in a split deployment; uses the collapsed
    /// classifier locally but also hosts the cross-node `CPUTun`.
    Dpu,
}

impl Role {
    /// Split-mode node pairing is only relevant off the collapsed role.
    pub fn is_split(self) -> bool {
        !matches!(self, Role::Collapsed)
    }
}

/// Routing table IDs (spec.md §3 "Routing tables").
pub const TABLE_INBOUND: u32 = 101;
pub const TABLE_OUTBOUND: u32 = 102;
pub const TABLE_PROXY: u32 = 103;

/// `ip rule` priorities (spec.md §4.3).
pub const RULE_PRIO_SKIP: u32 = 100;
pub const RULE_PRIO_OUTBOUND: u32 = 101;
pub const RULE_PRIO_PROXY_RET: u32 = 102;
pub const RULE_PRIO_INBOUND: u32 = 103;

/// The kernel's reserved "main" routing table, target of the SkipMark rule.
pub const TABLE_MAIN: u32 = 32766;

/// Geneve VNIs (spec.md §4.4).
pub const VNI_INBOUND: u32 = 1000;
pub const VNI_OUTBOUND: u32 = 1001;
pub const VNI_CROSS_NODE: u32 = 1000;

/// Geneve control port, left un-redirected by the classifier (Batch B step 1).
pub const GENEVE_CONTROL_PORT: u16 = 6081;

/// Default port the DNS-capture DNAT rule redirects member UDP/53 to.
pub const DEFAULT_DNS_CAPTURE_PORT: u16 = 15053;

/// Fixed tunnel device names (spec.md §3 "Tunnel endpoints").
pub const INBOUND_TUN: &str = "istioin";
pub const OUTBOUND_TUN: &str = "istioout";
pub const CPU_TUN: &str = "istiocpu";
pub const DPU_TUN: &str = "istiodpu";

/// Fixed /30 point-to-point addresses for each tunnel link (spec.md §4.4
/// "a fixed /N address"). The spec leaves the exact addressing scheme
/// unspecified; these link-local addresses are an Open Question decision
/// recorded in DESIGN.md.
pub const INBOUND_TUN_ADDR: &str = "169.254.7.1/30";
pub const OUTBOUND_TUN_ADDR: &str = "169.254.7.5/30";
pub const CPU_TUN_ADDR: &str = "169.254.7.9/30";
pub const DPU_TUN_ADDR: &str = "169.254.7.13/30";

/// The single ipset name (spec.md §5 "Shared resources").
pub const MEMBERSHIP_SET_NAME: &str = "ztunnel-pods";

/// The agent-owned iptables chain prefix and jump chains per hook (spec.md §4.2).
pub const CHAIN_PREROUTING: &str = "ZTunnelPrerouting";
pub const CHAIN_INPUT: &str = "ZTunnelInput";
pub const CHAIN_FORWARD: &str = "ZTunnelForward";
pub const CHAIN_OUTPUT: &str = "ZTunnelOutput";
pub const CHAIN_POSTROUTING: &str = "ZTunnelPostrouting";

/// Configuration surface recognized by the core (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node role, selecting the classifier/route variant.
    pub role: Role,
    /// Redirect member-source UDP/53 to `ztunnel_ip:dns_capture_port`.
    #[serde(default)]
    pub capture_dns: bool,
    #[serde(default = "default_dns_capture_port")]
    pub dns_capture_port: u16,
    /// Collapsed and DPU modes: the proxy's node-local IP and veth name.
    pub ztunnel_ip: Option<Ipv4Addr>,
    pub ztunnel_veth: Option<String>,
    /// CPU mode: the physical interface name.
    pub cpu_eth: Option<String>,
    /// Split mode: the node-pair table name, used to discover the paired
    /// node's address via the external `GetPair` lookup (spec.md §6).
    pub offmesh_cluster: Option<String>,
    /// This node's own name, for `GetPair(node_name, role)` lookups.
    #[serde(default)]
    pub node_name: String,
}

fn default_dns_capture_port() -> u16 {
    DEFAULT_DNS_CAPTURE_PORT
}

/// Extracts the host address from a fixed `/N` tunnel address constant.
pub fn tun_ip(addr_cidr: &str) -> Ipv4Addr {
    addr_cidr
        .split('/')
        .next()
        .and_then(|s| s.parse().ok())
        .expect("tunnel address constants are always valid host/prefix pairs")
}

impl Config {
    pub fn validate(&self) -> Result<(), crate::error::AgentError> {
        use crate::error::AgentError;
        match self.role {
            Role::Collapsed | Role::Dpu => {
                if self.ztunnel_ip.is_none() || self.ztunnel_veth.is_none() {
                    return Err(AgentError::msg(
                        "collapsed/dpu role requires ztunnel_ip and ztunnel_veth",
                    ));
                }
            }
            Role::Cpu => {
                if self.cpu_eth.is_none() {
                    return Err(AgentError::msg("cpu role requires cpu_eth"));
                }
                if self.offmesh_cluster.is_none() {
                    return Err(AgentError::msg("cpu role requires offmesh_cluster"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapsed_requires_ztunnel_fields() {
        let cfg = Config {
            role: Role::Collapsed,
            capture_dns: false,
            dns_capture_port: DEFAULT_DNS_CAPTURE_PORT,
            ztunnel_ip: None,
            ztunnel_veth: None,
            cpu_eth: None,
            offmesh_cluster: None,
            node_name: "node-a".into(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tun_ip_strips_prefix_length() {
        assert_eq!(tun_ip(INBOUND_TUN_ADDR), "169.254.7.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn cpu_role_requires_offmesh_cluster() {
        let cfg = Config {
            role: Role::Cpu,
            capture_dns: false,
            dns_capture_port: DEFAULT_DNS_CAPTURE_PORT,
            ztunnel_ip: None,
            ztunnel_veth: None,
            cpu_eth: Some("eth0".into()),
            offmesh_cluster: None,
            node_name: "node-a".into(),
        };
        assert!(cfg.validate().is_err());
    }
}
