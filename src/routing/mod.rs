//! Route Steering (C3): the three auxiliary tables and four policy rules
//! that select a table per fwmark (spec.md §4.3).

pub mod iproute;

use std::net::Ipv4Addr;

use crate::config::{self, Role};
use crate::error::AgentResult;
use crate::marks;

/// Everything the route/rule builders need (spec.md §4.3's two variants:
/// collapsed/DPU local-proxy, vs. CPU cross-node-via-`DPUTun`).
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub role: Role,
    pub ztunnel_ip: Option<Ipv4Addr>,
    pub proxy_iface: Option<String>,
    pub outbound_tun: Option<String>,
    /// CPU node only: the tunnel to the paired DPU, standing in for both the
    /// default next hop and the proxy-facing interface.
    pub dpu_tun: Option<String>,
}

/// One `ip rule` entry: priority, match selector, and the table it selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub priority: u32,
    pub selector: String,
    pub table: u32,
}

/// The four fixed policy-rule slots (spec.md §4.3 table). Priority 103 is
/// only installed off a CPU node, which has no local `InboundTun`.
pub fn policy_rules(plan: &RoutePlan) -> Vec<PolicyRule> {
    let mut rules = vec![
        PolicyRule {
            priority: config::RULE_PRIO_SKIP,
            selector: format!("fwmark {}", marks::as_xmark(marks::SKIP_MARK)),
            table: config::TABLE_MAIN,
        },
        PolicyRule {
            priority: config::RULE_PRIO_OUTBOUND,
            selector: format!("fwmark {}", marks::as_xmark(marks::OUTBOUND_MARK)),
            table: config::TABLE_OUTBOUND,
        },
        PolicyRule {
            priority: config::RULE_PRIO_PROXY_RET,
            selector: format!("fwmark {}", marks::as_xmark(marks::PROXY_RET_MARK)),
            table: config::TABLE_PROXY,
        },
    ];
    if !matches!(plan.role, Role::Cpu) {
        rules.push(PolicyRule {
            priority: config::RULE_PRIO_INBOUND,
            selector: String::new(),
            table: config::TABLE_INBOUND,
        });
    }
    rules
}

/// One static route, as `ip route` arguments after `table <id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub table: u32,
    pub spec: String,
}

/// Fixed (non-per-pod) contents of the Outbound and Proxy tables
/// (spec.md §4.3 "Table contents"). The Inbound table holds only the
/// per-pod routes the reconciler adds/removes (spec.md §4.5).
pub fn static_routes(plan: &RoutePlan) -> Vec<StaticRoute> {
    let mut routes = Vec::new();
    match plan.role {
        Role::Collapsed | Role::Dpu => {
            let veth = plan
                .proxy_iface
                .as_deref()
                .expect("collapsed/dpu role always has a proxy interface");
            if let Some(ztunnel_ip) = plan.ztunnel_ip {
                routes.push(StaticRoute {
                    table: config::TABLE_OUTBOUND,
                    spec: format!("{ztunnel_ip}/32 dev {veth}"),
                });
                routes.push(StaticRoute {
                    table: config::TABLE_PROXY,
                    spec: format!("{ztunnel_ip}/32 dev {veth}"),
                });
            }
            let outbound_tun = plan
                .outbound_tun
                .as_deref()
                .expect("collapsed/dpu role always has an outbound tunnel");
            routes.push(StaticRoute {
                table: config::TABLE_OUTBOUND,
                spec: format!("default dev {outbound_tun}"),
            });
            routes.push(StaticRoute {
                table: config::TABLE_PROXY,
                spec: format!("default dev {veth} onlink"),
            });
        }
        Role::Cpu => {
            let dpu_tun = plan
                .dpu_tun
                .as_deref()
                .expect("cpu role always has a DPUTun next hop");
            routes.push(StaticRoute {
                table: config::TABLE_OUTBOUND,
                spec: format!("default dev {dpu_tun}"),
            });
            // No local proxy veth; the cross-node tunnel stands in as the
            // proxy-facing device for the return path too (see DESIGN.md).
            routes.push(StaticRoute {
                table: config::TABLE_PROXY,
                spec: format!("default dev {dpu_tun} onlink"),
            });
        }
    }
    routes
}

/// One per-pod Inbound-table route (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRoute {
    pub pod_ip: Ipv4Addr,
    pub inbound_tun_ip: Ipv4Addr,
    pub inbound_tun: String,
    pub host_ip: Ipv4Addr,
}

impl InboundRoute {
    pub fn spec(&self) -> String {
        format!(
            "{}/32 via {} dev {} src {}",
            self.pod_ip, self.inbound_tun_ip, self.inbound_tun, self.host_ip
        )
    }
}

/// One parsed line of `ip route show` output (SPEC_FULL.md §11
/// "Route-table text-diffing helper"). Used both by the route-existence
/// check (spec.md §9's EINVAL-workaround side-channel) and by test code
/// asserting on table contents, instead of each call site re-tokenizing
/// the raw text itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRow {
    /// The destination token: an address/prefix, or the literal `default`.
    pub dst: String,
    pub via: Option<String>,
    pub dev: Option<String>,
    pub src: Option<String>,
}

/// Parses `ip route show [table N]` output into structured rows. Tolerant
/// of the extra flags (`onlink`, `scope ...`) real output carries; only the
/// keys this crate's route specs ever emit (`via`/`dev`/`src`) are kept.
pub fn parse_route_rows(output: &str) -> Vec<RouteRow> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut tokens = line.split_whitespace();
            let dst = tokens.next().unwrap_or_default().to_string();
            let mut row = RouteRow {
                dst,
                via: None,
                dev: None,
                src: None,
            };
            while let Some(tok) = tokens.next() {
                match tok {
                    "via" => row.via = tokens.next().map(str::to_string),
                    "dev" => row.dev = tokens.next().map(str::to_string),
                    "src" => row.src = tokens.next().map(str::to_string),
                    _ => {}
                }
            }
            row
        })
        .collect()
}

/// The Route Steering contract (spec.md §4.3/§4.5).
pub trait RouteSteering {
    /// Installs the three tables (flushed first) and the policy rules.
    /// Idempotent: a repeated install yields the same observable state.
    fn install(&self, plan: &RoutePlan) -> AgentResult<()>;
    /// Flushes all three tables and removes the four reserved priorities.
    fn teardown(&self) -> AgentResult<()>;
    fn add_inbound_route(&self, route: &InboundRoute) -> AgentResult<()>;
    fn remove_inbound_route(&self, pod_ip: Ipv4Addr) -> AgentResult<()>;
    /// Used by the reconciler's `Tracked -> Tracked` address-change path and
    /// by invariant tests; a present route is reported by exactly one line.
    fn inbound_route_exists(&self, pod_ip: Ipv4Addr) -> AgentResult<bool>;
    /// Raw `ip route show table Inbound` lines, for invariant tests (#1, #5).
    fn inbound_table_contents(&self) -> AgentResult<Vec<String>>;
}
