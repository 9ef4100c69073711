//! Packet Classifier (C2): the declarative iptables rule set across
//! `mangle` and `nat` (spec.md §4.2).
//!
//! The rule *order* is the externally observable contract (spec.md §4.2,
//! testable property #4), so rule generation is split from rule
//! installation: [`batch_a_rules`] and [`batch_b_rules`] are pure functions
//! returning an ordered `Vec`, which both the real installer and the
//! ordering tests below walk identically.

pub mod iptables;

use std::net::Ipv4Addr;

use crate::config::{self, Role};
use crate::error::AgentResult;
use crate::marks::as_xmark;

/// Everything the rule-builders need to know to emit the correct variant
/// (spec.md §4.2 "Two deployment modes").
#[derive(Debug, Clone)]
pub struct ClassifierPlan {
    pub role: Role,
    /// The interface classed as "proxy-facing" for this node: the ztunnel
    /// veth in collapsed/DPU mode, `None` on a CPU node (which instead uses
    /// `DPUTun` as the skip-source interface, spec.md §4.2).
    pub proxy_iface: Option<String>,
    /// Additional tunnel devices whose ingress traffic is pre-marked
    /// `SkipMark` (Batch A step 1): `InboundTun`/`OutboundTun` in collapsed
    /// mode, `DPUTun` on a CPU node, all three plus `CPUTun` on a DPU node.
    pub tunnel_devices: Vec<String>,
    /// The interface used as the CPU-mode "skip source" in place of a
    /// local proxy veth (`DPUTun`), if this is a CPU node.
    pub skip_source_iface: Option<String>,
    pub ztunnel_ip: Option<Ipv4Addr>,
    pub host_ip: Ipv4Addr,
    pub set_name: String,
    pub capture_dns: bool,
    pub dns_capture_port: u16,
}

impl ClassifierPlan {
    /// The interface Batch B's rules 4/6 key off: the local proxy veth
    /// (collapsed/DPU), or the cross-node tunnel acting in its place (CPU).
    fn proxy_facing_iface(&self) -> &str {
        self.proxy_iface
            .as_deref()
            .or(self.skip_source_iface.as_deref())
            .expect("a classifier plan always has a proxy-facing or skip-source interface")
    }

    /// Rules 6/8 need a destination-set test only on a CPU node (spec.md
    /// §9 Open Question: the CPU/DPU predicate variants are both required
    /// and must not be unified). Collapsed mode is treated like DPU mode
    /// here — recorded as an Open Question decision in DESIGN.md.
    fn dest_set_test_required(&self) -> bool {
        matches!(self.role, Role::Cpu)
    }

    /// Rule 8 (stamp ConnSkipMark for proxy-facing ingress to a member
    /// destination) is CPU-node-only per spec.md §4.2 Batch B step 8.
    fn rule_8_applies(&self) -> bool {
        matches!(self.role, Role::Cpu)
    }
}

type Rule = (&'static str, &'static str, String);

/// Batch A: conntrack plumbing and fast accepts (spec.md §4.2).
pub fn batch_a_rules(plan: &ClassifierPlan) -> Vec<Rule> {
    let mut rules = Vec::new();

    // 1. Tunnel device ingress already carries the correct mark.
    for dev in &plan.tunnel_devices {
        rules.push((
            "mangle",
            config::CHAIN_PREROUTING,
            format!("-i {dev} -j MARK --set-xmark {}", as_xmark(crate::marks::SKIP_MARK)),
        ));
        rules.push(("mangle", config::CHAIN_PREROUTING, format!("-i {dev} -j RETURN")));
    }

    // 2. Persist ConnSkipMark/ProxyMark into connmark after routing.
    for chain in [config::CHAIN_FORWARD, config::CHAIN_INPUT] {
        rules.push((
            "mangle",
            chain,
            format!(
                "-m mark --mark {} -j CONNMARK --save-mark --nfmask {:#x} --ctmask {:#x}",
                as_xmark(crate::marks::CONN_SKIP_MARK),
                crate::marks::CONN_SKIP_MASK,
                crate::marks::CONN_SKIP_MASK
            ),
        ));
        rules.push((
            "mangle",
            chain,
            format!(
                "-m mark --mark {} -j CONNMARK --save-mark --nfmask {:#x} --ctmask {:#x}",
                as_xmark(crate::marks::PROXY_MARK),
                crate::marks::PROXY_MASK,
                crate::marks::PROXY_MASK
            ),
        ));
    }

    // 3. Host-originated traffic never enters the proxy path.
    rules.push((
        "mangle",
        config::CHAIN_OUTPUT,
        format!(
            "-s {} -j CONNMARK --set-xmark {}",
            plan.host_ip,
            as_xmark(crate::marks::CONN_SKIP_MASK)
        ),
    ));

    // 4. Don't let kube-proxy rewrite VIPs for flows already bound for the proxy.
    for chain in [config::CHAIN_PREROUTING, config::CHAIN_POSTROUTING] {
        rules.push((
            "nat",
            chain,
            format!(
                "-m mark --mark {} -j ACCEPT",
                as_xmark(crate::marks::OUTBOUND_MARK)
            ),
        ));
    }

    // 5. Optional DNS capture.
    if plan.capture_dns {
        if let Some(ztunnel_ip) = plan.ztunnel_ip {
            rules.push((
                "nat",
                config::CHAIN_PREROUTING,
                format!(
                    "-p udp --dport 53 -m set --match-set {} src -j DNAT --to-destination {}:{}",
                    plan.set_name, ztunnel_ip, plan.dns_capture_port
                ),
            ));
        }
    }

    rules
}

/// Batch B: classification proper, all in `PREROUTING`/`mangle` and in the
/// fixed order spec.md §4.2 mandates (testable property #4).
pub fn batch_b_rules(plan: &ClassifierPlan) -> Vec<Rule> {
    let chain = config::CHAIN_PREROUTING;
    let iface = plan.proxy_facing_iface();
    let mut rules = Vec::new();

    // 1. Geneve control port is never touched.
    rules.push((
        "mangle",
        chain,
        format!("-p udp --dport {} -j RETURN", config::GENEVE_CONTROL_PORT),
    ));

    // 2. connmark == ConnSkipMark -> restore transient SkipMark.
    rules.push((
        "mangle",
        chain,
        format!(
            "-m connmark --mark {} -j MARK --set-xmark {}",
            as_xmark(crate::marks::CONN_SKIP_MASK),
            as_xmark(crate::marks::SKIP_MARK)
        ),
    ));

    // 3. SkipMark set -> RETURN.
    rules.push((
        "mangle",
        chain,
        format!("-m mark --mark {} -j RETURN", as_xmark(crate::marks::SKIP_MARK)),
    ));

    // 4. Not from proxy-facing interface, connmark == ProxyMark -> ProxyRetMark.
    rules.push((
        "mangle",
        chain,
        format!(
            "! -i {iface} -m connmark --mark {} -j MARK --set-xmark {}",
            as_xmark(crate::marks::PROXY_MASK),
            as_xmark(crate::marks::PROXY_RET_MARK)
        ),
    ));

    // 5. ProxyRetMark set -> RETURN.
    rules.push((
        "mangle",
        chain,
        format!(
            "-m mark --mark {} -j RETURN",
            as_xmark(crate::marks::PROXY_RET_MARK)
        ),
    ));

    // 6. From proxy-facing interface, not from proxy IP, dest is a member -> ProxyMark.
    {
        let mut spec = format!("-i {iface}");
        if let Some(ztunnel_ip) = plan.ztunnel_ip {
            spec.push_str(&format!(" ! -s {ztunnel_ip}"));
        }
        if plan.dest_set_test_required() {
            spec.push_str(&format!(" -m set --match-set {} dst", plan.set_name));
        }
        spec.push_str(&format!(
            " -j MARK --set-xmark {}",
            as_xmark(crate::marks::PROXY_MARK)
        ));
        rules.push(("mangle", chain, spec));
    }

    // 7. SkipMark set -> RETURN (defensive re-check).
    rules.push((
        "mangle",
        chain,
        format!("-m mark --mark {} -j RETURN", as_xmark(crate::marks::SKIP_MARK)),
    ));

    // 8. CPU-node only: from proxy-facing interface, dest is a member -> ConnSkipMark.
    if plan.rule_8_applies() {
        rules.push((
            "mangle",
            chain,
            format!(
                "-i {iface} -m set --match-set {} dst -j MARK --set-xmark {}",
                plan.set_name,
                as_xmark(crate::marks::CONN_SKIP_MARK)
            ),
        ));
    }

    // 9. UDP -> ConnSkipMark (DNS bypass).
    rules.push((
        "mangle",
        chain,
        format!(
            "-p udp -j MARK --set-xmark {}",
            as_xmark(crate::marks::CONN_SKIP_MARK)
        ),
    ));

    // 10. SkipMark set -> RETURN (defensive).
    rules.push((
        "mangle",
        chain,
        format!("-m mark --mark {} -j RETURN", as_xmark(crate::marks::SKIP_MARK)),
    ));

    // 11. TCP, source is a member -> OutboundMark.
    rules.push((
        "mangle",
        chain,
        format!(
            "-p tcp -m set --match-set {} src -j MARK --set-xmark {}",
            plan.set_name,
            as_xmark(crate::marks::OUTBOUND_MARK)
        ),
    ));

    rules
}

/// The Packet Classifier contract: install is idempotent (flush-and-reinstall
/// if the top-level jump already exists), teardown removes jumps then
/// chains, and both are safe to run repeatedly (spec.md §4.2, §7).
pub trait Classifier {
    fn install(&self, plan: &ClassifierPlan) -> AgentResult<()>;
    fn teardown(&self) -> AgentResult<()>;
    /// Rules currently installed in `table`/`chain`, in order — used by the
    /// ordering and idempotence tests.
    fn installed_rules(&self, table: &str, chain: &str) -> AgentResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collapsed_plan() -> ClassifierPlan {
        ClassifierPlan {
            role: Role::Collapsed,
            proxy_iface: Some("veth-zt".into()),
            tunnel_devices: vec![config::INBOUND_TUN.into(), config::OUTBOUND_TUN.into()],
            skip_source_iface: None,
            ztunnel_ip: Some("10.0.0.2".parse().unwrap()),
            host_ip: "10.0.0.1".parse().unwrap(),
            set_name: config::MEMBERSHIP_SET_NAME.into(),
            capture_dns: true,
            dns_capture_port: config::DEFAULT_DNS_CAPTURE_PORT,
        }
    }

    fn cpu_plan() -> ClassifierPlan {
        ClassifierPlan {
            role: Role::Cpu,
            proxy_iface: None,
            tunnel_devices: vec![config::DPU_TUN.into()],
            skip_source_iface: Some(config::DPU_TUN.into()),
            ztunnel_ip: None,
            host_ip: "10.0.0.1".parse().unwrap(),
            set_name: config::MEMBERSHIP_SET_NAME.into(),
            capture_dns: false,
            dns_capture_port: config::DEFAULT_DNS_CAPTURE_PORT,
        }
    }

    /// Testable property #4: the SkipMark-RETURN rule precedes any rule
    /// that stamps OutboundMark, for every variant.
    #[test]
    fn skip_return_precedes_outbound_stamp_in_every_variant() {
        for plan in [collapsed_plan(), cpu_plan()] {
            let rules = batch_b_rules(&plan);
            let skip_return_idx = rules
                .iter()
                .position(|(_, _, r)| r.contains("RETURN") && r.contains(&as_xmark(crate::marks::SKIP_MARK)))
                .expect("a SkipMark RETURN rule must exist");
            let outbound_idx = rules
                .iter()
                .position(|(_, _, r)| r.contains(&as_xmark(crate::marks::OUTBOUND_MARK)))
                .expect("an OutboundMark stamp rule must exist");
            assert!(skip_return_idx < outbound_idx);
        }
    }

    #[test]
    fn cpu_mode_omits_rule_8_and_requires_dest_set_on_rule_6() {
        let plan = cpu_plan();
        let rules = batch_b_rules(&plan);
        let rule8_count = rules
            .iter()
            .filter(|(_, _, r)| r.contains(&as_xmark(crate::marks::CONN_SKIP_MARK)) && r.contains("match-set"))
            .count();
        assert_eq!(rule8_count, 1, "CPU mode installs exactly one ConnSkipMark dst-set rule (rule 8)");
        let rule6 = rules
            .iter()
            .find(|(_, _, r)| r.contains(&as_xmark(crate::marks::PROXY_MARK)) && !r.contains("PROXY_RET"))
            .unwrap();
        assert!(rule6.2.contains("match-set"), "CPU mode rule 6 must test the destination set");
    }

    #[test]
    fn collapsed_mode_rule_6_has_no_dest_set_test() {
        let plan = collapsed_plan();
        let rules = batch_b_rules(&plan);
        let rule6 = rules
            .iter()
            .find(|(_, _, r)| {
                r.contains(&as_xmark(crate::marks::PROXY_MARK)) && !r.contains("ProxyRet") && r.contains("! -s")
            })
            .unwrap();
        assert!(!rule6.2.contains("match-set"));
    }

    #[test]
    fn capture_dns_adds_exactly_one_dnat_rule() {
        let with_dns = batch_a_rules(&collapsed_plan());
        assert_eq!(
            with_dns
                .iter()
                .filter(|(_, _, r)| r.contains("DNAT"))
                .count(),
            1
        );

        let mut no_dns_plan = collapsed_plan();
        no_dns_plan.capture_dns = false;
        let without_dns = batch_a_rules(&no_dns_plan);
        assert_eq!(without_dns.iter().filter(|(_, _, r)| r.contains("DNAT")).count(), 0);
    }
}
