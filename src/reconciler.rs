//! Reconciler (C5): drives the Membership Set, Route Steering, and Tunnel
//! Fabric from pod-lifecycle events; owns startup install and shutdown
//! teardown (spec.md §4.5).
//!
//! A single `Agent` value serializes every kernel mutation — the per-pod
//! state machine and the install/teardown sequences are plain synchronous
//! methods on it. `run_blocking` is the one place concurrency shows up: it
//! is meant to be driven from `tokio::task::spawn_blocking`, since every
//! kernel call here may block and the reconciler is the sole blocking site
//! (spec.md §5).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::{debug, error, info, warn};

use crate::config::{self, Config, Role};
use crate::error::AgentResult;
use crate::firewall::{Classifier, ClassifierPlan};
use crate::membership::MembershipSet;
use crate::pod::{Pod, PodEvent, PodOp};
use crate::routing::{InboundRoute, RoutePlan, RouteSteering};
use crate::tunnel::{TunnelFabric, TunnelSpec};

/// What's tracked per pod between `Absent` and `Tracked` (spec.md §4.5).
#[derive(Debug, Clone)]
struct TrackedPod {
    ip: Ipv4Addr,
}

/// Monotonic counters surfaced via [`Metrics::snapshot`] (SPEC_FULL.md §11
/// "Reconciler metrics"). There is no scrape endpoint — the core does not
/// own telemetry publication (spec.md §1 "Out of scope").
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub pods_tracked: u64,
    pub pods_untracked: u64,
    pub events_failed: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> Metrics {
        *self
    }
}

/// Everything the reconciler needs to reach the kernel, abstracted behind
/// the four component traits so tests can supply in-memory fakes
/// (`crate::testing`).
pub struct Agent {
    config: Config,
    host_ip: Ipv4Addr,
    membership: Box<dyn MembershipSet + Send>,
    classifier: Box<dyn Classifier + Send>,
    routing: Box<dyn RouteSteering + Send>,
    tunnels: Box<dyn TunnelFabric + Send>,
    tracked: HashMap<String, TrackedPod>,
    metrics: Metrics,
}

impl Agent {
    pub fn new(
        config: Config,
        host_ip: Ipv4Addr,
        membership: Box<dyn MembershipSet + Send>,
        classifier: Box<dyn Classifier + Send>,
        routing: Box<dyn RouteSteering + Send>,
        tunnels: Box<dyn TunnelFabric + Send>,
    ) -> Self {
        Self {
            config,
            host_ip,
            membership,
            classifier,
            routing,
            tunnels,
            tracked: HashMap::new(),
            metrics: Metrics::default(),
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    fn classifier_plan(&self) -> ClassifierPlan {
        let (proxy_iface, tunnel_devices, skip_source_iface) = match self.config.role {
            Role::Collapsed => (
                self.config.ztunnel_veth.clone(),
                vec![config::INBOUND_TUN.to_string(), config::OUTBOUND_TUN.to_string()],
                None,
            ),
            Role::Dpu => (
                self.config.ztunnel_veth.clone(),
                vec![
                    config::INBOUND_TUN.to_string(),
                    config::OUTBOUND_TUN.to_string(),
                    config::CPU_TUN.to_string(),
                ],
                None,
            ),
            Role::Cpu => (
                None,
                vec![config::DPU_TUN.to_string()],
                Some(config::DPU_TUN.to_string()),
            ),
        };
        ClassifierPlan {
            role: self.config.role,
            proxy_iface,
            tunnel_devices,
            skip_source_iface,
            ztunnel_ip: self.config.ztunnel_ip,
            host_ip: self.host_ip,
            set_name: config::MEMBERSHIP_SET_NAME.to_string(),
            capture_dns: self.config.capture_dns,
            dns_capture_port: self.config.dns_capture_port,
        }
    }

    fn route_plan(&self) -> RoutePlan {
        RoutePlan {
            role: self.config.role,
            ztunnel_ip: self.config.ztunnel_ip,
            proxy_iface: self.config.ztunnel_veth.clone(),
            outbound_tun: matches!(self.config.role, Role::Collapsed | Role::Dpu)
                .then(|| config::OUTBOUND_TUN.to_string()),
            dpu_tun: matches!(self.config.role, Role::Cpu).then(|| config::DPU_TUN.to_string()),
        }
    }

    /// Tunnel links this node owns, in the order they must be created
    /// (spec.md §4.4). `paired_ip` is the cross-node peer address
    /// (`GetPair`), required for CPU/DPU roles.
    fn tunnel_specs(&self, paired_ip: Option<Ipv4Addr>) -> Vec<TunnelSpec> {
        match self.config.role {
            Role::Collapsed => vec![
                TunnelSpec {
                    name: config::INBOUND_TUN.to_string(),
                    vni: config::VNI_INBOUND,
                    remote: self.config.ztunnel_ip.expect("collapsed role requires ztunnel_ip"),
                    local_addr: config::INBOUND_TUN_ADDR.to_string(),
                },
                TunnelSpec {
                    name: config::OUTBOUND_TUN.to_string(),
                    vni: config::VNI_OUTBOUND,
                    remote: self.config.ztunnel_ip.expect("collapsed role requires ztunnel_ip"),
                    local_addr: config::OUTBOUND_TUN_ADDR.to_string(),
                },
            ],
            Role::Dpu => {
                let mut specs = vec![
                    TunnelSpec {
                        name: config::INBOUND_TUN.to_string(),
                        vni: config::VNI_INBOUND,
                        remote: self.config.ztunnel_ip.expect("dpu role requires ztunnel_ip"),
                        local_addr: config::INBOUND_TUN_ADDR.to_string(),
                    },
                    TunnelSpec {
                        name: config::OUTBOUND_TUN.to_string(),
                        vni: config::VNI_OUTBOUND,
                        remote: self.config.ztunnel_ip.expect("dpu role requires ztunnel_ip"),
                        local_addr: config::OUTBOUND_TUN_ADDR.to_string(),
                    },
                ];
                if let Some(cpu_ip) = paired_ip {
                    specs.push(TunnelSpec {
                        name: config::CPU_TUN.to_string(),
                        vni: config::VNI_CROSS_NODE,
                        remote: cpu_ip,
                        local_addr: config::CPU_TUN_ADDR.to_string(),
                    });
                }
                specs
            }
            Role::Cpu => paired_ip
                .map(|dpu_ip| {
                    vec![TunnelSpec {
                        name: config::DPU_TUN.to_string(),
                        vni: config::VNI_CROSS_NODE,
                        remote: dpu_ip,
                        local_addr: config::DPU_TUN_ADDR.to_string(),
                    }]
                })
                .unwrap_or_default(),
        }
    }

    /// Startup sequence (spec.md §4.5): classifier, set, tunnels, procfs,
    /// routing, then each currently-known local pod.
    pub fn install(&mut self, paired_ip: Option<Ipv4Addr>, known_pods: &[Pod]) -> AgentResult<()> {
        self.classifier.install(&self.classifier_plan())?;
        self.membership.create()?;

        // A failure creating one tunnel must not skip the rest (spec.md §9
        // "a failure to add one rule does not skip subsequent rules"):
        // every spec is attempted, and only the last error (if any) is
        // surfaced once every tunnel has been tried.
        let mut last_tunnel_err = None;
        for spec in self.tunnel_specs(paired_ip) {
            if let Err(e) = self.tunnels.create(&spec) {
                warn!("failed to create tunnel {}: {e}", spec.name);
                last_tunnel_err = Some(e);
            }
        }
        if let Some(e) = last_tunnel_err {
            return Err(e);
        }
        self.tunnels.sweep_rp_filter()?;

        self.routing.install(&self.route_plan())?;

        for pod in known_pods {
            if let Err(e) = self.reconcile_pod(PodOp::Add, pod) {
                // Startup reconciliation of an individual pod is steady-state
                // territory, not an install precondition (spec.md §7).
                warn!("failed to reconcile pod {} during startup: {e}", pod.uid);
            }
        }
        Ok(())
    }

    /// Shutdown sequence (spec.md §4.5), reverse of install.
    pub fn teardown(&mut self) -> AgentResult<()> {
        self.routing.teardown()?;
        for name in [config::INBOUND_TUN, config::OUTBOUND_TUN, config::CPU_TUN, config::DPU_TUN] {
            self.tunnels.destroy(name)?;
        }
        self.classifier.teardown()?;
        self.membership.destroy()?;
        self.tracked.clear();
        Ok(())
    }

    /// Drives the `Absent`/`Tracked` state machine for one event
    /// (spec.md §4.5). Steady-state failures are logged and absorbed
    /// (spec.md §7): a failure here never poisons subsequent events.
    pub fn handle_event(&mut self, event: &PodEvent) {
        let result = match event.op {
            PodOp::Add | PodOp::Update => self.reconcile_pod(event.op, &event.pod),
            PodOp::Delete => self.untrack_pod(&event.pod),
        };
        if let Err(e) = result {
            self.metrics.events_failed += 1;
            error!("failed to process event for pod {}: {e}", event.pod.uid);
        }
    }

    fn reconcile_pod(&mut self, op: PodOp, pod: &Pod) -> AgentResult<()> {
        let should_track = pod.is_local_mesh_member(&self.config.node_name);
        let previous = self.tracked.get(&pod.uid).cloned();

        if !should_track {
            if previous.is_some() {
                self.untrack_pod(pod)?;
            }
            return Ok(());
        }

        let new_ip = pod.ip.expect("is_local_mesh_member requires an IP");

        if let Some(prev) = &previous {
            if prev.ip == new_ip {
                debug!("pod {} unchanged ({op:?})", pod.uid);
                return Ok(());
            }
            // Tracked -> Tracked on address change: remove then re-add.
            debug!("pod {} address changed {} -> {}", pod.uid, prev.ip, new_ip);
            self.remove_pod_state(&pod.uid, prev.ip)?;
        } else {
            // Nothing in our in-memory cache for this pod yet (e.g. the very
            // first event after a restart, since no state is persisted
            // across them, spec.md §1). Ask the Membership Set itself
            // whether the pod is already a kernel-resident member before
            // mutating — the IP-or-comment fallback `contains()` exists
            // precisely for this "is this pod already a set member" check
            // (spec.md §4.1/§9).
            match self.membership.contains(new_ip, &pod.uid) {
                Ok(true) => {
                    // Already a kernel-resident member; still make sure the
                    // Inbound route is present (idempotent) since the set
                    // entry and the route are independently reconstructed.
                    debug!("pod {} already a member on reconcile ({op:?})", pod.uid);
                    self.routing.add_inbound_route(&self.inbound_route_for(new_ip))?;
                    self.tracked.insert(pod.uid.clone(), TrackedPod { ip: new_ip });
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("failed to check membership for pod {}: {e}", pod.uid),
            }
        }

        self.membership.add_ip(new_ip, &pod.uid)?;
        let route = self.inbound_route_for(new_ip);
        self.routing.add_inbound_route(&route)?;

        self.tracked.insert(pod.uid.clone(), TrackedPod { ip: new_ip });
        self.metrics.pods_tracked += 1;
        info!("tracking pod {} ({})", pod.uid, new_ip);
        Ok(())
    }

    fn untrack_pod(&mut self, pod: &Pod) -> AgentResult<()> {
        let Some(tracked) = self.tracked.remove(&pod.uid) else {
            return Ok(());
        };
        self.remove_pod_state(&pod.uid, tracked.ip)?;
        self.metrics.pods_untracked += 1;
        info!("untracked pod {} ({})", pod.uid, tracked.ip);
        Ok(())
    }

    fn remove_pod_state(&mut self, uid: &str, ip: Ipv4Addr) -> AgentResult<()> {
        self.routing.remove_inbound_route(ip)?;
        self.membership.delete_ip(ip)?;
        debug!("removed route/set entry for pod {uid} ({ip})");
        Ok(())
    }

    fn inbound_route_for(&self, pod_ip: Ipv4Addr) -> InboundRoute {
        InboundRoute {
            pod_ip,
            inbound_tun_ip: config::tun_ip(config::INBOUND_TUN_ADDR),
            inbound_tun: config::INBOUND_TUN.to_string(),
            host_ip: self.host_ip,
        }
    }

    #[cfg(test)]
    fn is_tracked(&self, uid: &str) -> Option<Ipv4Addr> {
        self.tracked.get(uid).map(|t| t.ip)
    }
}

/// Messages the reconciler's blocking loop consumes (SPEC_FULL.md §10
/// concurrency notes): a single queue carries both pod events and shutdown,
/// so `run_blocking` never needs to select across two channels.
pub enum ReconcilerMsg {
    Event(PodEvent),
    Shutdown,
}

/// The reconciler's driving loop. Meant to be spawned via
/// `tokio::task::spawn_blocking(move || run_blocking(agent, rx, known_pods, paired_ip))`
/// — every kernel call blocks, so this must never run on an async executor
/// thread directly (spec.md §5).
pub fn run_blocking(
    mut agent: Agent,
    mut rx: tokio::sync::mpsc::Receiver<ReconcilerMsg>,
    paired_ip: Option<Ipv4Addr>,
    known_pods: Vec<Pod>,
) -> AgentResult<()> {
    agent.install(paired_ip, &known_pods)?;

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            ReconcilerMsg::Event(event) => agent.handle_event(&event),
            ReconcilerMsg::Shutdown => break,
        }
    }

    agent.teardown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClassifier, FakeMembershipSet, FakeRouteSteering, FakeTunnelFabric};

    fn config(role: Role) -> Config {
        Config {
            role,
            capture_dns: false,
            dns_capture_port: config::DEFAULT_DNS_CAPTURE_PORT,
            ztunnel_ip: Some("10.0.0.2".parse().unwrap()),
            ztunnel_veth: Some("veth-zt".into()),
            cpu_eth: None,
            offmesh_cluster: None,
            node_name: "node-a".into(),
        }
    }

    fn agent() -> Agent {
        Agent::new(
            config(Role::Collapsed),
            "10.0.0.1".parse().unwrap(),
            Box::new(FakeMembershipSet::default()),
            Box::new(FakeClassifier::default()),
            Box::new(FakeRouteSteering::default()),
            Box::new(FakeTunnelFabric::default()),
        )
    }

    fn pod(uid: &str, ip: &str) -> Pod {
        Pod {
            uid: uid.to_string(),
            namespace: "default".into(),
            name: uid.to_string(),
            ip: Some(ip.parse().unwrap()),
            host_node: "node-a".into(),
            mesh_member: true,
        }
    }

    /// Testable property #1: membership coherence across Add/Add/Delete.
    #[test]
    fn membership_coherence_add_add_delete() {
        let mut a = agent();
        a.install(None, &[]).unwrap();
        a.handle_event(&PodEvent { op: PodOp::Add, pod: pod("U1", "10.244.2.7") });
        a.handle_event(&PodEvent { op: PodOp::Add, pod: pod("U2", "10.244.2.8") });
        a.handle_event(&PodEvent { op: PodOp::Delete, pod: pod("U1", "10.244.2.7") });

        assert_eq!(a.is_tracked("U1"), None);
        assert_eq!(a.is_tracked("U2"), Some("10.244.2.8".parse().unwrap()));
    }

    #[test]
    fn address_change_removes_old_route_before_adding_new() {
        let mut a = agent();
        a.install(None, &[]).unwrap();
        a.handle_event(&PodEvent { op: PodOp::Add, pod: pod("U1", "10.244.2.7") });
        a.handle_event(&PodEvent { op: PodOp::Update, pod: pod("U1", "10.244.2.9") });

        assert_eq!(a.is_tracked("U1"), Some("10.244.2.9".parse().unwrap()));
    }

    #[test]
    fn delete_of_untracked_pod_is_a_no_op() {
        let mut a = agent();
        a.install(None, &[]).unwrap();
        a.handle_event(&PodEvent { op: PodOp::Delete, pod: pod("U9", "10.244.2.99") });
        assert_eq!(a.metrics().events_failed, 0);
    }

    /// When the reconciler has no in-memory record of a pod (e.g. the first
    /// event after a restart), it must consult `MembershipSet::contains`
    /// rather than blindly re-adding — a comment match against a stale IP
    /// is enough to recognize the pod, and the route still gets ensured for
    /// its current address.
    #[test]
    fn restart_recognizes_existing_member_via_contains_and_ensures_route() {
        let membership = FakeMembershipSet::default();
        membership.add_ip("10.244.2.1".parse().unwrap(), "U1").unwrap();

        let mut a = Agent::new(
            config(Role::Collapsed),
            "10.0.0.1".parse().unwrap(),
            Box::new(membership),
            Box::new(FakeClassifier::default()),
            Box::new(FakeRouteSteering::default()),
            Box::new(FakeTunnelFabric::default()),
        );
        a.install(None, &[]).unwrap();
        a.handle_event(&PodEvent { op: PodOp::Add, pod: pod("U1", "10.244.2.7") });

        assert_eq!(a.is_tracked("U1"), Some("10.244.2.7".parse().unwrap()));
        assert_eq!(a.metrics().events_failed, 0);
    }

    #[test]
    fn startup_reconciles_known_pods() {
        let mut a = agent();
        a.install(None, &[pod("U1", "10.244.2.7")]).unwrap();
        assert_eq!(a.is_tracked("U1"), Some("10.244.2.7".parse().unwrap()));
    }

    #[test]
    fn teardown_clears_tracked_state() {
        let mut a = agent();
        a.install(None, &[pod("U1", "10.244.2.7")]).unwrap();
        a.teardown().unwrap();
        assert_eq!(a.is_tracked("U1"), None);
    }
}
