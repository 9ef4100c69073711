//! In-memory fakes for the four kernel-facing component traits, usable by
//! both inline unit tests and the integration suite under `tests/`
//! (SPEC_FULL.md §10 "Test tooling"). None of these touch the real kernel,
//! so the scenarios in spec.md §8 run without root.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::AgentResult;
use crate::firewall::{Classifier, ClassifierPlan};
use crate::membership::{MembershipEntry, MembershipSet};
use crate::routing::{InboundRoute, RoutePlan, RouteSteering};
use crate::tunnel::{TunnelFabric, TunnelSpec};

#[derive(Default)]
pub struct FakeMembershipSet {
    entries: RefCell<HashMap<Ipv4Addr, String>>,
    created: RefCell<bool>,
}

impl MembershipSet for FakeMembershipSet {
    fn create(&self) -> AgentResult<()> {
        *self.created.borrow_mut() = true;
        Ok(())
    }
    fn destroy(&self) -> AgentResult<()> {
        *self.created.borrow_mut() = false;
        self.entries.borrow_mut().clear();
        Ok(())
    }
    fn add_ip(&self, ip: Ipv4Addr, uid: &str) -> AgentResult<()> {
        self.entries.borrow_mut().insert(ip, uid.to_string());
        Ok(())
    }
    fn delete_ip(&self, ip: Ipv4Addr) -> AgentResult<()> {
        self.entries.borrow_mut().remove(&ip);
        Ok(())
    }
    fn list(&self) -> AgentResult<Vec<MembershipEntry>> {
        Ok(self
            .entries
            .borrow()
            .iter()
            .map(|(ip, uid)| MembershipEntry {
                ip: *ip,
                comment: Some(uid.clone()),
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeClassifier {
    installed: RefCell<bool>,
    last_plan: RefCell<Option<ClassifierPlan>>,
}

impl Classifier for FakeClassifier {
    fn install(&self, plan: &ClassifierPlan) -> AgentResult<()> {
        *self.installed.borrow_mut() = true;
        *self.last_plan.borrow_mut() = Some(plan.clone());
        Ok(())
    }
    fn teardown(&self) -> AgentResult<()> {
        *self.installed.borrow_mut() = false;
        Ok(())
    }
    fn installed_rules(&self, _table: &str, _chain: &str) -> AgentResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct FakeRouteSteering {
    inbound_routes: RefCell<HashMap<Ipv4Addr, InboundRoute>>,
    installed: RefCell<bool>,
}

impl RouteSteering for FakeRouteSteering {
    fn install(&self, _plan: &RoutePlan) -> AgentResult<()> {
        *self.installed.borrow_mut() = true;
        Ok(())
    }
    fn teardown(&self) -> AgentResult<()> {
        *self.installed.borrow_mut() = false;
        self.inbound_routes.borrow_mut().clear();
        Ok(())
    }
    fn add_inbound_route(&self, route: &InboundRoute) -> AgentResult<()> {
        self.inbound_routes.borrow_mut().insert(route.pod_ip, route.clone());
        Ok(())
    }
    fn remove_inbound_route(&self, pod_ip: Ipv4Addr) -> AgentResult<()> {
        self.inbound_routes.borrow_mut().remove(&pod_ip);
        Ok(())
    }
    fn inbound_route_exists(&self, pod_ip: Ipv4Addr) -> AgentResult<bool> {
        Ok(self.inbound_routes.borrow().contains_key(&pod_ip))
    }
    fn inbound_table_contents(&self) -> AgentResult<Vec<String>> {
        Ok(self
            .inbound_routes
            .borrow()
            .values()
            .map(|r| r.spec())
            .collect())
    }
}

#[derive(Default)]
pub struct FakeTunnelFabric {
    links: RefCell<HashMap<String, TunnelSpec>>,
}

impl TunnelFabric for FakeTunnelFabric {
    fn create(&self, spec: &TunnelSpec) -> AgentResult<()> {
        self.links.borrow_mut().insert(spec.name.clone(), spec.clone());
        Ok(())
    }
    fn destroy(&self, name: &str) -> AgentResult<()> {
        self.links.borrow_mut().remove(name);
        Ok(())
    }
    fn exists(&self, name: &str) -> bool {
        self.links.borrow().contains_key(name)
    }
    fn sweep_rp_filter(&self) -> AgentResult<()> {
        Ok(())
    }
}
