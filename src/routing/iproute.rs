//! `ip`-CLI-backed [`super::RouteSteering`].
//!
//! Grounded on `examples/other_examples`' `ancwrd1-snx-rs` xfrm/route module:
//! routes and rules are mutated by shelling to the real `ip` binary and
//! parsing its textual output, not by constructing netlink messages
//! directly — spec.md §9 documents that the latter has been observed to
//! fail with EINVAL for route construction specifically, and the same
//! shell-out idiom is simplest to apply uniformly to rules and tables too.

use std::net::Ipv4Addr;

use log::{debug, warn};

use super::{parse_route_rows, policy_rules, static_routes, InboundRoute, RoutePlan, RouteSteering};
use crate::cmd;
use crate::config;
use crate::error::AgentResult;

pub struct IpRouteSteering;

impl IpRouteSteering {
    pub fn new() -> Self {
        Self
    }

    fn flush_table(&self, table: u32) {
        // A table with nothing in it errors "table empty"; treat as success.
        cmd::run_best_effort("ip", &["route", "flush", "table", &table.to_string()]);
    }

    fn delete_rule_at(&self, priority: u32) {
        cmd::run_best_effort("ip", &["rule", "del", "pref", &priority.to_string()]);
    }

    /// Whether `table` already has a row matching `route_spec`'s destination
    /// token (an address/prefix, or `default`). Used to make static-route
    /// install idempotent without swallowing genuine `ip route add`
    /// failures (spec.md §7: only "preexisting resource" is success).
    fn static_route_exists(&self, table: u32, route_spec: &str) -> AgentResult<bool> {
        let dst = route_spec.split_whitespace().next().unwrap_or("default");
        let out = cmd::run("ip", &["route", "show", "table", &table.to_string(), dst])?;
        Ok(parse_route_rows(&out).iter().any(|r| r.dst == dst))
    }
}

impl Default for IpRouteSteering {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteSteering for IpRouteSteering {
    fn install(&self, plan: &RoutePlan) -> AgentResult<()> {
        for table in [config::TABLE_INBOUND, config::TABLE_OUTBOUND, config::TABLE_PROXY] {
            self.flush_table(table);
        }

        // A failure on one route/rule must not skip the rest of the batch
        // (spec.md §9 "a failure to add one rule does not skip subsequent
        // rules"): every item is attempted, and only the last error (if any)
        // is surfaced once the whole batch has been tried.
        let mut last_err = None;

        for route in static_routes(plan) {
            match self.static_route_exists(route.table, &route.spec) {
                Ok(true) => {
                    debug!("static route already present in table {}: {}", route.table, route.spec);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "failed to check route in table {}: {}: {e}",
                        route.table, route.spec
                    );
                    last_err = Some(e);
                    continue;
                }
            }
            let owned = route_add_args(route.table, &route.spec);
            let args: Vec<&str> = owned.iter().map(String::as_str).collect();
            if let Err(e) = cmd::run("ip", &args) {
                warn!("failed to add route to table {}: {}: {e}", route.table, route.spec);
                last_err = Some(e);
            }
        }

        // "priority N maps to exactly one agent-owned rule; a repeated
        // install removes the old one before creating the new" (spec.md §3).
        for rule in policy_rules(plan) {
            self.delete_rule_at(rule.priority);
            let mut args = vec!["rule".to_string(), "add".to_string(), "pref".to_string(), rule.priority.to_string()];
            if !rule.selector.is_empty() {
                args.extend(rule.selector.split_whitespace().map(str::to_string));
            }
            args.push("lookup".to_string());
            args.push(rule.table.to_string());
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = cmd::run("ip", &arg_refs) {
                warn!("failed to install policy rule at priority {}: {e}", rule.priority);
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn teardown(&self) -> AgentResult<()> {
        for priority in [
            config::RULE_PRIO_SKIP,
            config::RULE_PRIO_OUTBOUND,
            config::RULE_PRIO_PROXY_RET,
            config::RULE_PRIO_INBOUND,
        ] {
            self.delete_rule_at(priority);
        }
        for table in [config::TABLE_INBOUND, config::TABLE_OUTBOUND, config::TABLE_PROXY] {
            self.flush_table(table);
        }
        Ok(())
    }

    fn add_inbound_route(&self, route: &InboundRoute) -> AgentResult<()> {
        if self.inbound_route_exists(route.pod_ip)? {
            debug!("inbound route for {} already present", route.pod_ip);
            return Ok(());
        }
        let owned = route_add_args(config::TABLE_INBOUND, &route.spec());
        let args: Vec<&str> = owned.iter().map(String::as_str).collect();
        cmd::run("ip", &args).map(|_| ())
    }

    fn remove_inbound_route(&self, pod_ip: Ipv4Addr) -> AgentResult<()> {
        cmd::run_best_effort(
            "ip",
            &[
                "route",
                "del",
                &format!("{pod_ip}/32"),
                "table",
                &config::TABLE_INBOUND.to_string(),
            ],
        );
        Ok(())
    }

    fn inbound_route_exists(&self, pod_ip: Ipv4Addr) -> AgentResult<bool> {
        let dst = format!("{pod_ip}/32");
        let out = cmd::run(
            "ip",
            &["route", "show", "table", &config::TABLE_INBOUND.to_string(), &dst],
        )?;
        // spec.md §4.5/§9: existence is a scalar yes/no derived from `ip
        // route show` text, via the structured-row parser rather than a
        // blind line count (SPEC_FULL.md §11).
        Ok(parse_route_rows(&out).iter().any(|r| r.dst == dst))
    }

    fn inbound_table_contents(&self) -> AgentResult<Vec<String>> {
        let out = cmd::run(
            "ip",
            &["route", "show", "table", &config::TABLE_INBOUND.to_string()],
        )?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }
}

fn route_add_args(table: u32, spec: &str) -> Vec<String> {
    let mut args = vec!["route".to_string(), "add".to_string()];
    args.extend(spec.split_whitespace().map(str::to_string));
    args.push("table".to_string());
    args.push(table.to_string());
    args
}
