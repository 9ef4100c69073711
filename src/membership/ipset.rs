//! ipset-backed [`super::MembershipSet`].
//!
//! Grounded on `firewall/iptables.rs`'s `append_unique`/`chain_exists`
//! style: check-then-act helpers that swallow "already in the desired
//! state" rather than bubbling it as an error, and log at `debug!` either
//! way. ipset itself exposes this as the `-exist` flag (idempotent add/del),
//! which we lean on directly instead of re-implementing the check client-side.

use std::net::Ipv4Addr;

use log::debug;

use super::{MembershipEntry, MembershipSet};
use crate::cmd;
use crate::error::{AgentError, AgentResult};

pub struct IpsetMembership {
    name: String,
}

impl IpsetMembership {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl MembershipSet for IpsetMembership {
    fn create(&self) -> AgentResult<()> {
        // `-exist`: treat "set already exists" as success (spec.md §4.1).
        match cmd::run(
            "ipset",
            &["create", &self.name, "hash:ip", "comment", "-exist"],
        ) {
            Ok(_) => {
                debug!("ipset {} ready", self.name);
                Ok(())
            }
            Err(e) => Err(AgentError::SetUnavailable(format!(
                "could not create ipset {}: {e}",
                self.name
            ))),
        }
    }

    fn destroy(&self) -> AgentResult<()> {
        // A missing set is not an error (spec.md §7 "Missing on delete").
        cmd::run_best_effort("ipset", &["destroy", &self.name]);
        Ok(())
    }

    fn add_ip(&self, ip: Ipv4Addr, uid: &str) -> AgentResult<()> {
        let ip_str = ip.to_string();
        crate::ctx_err!(
            cmd::run("ipset", &["add", &self.name, &ip_str, "comment", uid, "-exist"]),
            format!("add {ip} to ipset {}", self.name)
        )
        .map(|_| ())
    }

    fn delete_ip(&self, ip: Ipv4Addr) -> AgentResult<()> {
        let ip_str = ip.to_string();
        // `-exist` also suppresses "element doesn't exist" on delete.
        cmd::run_best_effort("ipset", &["del", &self.name, &ip_str, "-exist"]);
        Ok(())
    }

    fn list(&self) -> AgentResult<Vec<MembershipEntry>> {
        let out = crate::ctx_err!(cmd::run("ipset", &["list", &self.name, "-output", "plain"]), "list ipset")?;
        parse_ipset_list(&out)
    }
}

/// Parses `ipset list <name> -output plain` output.
///
/// Format (abridged):
/// ```text
/// Name: ztunnel-pods
/// Type: hash:ip
/// ...
/// Members:
/// 10.244.2.7 comment "U1"
/// 10.244.2.8
/// ```
///
/// A members line whose first token does not parse as an IPv4 address is a
/// malformed kernel-set entry (spec.md §4.1 `EntryInvalid`) rather than
/// something to quietly skip over — the kernel's own listing is the one
/// place an address this crate didn't construct itself (always via typed
/// `Ipv4Addr` parameters) flows back in as text.
fn parse_ipset_list(out: &str) -> AgentResult<Vec<MembershipEntry>> {
    let mut entries = Vec::new();
    let mut in_members = false;
    for line in out.lines() {
        if line.trim() == "Members:" {
            in_members = true;
            continue;
        }
        if !in_members {
            continue;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let Some(ip_str) = parts.next() else { continue };
        let ip = ip_str.parse::<Ipv4Addr>().map_err(|_| {
            AgentError::EntryInvalid(format!("malformed IPv4 address in ipset entry: {ip_str}"))
        })?;
        let comment = parts
            .next()
            .and_then(|rest| rest.split_once("comment \""))
            .and_then(|(_, rest)| rest.strip_suffix('"').or(Some(rest)))
            .map(|s| s.trim_end_matches('"').to_string());
        entries.push(MembershipEntry { ip, comment });
    }
    Ok(entries)
}
