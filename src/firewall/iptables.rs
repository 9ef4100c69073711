//! Real `iptables`-crate-backed [`super::Classifier`].
//!
//! Grounded directly on `examples/mheon-netavark/src/firewall/iptables.rs`:
//! the same check-then-act helpers (`append_unique`, `add_chain_unique`,
//! `chain_exists`, `remove_chain_and_rules`, `remove_if_rule_exists`) that
//! swallow "already in the desired state" and log at `debug!` either way.
//! The helpers are generalized here to work against a small [`Backend`]
//! trait instead of `iptables::IPTables` directly, so the ordering/variant
//! tests in `super` and the integration suite can run against an in-memory
//! fake without root (spec.md §9's netlink-avoidance rationale applies
//! equally to testability: shelling out is also what makes this mockable).

use std::error::Error;

use log::{debug, warn};

use super::{batch_a_rules, batch_b_rules, Classifier, ClassifierPlan};
use crate::config::{
    CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, CHAIN_POSTROUTING, CHAIN_PREROUTING,
};
use crate::error::{AgentError, AgentResult, StringError};

/// `iptables::IPTables` methods return `Box<dyn Error>`, not `Send + Sync`;
/// this bridges into `AgentError::wrap`'s required bound, same role as the
/// `StringError` conversion in `error.rs`.
fn wrap_err(msg: impl Into<String>, e: Box<dyn Error>) -> AgentError {
    AgentError::wrap(msg.into(), Box::new(StringError(e.to_string())))
}

/// The subset of `iptables::IPTables` the classifier needs, so a fake can
/// stand in for it in tests.
pub trait Backend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>>;
    fn flush_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>>;
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>>;
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>>;
    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<bool, Box<dyn Error>>;
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>>;
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Box<dyn Error>>;
}

/// The real backend, thinly wrapping `iptables::IPTables`.
pub struct RealBackend {
    conn: iptables::IPTables,
}

impl RealBackend {
    pub fn new() -> AgentResult<Self> {
        let conn = iptables::new(false)
            .map_err(|e| wrap_err("open iptables (ipv4) connection", e))?;
        Ok(Self { conn })
    }
}

impl Backend for RealBackend {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>> {
        Ok(self.conn.list_chains(table)?.iter().any(|c| c == chain))
    }
    fn new_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.new_chain(table, chain)
    }
    fn flush_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.flush_chain(table, chain)
    }
    fn delete_chain(&self, table: &str, chain: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.delete_chain(table, chain)
    }
    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.exists(table, chain, rule)
    }
    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.append(table, chain, rule)
    }
    fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<bool, Box<dyn Error>> {
        self.conn.insert(table, chain, rule, position)
    }
    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<bool, Box<dyn Error>> {
        self.conn.delete(table, chain, rule)
    }
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>, Box<dyn Error>> {
        self.conn.list(table, chain)
    }
}

/// Append `rule` to `table`/`chain` unless it is already present.
fn append_unique<B: Backend>(
    backend: &B,
    table: &str,
    chain: &str,
    rule: &str,
) -> AgentResult<()> {
    let exists = backend
        .exists(table, chain, rule)
        .map_err(|e| wrap_err(format!("check rule in {table}/{chain}"), e))?;
    if exists {
        debug!("rule `{rule}` already present in {table}/{chain}");
        return Ok(());
    }
    backend
        .append(table, chain, rule)
        .map(|_| debug!("appended `{rule}` to {table}/{chain}"))
        .map_err(|e| wrap_err(format!("append rule to {table}/{chain}"), e))
}

/// Create `chain` in `table` unless it already exists.
fn add_chain_unique<B: Backend>(backend: &B, table: &str, chain: &str) -> AgentResult<()> {
    let exists = backend
        .chain_exists(table, chain)
        .map_err(|e| wrap_err(format!("check chain {table}/{chain}"), e))?;
    if exists {
        debug!("chain {table}/{chain} already exists");
        return Ok(());
    }
    backend
        .new_chain(table, chain)
        .map(|_| debug!("created chain {table}/{chain}"))
        .map_err(|e| wrap_err(format!("create chain {table}/{chain}"), e))
}

/// Flush and delete `chain`, doing nothing if it is already absent
/// (spec.md §7 "Missing on delete").
fn remove_chain_and_rules<B: Backend>(backend: &B, table: &str, chain: &str) -> AgentResult<()> {
    let exists = backend
        .chain_exists(table, chain)
        .map_err(|e| wrap_err(format!("check chain {table}/{chain}"), e))?;
    if !exists {
        return Ok(());
    }
    backend
        .flush_chain(table, chain)
        .map_err(|e| wrap_err(format!("flush chain {table}/{chain}"), e))?;
    backend
        .delete_chain(table, chain)
        .map(|_| ())
        .map_err(|e| wrap_err(format!("delete chain {table}/{chain}"), e))
}

/// Delete `rule` from `table`/`chain` if present; a missing rule is success.
fn remove_if_rule_exists<B: Backend>(
    backend: &B,
    table: &str,
    chain: &str,
    rule: &str,
) -> AgentResult<()> {
    let exists = backend
        .exists(table, chain, rule)
        .map_err(|e| wrap_err(format!("check rule in {table}/{chain}"), e))?;
    if !exists {
        return Ok(());
    }
    backend
        .delete(table, chain, rule)
        .map(|_| ())
        .map_err(|e| wrap_err(format!("delete rule from {table}/{chain}"), e))
}

/// The single built-in-chain jump whose presence gates fresh-install vs
/// flush-and-reinstall (spec.md §4.2 "first checks whether its top-level
/// jump exists").
fn sentinel_jump() -> (&'static str, &'static str, &'static str) {
    ("mangle", "PREROUTING", CHAIN_PREROUTING)
}

/// Every built-in chain the agent jumps from, paired with its table and the
/// owned chain it jumps to.
fn jumps() -> [(&'static str, &'static str, &'static str); 6] {
    [
        ("mangle", "PREROUTING", CHAIN_PREROUTING),
        ("mangle", "INPUT", CHAIN_INPUT),
        ("mangle", "FORWARD", CHAIN_FORWARD),
        ("mangle", "OUTPUT", CHAIN_OUTPUT),
        ("nat", "PREROUTING", CHAIN_PREROUTING),
        ("nat", "POSTROUTING", CHAIN_POSTROUTING),
    ]
}

fn jump_rule(owned_chain: &str) -> String {
    format!("-j {owned_chain}")
}

pub struct IptablesClassifier<B: Backend = RealBackend> {
    backend: B,
}

impl IptablesClassifier<RealBackend> {
    pub fn new() -> AgentResult<Self> {
        Ok(Self {
            backend: RealBackend::new()?,
        })
    }
}

impl<B: Backend> IptablesClassifier<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    fn owned_chains(&self) -> [(&'static str, &'static str); 6] {
        [
            ("mangle", CHAIN_PREROUTING),
            ("mangle", CHAIN_INPUT),
            ("mangle", CHAIN_FORWARD),
            ("mangle", CHAIN_OUTPUT),
            ("nat", CHAIN_PREROUTING),
            ("nat", CHAIN_POSTROUTING),
        ]
    }
}

impl<B: Backend> Classifier for IptablesClassifier<B> {
    fn install(&self, plan: &ClassifierPlan) -> AgentResult<()> {
        let (sentinel_table, sentinel_builtin, sentinel_owned) = sentinel_jump();
        let already_installed = self
            .backend
            .chain_exists(sentinel_table, sentinel_owned)
            .map_err(|e| wrap_err("check classifier installation state", e))?
            && self
                .backend
                .exists(sentinel_table, sentinel_builtin, &jump_rule(sentinel_owned))
                .map_err(|e| wrap_err("check classifier top-level jump", e))?;

        // A failure on one chain/rule/jump must not skip the rest of the
        // batch (spec.md §9 "a failure to add one rule does not skip
        // subsequent rules"): every item is attempted, and only the last
        // error (if any) is surfaced once the whole batch has been tried.
        let mut last_err = None;

        for (table, chain) in self.owned_chains() {
            if let Err(e) = add_chain_unique(&self.backend, table, chain) {
                warn!("failed to create chain {table}/{chain}: {e}");
                last_err = Some(e);
            }
            if already_installed {
                // Reinstall: flush without touching the jump that is already
                // in place (spec.md §4.2 idempotent install).
                if let Err(e) = self
                    .backend
                    .flush_chain(table, chain)
                    .map_err(|e| wrap_err(format!("flush chain {table}/{chain}"), e))
                {
                    warn!("failed to flush chain {table}/{chain}: {e}");
                    last_err = Some(e);
                }
            }
        }

        for (table, builtin, owned) in jumps() {
            if let Err(e) = append_unique(&self.backend, table, builtin, &jump_rule(owned)) {
                warn!("failed to install jump into {table}/{builtin}: {e}");
                last_err = Some(e);
            }
        }

        for (table, chain, rule) in batch_a_rules(plan) {
            if let Err(e) = append_unique(&self.backend, table, chain, &rule) {
                warn!("failed to append rule `{rule}` to {table}/{chain}: {e}");
                last_err = Some(e);
            }
        }
        for (table, chain, rule) in batch_b_rules(plan) {
            if let Err(e) = append_unique(&self.backend, table, chain, &rule) {
                warn!("failed to append rule `{rule}` to {table}/{chain}: {e}");
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn teardown(&self) -> AgentResult<()> {
        for (table, builtin, owned) in jumps() {
            remove_if_rule_exists(&self.backend, table, builtin, &jump_rule(owned))?;
        }
        for (table, chain) in self.owned_chains() {
            remove_chain_and_rules(&self.backend, table, chain)?;
        }
        Ok(())
    }

    fn installed_rules(&self, table: &str, chain: &str) -> AgentResult<Vec<String>> {
        let lines = self
            .backend
            .list(table, chain)
            .map_err(|e| wrap_err(format!("list rules in {table}/{chain}"), e))?;
        // iptables-save-style output prefixes each rule with "-A <chain> ".
        let prefix = format!("-A {chain} ");
        Ok(lines
            .into_iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}
