//! Membership Set (C1): the authoritative record of pods redirected on this
//! node, materialized as a kernel ipset (spec.md §4.1).

mod ipset;

use std::net::Ipv4Addr;

pub use ipset::IpsetMembership;

use crate::error::AgentResult;

/// One entry in the set: an IPv4 address and the pod UID the kernel may (or
/// may not, depending on kernel support) have retained as its comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub ip: Ipv4Addr,
    pub comment: Option<String>,
}

/// The Membership Set contract (spec.md §4.1).
///
/// `Create` is idempotent. `AddIP` stores the UID as a comment when the
/// kernel supports it, but [`MembershipSet::contains`] must fall back to
/// matching by IP alone, because some kernels silently drop ipset comments
/// (spec.md §9 "Kernel-set comment support").
pub trait MembershipSet {
    fn create(&self) -> AgentResult<()>;
    fn destroy(&self) -> AgentResult<()>;
    fn add_ip(&self, ip: Ipv4Addr, uid: &str) -> AgentResult<()>;
    /// Absent-on-delete is success, per spec.md §7.
    fn delete_ip(&self, ip: Ipv4Addr) -> AgentResult<()>;
    fn list(&self) -> AgentResult<Vec<MembershipEntry>>;

    /// True if either the comment or the IP matches an entry for `pod_ip`.
    fn contains(&self, pod_ip: Ipv4Addr, pod_uid: &str) -> AgentResult<bool> {
        Ok(self.list()?.into_iter().any(|e| {
            e.ip == pod_ip || e.comment.as_deref() == Some(pod_uid)
        }))
    }
}
