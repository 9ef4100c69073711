//! Tunnel Fabric (C4): geneve encapsulation endpoints between this node and
//! the proxy, or between the CPU and DPU nodes in split mode (spec.md §4.4).
//!
//! Link/address/route mutation goes through the `ip` binary, the same
//! shell-out idiom as [`crate::routing::iproute`]; procfs tuning is plain
//! file I/O, grounded on the rp_filter/accept_local writes in
//! `examples/other_examples`' `ancwrd1-snx-rs` platform module.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use log::{debug, warn};

use crate::cmd;
use crate::error::AgentResult;

/// One geneve link this node owns (spec.md §3 "Tunnel endpoints").
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub name: String,
    pub vni: u32,
    pub remote: Ipv4Addr,
    /// Local address assigned to the link, as a CIDR (e.g. `169.254.7.1/30`).
    pub local_addr: String,
}

/// The Tunnel Fabric contract: create is link-add, address-assign, link-up,
/// in that order (spec.md §5 "Tunnel creation completes ... before routes
/// referencing that tunnel are added"); destroy is link delete, tolerating
/// absence.
pub trait TunnelFabric {
    fn create(&self, spec: &TunnelSpec) -> AgentResult<()>;
    fn destroy(&self, name: &str) -> AgentResult<()>;
    fn exists(&self, name: &str) -> bool;
    /// AWS-style martian handling: disable rp_filter on every interface
    /// already configured at startup, plus the physical ingress interface
    /// and the `all`/`default` sentinels (spec.md §4.4, §4.5 "writes procfs").
    fn sweep_rp_filter(&self) -> AgentResult<()>;
}

pub struct GeneveTunnelFabric {
    procfs_root: String,
}

impl GeneveTunnelFabric {
    pub fn new() -> Self {
        Self {
            procfs_root: "/proc/sys/net/ipv4/conf".to_string(),
        }
    }

    /// Overrides the procfs root, for tests that write into a tempdir
    /// instead of the real `/proc`.
    #[cfg(test)]
    pub fn with_procfs_root(root: impl Into<String>) -> Self {
        Self {
            procfs_root: root.into(),
        }
    }

    /// Disables reverse-path filtering and enables `accept_local` on `dev`
    /// (spec.md §4.4). Best-effort: a missing procfs entry (interface
    /// renamed/removed mid-tuning) is logged, not fatal.
    pub fn tune_device(&self, dev: &str) {
        self.write_one(dev, "rp_filter", "0");
        self.write_one(dev, "accept_local", "1");
    }

    fn write_one(&self, dev: &str, key: &str, value: &str) {
        let path = Path::new(&self.procfs_root).join(dev).join(key);
        if let Err(e) = fs::write(&path, value) {
            warn!("could not set {key}={value} on {dev}: {e}");
        } else {
            debug!("set {}/{key}={value}", path.display());
        }
    }
}

impl Default for GeneveTunnelFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelFabric for GeneveTunnelFabric {
    fn create(&self, spec: &TunnelSpec) -> AgentResult<()> {
        if self.exists(&spec.name) {
            debug!("tunnel {} already present", spec.name);
        } else {
            cmd::run(
                "ip",
                &[
                    "link",
                    "add",
                    &spec.name,
                    "type",
                    "geneve",
                    "id",
                    &spec.vni.to_string(),
                    "remote",
                    &spec.remote.to_string(),
                ],
            )?;
        }
        cmd::run("ip", &["addr", "replace", &spec.local_addr, "dev", &spec.name])?;
        cmd::run("ip", &["link", "set", &spec.name, "up"])?;
        self.tune_device(&spec.name);
        Ok(())
    }

    fn destroy(&self, name: &str) -> AgentResult<()> {
        // A missing link is success (spec.md §7 "Missing on delete").
        cmd::run_best_effort("ip", &["link", "del", name]);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        cmd::probe("ip", &["link", "show", name])
    }

    fn sweep_rp_filter(&self) -> AgentResult<()> {
        let entries = crate::ctx_err!(fs::read_dir(&self.procfs_root), "list procfs net.ipv4.conf")?;
        for entry in entries {
            let entry = crate::ctx_err!(entry, "read procfs net.ipv4.conf entry")?;
            if let Some(dev) = entry.file_name().to_str() {
                self.write_one(dev, "rp_filter", "0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune_device_writes_rp_filter_and_accept_local() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dir = tmp.path().join("istioin");
        fs::create_dir_all(&dev_dir).unwrap();

        let fabric = GeneveTunnelFabric::with_procfs_root(tmp.path().to_str().unwrap());
        fabric.tune_device("istioin");

        assert_eq!(fs::read_to_string(dev_dir.join("rp_filter")).unwrap(), "0");
        assert_eq!(fs::read_to_string(dev_dir.join("accept_local")).unwrap(), "1");
    }

    #[test]
    fn sweep_rp_filter_covers_every_configured_interface() {
        let tmp = tempfile::tempdir().unwrap();
        for dev in ["all", "default", "eth0"] {
            fs::create_dir_all(tmp.path().join(dev)).unwrap();
        }

        let fabric = GeneveTunnelFabric::with_procfs_root(tmp.path().to_str().unwrap());
        fabric.sweep_rp_filter().unwrap();

        for dev in ["all", "default", "eth0"] {
            assert_eq!(
                fs::read_to_string(tmp.path().join(dev).join("rp_filter")).unwrap(),
                "0"
            );
        }
    }
}
