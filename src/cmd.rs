//! Thin subprocess wrapper shared by the membership, routing, and tunnel
//! modules.
//!
//! Grounded on the same shell-out pattern the `iptables` crate uses
//! internally for the Packet Classifier, and on `examples/other_examples`'
//! `ip`-CLI wrappers (e.g. the xfrm/VTI tunnel setup in `ancwrd1-snx-rs`):
//! privileged netlink/ipset state is mutated by invoking the real `ip`,
//! `ipset` binaries and parsing their (stable, documented) textual output.
//! spec.md §9 calls this out explicitly for routes: constructing the
//! netlink `Route` object directly has been observed to fail with EINVAL,
//! so route existence/creation goes through the CLI instead.

use std::process::Command;

use log::{debug, warn};

use crate::error::{AgentError, AgentResult};

/// Runs `program` with `args`, returning stdout on success.
///
/// A non-zero exit is turned into an `AgentError::Message` carrying stderr;
/// callers that treat "not found"/"already exists" as success inspect the
/// stderr text themselves before this is called, exactly like the teacher's
/// `append_unique`/`remove_if_rule_exists` check `.exists()` first rather
/// than parsing the error after the fact.
pub fn run(program: &str, args: &[&str]) -> AgentResult<String> {
    debug!("+ {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output().map_err(|e| {
        AgentError::wrap(
            format!("failed to spawn '{program} {}'", args.join(" ")),
            Box::new(e),
        )
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(AgentError::msg(format!(
            "'{program} {}' failed ({}): {stderr}",
            args.join(" "),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Like [`run`], but a failure is logged and absorbed rather than
/// propagated — for steady-state teardown of state that may legitimately
/// already be gone (spec.md §7 "Missing on delete").
pub fn run_best_effort(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args) {
        debug!("best-effort '{program} {}' did not succeed: {e}", args.join(" "));
    }
}

/// Runs `program`, logging (but not failing) if it errors, and returns
/// whether it succeeded. Useful for existence probes implemented as a
/// command whose exit code alone is the answer (e.g. `ip link show DEV`).
pub fn probe(program: &str, args: &[&str]) -> bool {
    match run(program, args) {
        Ok(_) => true,
        Err(e) => {
            debug!("probe '{program} {}' reported absent: {e}", args.join(" "));
            false
        }
    }
}

/// Verifies the binaries the agent depends on are present and runnable,
/// surfacing one `SetUnavailable` error instead of a confusing failure
/// mid-install (SPEC_FULL.md §10, "Startup capability probe").
pub fn check_capabilities() -> AgentResult<()> {
    for program in ["ip", "ipset", "iptables"] {
        if Command::new(program).arg("-V").output().is_err()
            && Command::new(program).arg("--version").output().is_err()
        {
            return Err(AgentError::SetUnavailable(format!(
                "required binary '{program}' is not runnable"
            )));
        }
    }
    warn_if_not_root();
    Ok(())
}

fn warn_if_not_root() {
    // Best-effort: a non-root agent will fail on the first real mutation
    // anyway, but a clear warning up front saves a confusing stack of
    // "Operation not permitted" errors later.
    #[cfg(target_os = "linux")]
    {
        // SAFETY: geteuid takes no arguments and cannot fail.
        let euid = unsafe { libc::geteuid() };
        if euid != 0 {
            warn!("not running as root (euid={euid}); kernel mutations will likely fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout() {
        let out = run("echo", &["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_surfaces_nonzero_exit() {
        let err = run("false", &[]).unwrap_err();
        assert!(err.to_string().contains("false"));
    }

    #[test]
    fn run_best_effort_never_panics_on_missing_binary() {
        run_best_effort("definitely-not-a-real-binary", &["x"]);
    }
}
