//! Firewall mark space (spec.md §3).
//!
//! A small set of 32-bit masks carved from the skb mark and connmark fields.
//! Each mark has exactly one meaning and they never overlap — see
//! `test_marks_do_not_overlap` below, which is testable property #6.

/// This packet bypasses the proxy (transient, skb mark only).
pub const SKIP_MARK: u32 = 0x0001_0000;

/// Persistent (conntrack-saved) form of [`SKIP_MARK`]; also stamped for
/// host-originated traffic.
pub const CONN_SKIP_MARK: u32 = 0x0002_0000;
pub const CONN_SKIP_MASK: u32 = CONN_SKIP_MARK;

/// Mesh-member outbound flow; must traverse the Outbound table.
pub const OUTBOUND_MARK: u32 = 0x0004_0000;

/// Proxy's original-source return path, persistent form.
pub const PROXY_MARK: u32 = 0x0008_0000;
pub const PROXY_MASK: u32 = PROXY_MARK;

/// Reply direction of a proxy-originated original-source flow.
pub const PROXY_RET_MARK: u32 = 0x0010_0000;

/// All marks/masks that must be pairwise non-overlapping, per spec.md §3.
pub const ALL_MARKS: &[(&str, u32)] = &[
    ("SkipMark", SKIP_MARK),
    ("ConnSkipMark", CONN_SKIP_MARK),
    ("OutboundMark", OUTBOUND_MARK),
    ("ProxyMark", PROXY_MARK),
    ("ProxyRetMark", PROXY_RET_MARK),
];

/// Render a mark as the `value/mask` pair iptables' `-m mark`/`MARK --set-xmark`
/// expect, e.g. `0x10000/0x10000`.
pub fn as_xmark(mark: u32) -> String {
    format!("{mark:#x}/{mark:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_do_not_overlap() {
        for (i, (name_a, a)) in ALL_MARKS.iter().enumerate() {
            for (name_b, b) in ALL_MARKS.iter().skip(i + 1) {
                assert_eq!(
                    a & b,
                    0,
                    "mark {name_a} ({a:#x}) overlaps mark {name_b} ({b:#x})"
                );
            }
        }
    }

    #[test]
    fn xmark_formats_value_and_mask() {
        assert_eq!(as_xmark(SKIP_MARK), "0x10000/0x10000");
    }
}
