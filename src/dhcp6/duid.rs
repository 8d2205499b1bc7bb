//! DHCP Unique Identifier generation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the DUID-LLT
/// time base (RFC 3315 section 9.2).
const DUID_EPOCH_OFFSET: u64 = 946_684_800;

/// Build a DUID-LLT (type 1) from a link-layer address and a timestamp:
/// `[0x0001 | hw type 0x0001 | seconds since 2000-01-01 UTC | address]`.
///
/// Generated once per serve; all replies from one server instance carry the
/// same DUID.
pub fn duid_llt(link_layer: &[u8], now: SystemTime) -> Vec<u8> {
    let since_2000 = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        .saturating_sub(DUID_EPOCH_OFFSET) as u32;

    let mut duid = Vec::with_capacity(8 + link_layer.len());
    duid.extend_from_slice(&[0, 1]); // DUID-LLT
    duid.extend_from_slice(&[0, 1]); // hardware type: Ethernet
    duid.extend_from_slice(&since_2000.to_be_bytes());
    duid.extend_from_slice(link_layer);
    duid
}
