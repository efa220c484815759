//! Bandwidth shaping on a container's host interface.

use serde::{Deserialize, Serialize};

/// A token-bucket bandwidth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandwidthLimit {
    /// Sustained rate in bytes per second.
    pub rate: u64,
    /// Burst size in bytes.
    pub burst: u64,
}

/// tc invocation replacing the root qdisc of `interface` with a token
/// bucket.
#[must_use]
pub fn tbf(interface: &str, limit: &BandwidthLimit) -> Vec<String> {
    vec![
        "qdisc".to_string(),
        "replace".to_string(),
        "dev".to_string(),
        interface.to_string(),
        "root".to_string(),
        "tbf".to_string(),
        "rate".to_string(),
        format!("{}bit", limit.rate.saturating_mul(8)),
        "burst".to_string(),
        limit.burst.max(1).to_string(),
        "latency".to_string(),
        "25ms".to_string(),
    ]
}
