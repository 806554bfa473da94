// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Environment-driven configuration.
//!
//! Each flag is probed at most once per process; changing the environment
//! after the first query has no effect.

use std::sync::OnceLock;

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

/// `NURSERY_CLOSING_RUNTIME_GUARD=1` — enable the deadlock guard on
/// blocking recv from inside the channel's autoclose nursery.
pub fn closing_guard_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("NURSERY_CLOSING_RUNTIME_GUARD"))
}

/// `SPAWN_TIMING=1` — collect spawn-latency decomposition counters.
pub fn spawn_timing_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| env_flag("SPAWN_TIMING"))
}
