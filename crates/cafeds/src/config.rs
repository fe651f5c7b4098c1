// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! Centralizes every port formula, timing constant and environment override
//! used by the cluster. Never hardcode these elsewhere.
//!
//! # Environment
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `CAFEDS_DISCOVERY_PORT` | shared leader discovery port | 37020 |
//! | `CAFEDS_NODE_UDP_BASE` | base for per-node unicast ports | 37100 |
//! | `CAFEDS_SINGLE_PC` | add loopback to the discovery targets | off |
//! | `CAFEDS_WAL_DIR` | directory for persisted node state | `.` |
//!
//! Environment values are read once and cached for the life of the process.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Default shared discovery port. Only the current leader binds it.
pub const DISCOVERY_PORT_DEFAULT: u16 = 37020;

/// Default base for per-node unicast UDP ports (`base + node id`).
pub const NODE_UDP_BASE_DEFAULT: u16 = 37100;

// =======================================================================
// Timings (protocol-required defaults)
// =======================================================================

/// Follower discovery/reconnect loop period.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(1_000);

/// Leader heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1_000);

/// Leader silence after which a follower suspects failure.
pub const LEADER_TIMEOUT: Duration = Duration::from_millis(3_500);

/// How long an election candidate waits for an `ANSWER` from a higher id.
pub const ELECTION_ANSWER_TIMEOUT: Duration = Duration::from_millis(1_200);

/// How long an answered candidate waits for the winner's `COORDINATOR`.
pub const COORDINATOR_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Registry entries unseen for this long are pruned.
pub const PEER_EXPIRY: Duration = Duration::from_millis(5_000);

/// Each heartbeat is sent this many times to ride out isolated UDP drops
/// without tripping the leader timeout.
pub const HEARTBEAT_REDUNDANCY: u32 = 2;

/// Minimum spacing between gap-triggered `RESEND_REQUEST`s.
pub const RESEND_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Re-entry holdoff for the single-flight election guard.
pub const ELECTION_HOLDOFF: Duration = Duration::from_secs(2);

/// Listen window for the startup probes (id availability, existing leader).
pub const PROBE_WINDOW: Duration = Duration::from_secs(1);

/// Follower connect timeout toward the leader's TCP port.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Read timeout on every UDP socket; bounds shutdown latency of listener loops.
pub const UDP_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity of interruptible sleeps in long-lived loops.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =======================================================================
// Environment overrides (read once)
// =======================================================================

fn env_port(name: &str, default: u16) -> u16 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("[config] ignoring invalid {}={}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Shared discovery port, `CAFEDS_DISCOVERY_PORT` override applied.
pub fn discovery_port() -> u16 {
    static PORT: OnceLock<u16> = OnceLock::new();
    *PORT.get_or_init(|| env_port("CAFEDS_DISCOVERY_PORT", DISCOVERY_PORT_DEFAULT))
}

/// Base for per-node unicast ports, `CAFEDS_NODE_UDP_BASE` override applied.
pub fn node_udp_base() -> u16 {
    static BASE: OnceLock<u16> = OnceLock::new();
    *BASE.get_or_init(|| env_port("CAFEDS_NODE_UDP_BASE", NODE_UDP_BASE_DEFAULT))
}

/// Unicast UDP port for a given node id.
#[must_use]
pub fn node_udp_port(node_id: u32) -> u16 {
    node_udp_base().saturating_add(node_id as u16)
}

/// Whether loopback should be part of the discovery targets
/// (`CAFEDS_SINGLE_PC=1|true|yes`, for multi-node testing on one host).
pub fn single_pc() -> bool {
    static SINGLE: OnceLock<bool> = OnceLock::new();
    *SINGLE.get_or_init(|| {
        std::env::var("CAFEDS_SINGLE_PC")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    })
}

/// Directory holding per-node WAL files (`CAFEDS_WAL_DIR`, default cwd).
pub fn wal_dir() -> PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        std::env::var_os("CAFEDS_WAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    })
    .clone()
}

/// WAL file name for a node id.
#[must_use]
pub fn wal_file_name(node_id: u32) -> String {
    format!("cafeds_wal_node_{}.jsonl", node_id)
}

/// WAL path for a node id inside [`wal_dir`].
#[must_use]
pub fn wal_path(node_id: u32) -> PathBuf {
    wal_dir().join(wal_file_name(node_id))
}
