// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Follower-side view of the current leader.

use std::net::IpAddr;
use std::time::{Duration, Instant};

/// What a follower knows about the leader it is tracking. Replaced wholesale
/// on leader change; `last_seen` is refreshed by every accepted heartbeat.
#[derive(Debug, Clone)]
pub struct LeaderView {
    pub id: u32,
    /// Observed source address of the most recent claim. The observed address
    /// wins over the self-reported one: it is what actually routes back on
    /// NAT and multi-NIC hosts.
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub epoch: u64,
    pub last_seq: u64,
    pub last_seen: Instant,
}

impl LeaderView {
    /// Bully-with-epochs ranking: a new claim replaces the current one iff it
    /// carries a higher epoch, or a higher id at the same epoch, or the same
    /// leader reachable off-loopback instead of via loopback, or finally a
    /// longer log when everything else ties.
    #[must_use]
    pub fn outranks(&self, current: Option<&LeaderView>) -> bool {
        let Some(cur) = current else { return true };

        if self.epoch != cur.epoch {
            return self.epoch > cur.epoch;
        }
        if self.id != cur.id {
            return self.id > cur.id;
        }
        if cur.ip.is_loopback() != self.ip.is_loopback() {
            return cur.ip.is_loopback();
        }
        if self.last_seq != cur.last_seq {
            return self.last_seq > cur.last_seq;
        }
        false
    }

    /// Whether the leader has been silent past `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}
