// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dynamic peer registry.
//!
//! Populated opportunistically: every inbound message carrying a recognized
//! sender id registers or refreshes the peer under the datagram's source IP.
//! Entries expire after a quiet period so departed nodes drop out of
//! heartbeat fan-out and election target lists.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config;
use crate::net;
use crate::proto::ClusterEntry;

/// A dynamically discovered peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u32,
    pub ip: IpAddr,
    /// Always `NODE_UDP_BASE + id`; kept here so senders need no formula.
    pub udp_port: u16,
    /// 0 until learned from a message that advertises one.
    pub tcp_port: u16,
    pub last_seen: Instant,
}

/// Result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First sighting of this peer.
    New,
    /// Known peer, address/port/liveness refreshed.
    Refreshed,
    /// The message carried our own id from an address that is plausibly us.
    SelfId,
    /// Another host is claiming our id. The cluster will misbehave until the
    /// operator fixes the id assignment.
    ForeignClaim,
}

/// Thread-safe registry of live peers, keyed by node id. Self is never
/// registered.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: u32,
    peers: Mutex<HashMap<u32, PeerInfo>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(self_id: u32) -> Self {
        Self {
            self_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register or refresh a peer observed at `ip`. A zero `tcp_port` never
    /// overwrites a learned one.
    pub fn register(&self, id: u32, ip: IpAddr, tcp_port: u16) -> RegisterOutcome {
        if id == self.self_id {
            return self.classify_self_claim(ip);
        }

        let mut peers = self.peers.lock();
        match peers.get_mut(&id) {
            Some(existing) => {
                existing.ip = ip;
                existing.udp_port = config::node_udp_port(id);
                if tcp_port != 0 {
                    existing.tcp_port = tcp_port;
                }
                existing.last_seen = Instant::now();
                RegisterOutcome::Refreshed
            }
            None => {
                peers.insert(
                    id,
                    PeerInfo {
                        id,
                        ip,
                        udp_port: config::node_udp_port(id),
                        tcp_port,
                        last_seen: Instant::now(),
                    },
                );
                RegisterOutcome::New
            }
        }
    }

    fn classify_self_claim(&self, ip: IpAddr) -> RegisterOutcome {
        let my_ip = net::primary_ip();
        let plausibly_us = ip == my_ip
            || ip.is_loopback()
            || ip.is_unspecified()
            || my_ip.is_loopback();
        if plausibly_us {
            RegisterOutcome::SelfId
        } else {
            RegisterOutcome::ForeignClaim
        }
    }

    #[must_use]
    pub fn peer(&self, id: u32) -> Option<PeerInfo> {
        self.peers.lock().get(&id).cloned()
    }

    /// Snapshot of every known peer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    /// Known ids strictly above `id`, the Bully challenge targets.
    #[must_use]
    pub fn higher_than(&self, id: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .peers
            .lock()
            .keys()
            .copied()
            .filter(|&pid| pid > id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Cluster list gossiped inside heartbeats.
    #[must_use]
    pub fn cluster_entries(&self) -> Vec<ClusterEntry> {
        self.peers
            .lock()
            .values()
            .map(|p| ClusterEntry {
                id: p.id,
                ip: p.ip,
                tcp: p.tcp_port,
            })
            .collect()
    }

    /// Drop peers unseen for longer than `max_age`. Returns how many fell out.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|_, p| p.last_seen.elapsed() <= max_age);
        before - peers.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn first_sighting_is_new_then_refreshed() {
        let reg = PeerRegistry::new(1);
        assert_eq!(reg.register(2, ip(2), 9000), RegisterOutcome::New);
        assert_eq!(reg.register(2, ip(2), 9000), RegisterOutcome::Refreshed);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn zero_tcp_port_does_not_clobber_known_port() {
        let reg = PeerRegistry::new(1);
        reg.register(2, ip(2), 9000);
        reg.register(2, ip(2), 0);
        assert_eq!(reg.peer(2).expect("registered").tcp_port, 9000);
    }

    #[test]
    fn self_id_from_loopback_is_not_registered() {
        let reg = PeerRegistry::new(1);
        let outcome = reg.register(1, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        assert_eq!(outcome, RegisterOutcome::SelfId);
        assert!(reg.is_empty());
    }

    #[test]
    fn higher_than_filters_and_sorts() {
        let reg = PeerRegistry::new(5);
        for id in [3, 9, 7, 2, 12] {
            reg.register(id, ip(id as u8), 0);
        }
        assert_eq!(reg.higher_than(5), vec![7, 9, 12]);
        assert_eq!(reg.higher_than(12), Vec::<u32>::new());
    }

    #[test]
    fn prune_drops_quiet_peers_only() {
        let reg = PeerRegistry::new(1);
        reg.register(2, ip(2), 0);
        assert_eq!(reg.prune(Duration::from_secs(60)), 0);
        assert_eq!(reg.prune(Duration::ZERO), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn cluster_entries_reflect_the_registry() {
        let reg = PeerRegistry::new(1);
        reg.register(2, ip(2), 9000);
        reg.register(3, ip(3), 0);
        let mut entries = reg.cluster_entries();
        entries.sort_by_key(|e| e.id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tcp, 9000);
        assert_eq!(entries[1].tcp, 0);
    }
}
