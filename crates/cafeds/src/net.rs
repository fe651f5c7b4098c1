// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface selection and discovery target composition.
//!
//! Peers that have never been heard from can only be reached by broadcast.
//! The discovery target list is the set of addresses a datagram is sprayed
//! to in that case: the global broadcast, the /24 directed broadcast of the
//! primary interface, and loopback when single-host mode is on.

use std::net::{IpAddr, Ipv4Addr};

use crate::config;

/// Best-effort primary interface IP. Falls back to loopback when the host
/// has no routable interface.
#[must_use]
pub fn primary_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(err) => {
            log::debug!("[net] primary interface lookup failed: {}", err);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// /24 directed broadcast for `ip`. Enough for campus and home LANs; hosts
/// on wider subnets are still covered by the global broadcast.
#[must_use]
pub fn guess_directed_broadcast(ip: IpAddr) -> IpAddr {
    if let IpAddr::V4(v4) = ip {
        if !v4.is_loopback() {
            let o = v4.octets();
            return IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], 255));
        }
    }
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

/// Addresses used to reach as-yet-unknown peers, in send order, deduplicated.
#[must_use]
pub fn discovery_targets() -> Vec<IpAddr> {
    let mut targets = vec![IpAddr::V4(Ipv4Addr::BROADCAST)];

    let ip = primary_ip();
    let directed = guess_directed_broadcast(ip);
    if !targets.contains(&directed) {
        targets.push(directed);
    }

    if config::single_pc() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        if !targets.contains(&loopback) {
            targets.push(loopback);
        }
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_broadcast_uses_slash_24() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(
            guess_directed_broadcast(ip),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 255))
        );
    }

    #[test]
    fn loopback_maps_to_global_broadcast() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(guess_directed_broadcast(ip), IpAddr::V4(Ipv4Addr::BROADCAST));
    }

    #[test]
    fn targets_start_with_global_broadcast_and_have_no_duplicates() {
        let targets = discovery_targets();
        assert_eq!(targets[0], IpAddr::V4(Ipv4Addr::BROADCAST));
        let mut seen = targets.clone();
        seen.dedup();
        assert_eq!(seen.len(), targets.len());
    }
}
