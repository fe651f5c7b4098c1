// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast-capable UDP endpoint.
//!
//! Two of these exist per cluster: every node binds its own unicast port
//! (`NODE_UDP_BASE + id`), and whoever currently leads additionally binds
//! the shared discovery port. The unicast bind deliberately leaves
//! SO_REUSEADDR off so a second local instance of the same node id fails
//! fast at startup instead of stealing datagrams.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config;
use crate::proto::{self, Message};

/// One bound datagram socket with the cluster's send/receive conventions:
/// broadcast enabled, short read timeout so listener loops can poll their
/// stop flag, sends fire-and-forget.
#[derive(Debug)]
pub struct UdpBus {
    socket: UdpSocket,
    port: u16,
}

impl UdpBus {
    /// Bind `0.0.0.0:port`. `reuse_addr` is on for the shared discovery port
    /// (fast rebind across leader handovers) and off for unicast ports.
    pub fn bind(port: u16, reuse_addr: bool) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if reuse_addr {
            socket.set_reuse_address(true)?;
        }
        socket.set_broadcast(true)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(config::UDP_RECV_TIMEOUT))?;
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one record. Unreliable by contract; failures are logged at debug
    /// and otherwise swallowed, reliability lives in the layers above.
    pub fn send_to(&self, msg: &Message, ip: IpAddr, port: u16) {
        let data = proto::encode(msg);
        if let Err(err) = self.socket.send_to(&data, SocketAddr::new(ip, port)) {
            log::debug!("[udp] send to {}:{} failed: {}", ip, port, err);
        }
    }

    /// Receive one record. Returns `None` on timeout, on a malformed
    /// datagram, or on a transient socket error; callers loop and consult
    /// their stop flag between calls.
    pub fn recv(&self) -> Option<(Message, SocketAddr)> {
        let mut buf = [0u8; 65_535];
        match self.socket.recv_from(&mut buf) {
            Ok((len, src)) => proto::decode(&buf[..len]).map(|msg| (msg, src)),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                log::debug!("[udp] recv on port {} failed: {}", self.port, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_round_trip_on_loopback() {
        let a = UdpBus::bind(0, false).expect("bind a");
        let b = UdpBus::bind(0, false).expect("bind b");

        let msg = Message::ResendRequest { from_seq: 4 };
        a.send_to(&msg, IpAddr::V4(Ipv4Addr::LOCALHOST), b.port());

        let (received, _) = b.recv().expect("datagram should arrive on loopback");
        assert_eq!(received, msg);
    }

    #[test]
    fn recv_times_out_quietly() {
        let bus = UdpBus::bind(0, false).expect("bind");
        assert!(bus.recv().is_none());
    }

    #[test]
    fn duplicate_unicast_bind_is_refused() {
        let first = UdpBus::bind(0, false).expect("bind");
        assert!(UdpBus::bind(first.port(), false).is_err());
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let a = UdpBus::bind(0, false).expect("bind a");
        let b = UdpBus::bind(0, false).expect("bind b");
        a.socket
            .send_to(b"definitely not json", (Ipv4Addr::LOCALHOST, b.port()))
            .expect("raw send");
        assert!(b.recv().is_none());
    }
}
