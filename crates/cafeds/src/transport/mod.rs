// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network transports.
//!
//! UDP carries discovery, heartbeats and elections (unreliable,
//! fire-and-forget); TCP carries the order stream (per-connection FIFO,
//! which is what makes single-leader delivery gap-free in the common case).

pub mod tcp;
pub mod udp;

pub use tcp::{ClientConn, LeaderLink, LinkHandler, OrderServer, ServerHandler};
pub use udp::UdpBus;
