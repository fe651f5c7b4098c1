// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # cafeds - totally-ordered command broadcast for a LAN cluster
//!
//! A dynamically discovered cluster of peers elects a single leader which
//! assigns a monotonic sequence number to every submitted command and
//! disseminates it reliably to all followers, so that every live node
//! delivers the same prefix of the same total order. The demo workload is a
//! cafe (waiter submits orders, kitchens deliver them), but the core is a
//! generic ordered command log with leader failover and crash recovery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cafeds::{Node, Role, Ui, text_payload};
//!
//! fn main() -> cafeds::Result<()> {
//!     let node = Node::new(10, Role::Leader, 9000, Ui::Kitchen)?;
//!     node.run()?;
//!     node.submit_order(text_payload("Espresso"))?;
//!     // ... node keeps running until stopped
//!     node.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |                           Node coordinator                        |
//! |   startup probes | promotion/demotion | heartbeat | discovery     |
//! +-------------------------------------------------------------------+
//! |   Election (Bully + epochs)   |   Ordering (sequencer/delivery)   |
//! +-------------------------------------------------------------------+
//! |   Peer registry   |   WAL (fsync-per-delivery, JSONL)             |
//! +-------------------------------------------------------------------+
//! |   UDP bus (discovery, heartbeats, election)  |  TCP (order stream)|
//! +-------------------------------------------------------------------+
//! ```
//!
//! ## Guarantees and non-guarantees
//!
//! - Total-order agreement: two nodes that both deliver sequence `s` deliver
//!   the identical record at `s`.
//! - Prefix delivery: each node's delivered set is a contiguous `[1, k]`.
//! - Liveness through failover: the highest-id reachable node wins the
//!   Bully election and resumes sequencing from its history.
//! - This is leader-lease heartbeating, not consensus: a partitioned subnet
//!   can transiently see two leaders until reconciliation steps one down.
//!
//! ## Modules Overview
//!
//! - [`node`] - top-level coordinator and the public [`Node`] API
//! - [`ordering`] - history and the in-order delivery engine
//! - [`election`] - Bully latches and the single-flight guard
//! - [`cluster`] - peer registry and leader view
//! - [`transport`] - UDP bus and the TCP order stream
//! - [`wal`] - durable delivery log and recovery
//! - [`proto`] - wire message family and codec
//! - [`config`] - ports, timings and environment overrides

/// Cluster membership state (peer registry, leader view).
pub mod cluster;
/// Ports, timing constants and environment overrides.
pub mod config;
/// Election latches and the single-flight guard.
pub mod election;
/// Interface selection and discovery target composition.
pub mod net;
/// Top-level node coordinator.
pub mod node;
/// Total-order history and delivery engine.
pub mod ordering;
/// Wire message family and codec.
pub mod proto;
/// UDP and TCP transports.
pub mod transport;
/// Write-ahead log and recovery.
pub mod wal;

pub use node::{Node, NodeBuilder, NodeStatus, Role, Ui};
pub use proto::{text_payload, Message, OrderRecord, Payload};

/// Errors surfaced through the node API. Transient transport and parse
/// failures never appear here; they are swallowed at the I/O boundary and
/// healed by retransmission.
#[derive(Debug)]
pub enum Error {
    /// The node's unicast UDP port is already bound, meaning a second local
    /// instance of the same node id.
    PortInUse(u16),
    /// Another host on the subnet answered our startup probe for this id.
    IdTaken {
        id: u32,
        claimed_by: std::net::IpAddr,
    },
    /// A listener socket could not be set up.
    BindFailed(String),
    /// A follower operation that needs a leader connection ran without one.
    NotConnected,
    /// The operation does not fit the node's current role or lifecycle.
    InvalidState(String),
    /// Underlying I/O failure.
    IoError(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::PortInUse(port) => {
                write!(f, "UDP port {} already in use (duplicate local instance?)", port)
            }
            Error::IdTaken { id, claimed_by } => {
                write!(f, "node id {} already in use by {}", id, claimed_by)
            }
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::NotConnected => write!(f, "not connected to a leader"),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
