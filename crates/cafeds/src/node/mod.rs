// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node coordinator.
//!
//! Ties the transports, the peer registry, the ordering engine and the
//! election plumbing into one process-level state machine. Role is state,
//! not identity: any node can be promoted into the leader role or demoted
//! out of it at runtime.
//!
//! # Thread model
//!
//! `run()` spawns one long-lived thread per concern: the unicast UDP
//! listener, the follower discovery/reconnect loop and the leader heartbeat
//! loop (role-gated, it idles while following). The discovery-port listener
//! lives only while the node holds the leader role, and election tasks are
//! spawned on demand under a single-flight guard. Every loop polls the stop
//! flag at least every 500 ms.
//!
//! Lock order, outermost first: election guard, history, delivery, peers,
//! tcp. No lock is held across a blocking network call.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::cluster::{LeaderView, PeerRegistry, RegisterOutcome};
use crate::config;
use crate::election::{ElectionGuard, Latch};
use crate::net;
use crate::ordering::{DeliveryState, Disposition, History};
use crate::proto::{Message, OrderRecord, Payload};
use crate::transport::{LeaderLink, LinkHandler, OrderServer, ServerHandler, UdpBus};
use crate::wal::Wal;
use crate::{Error, Result};

/// Cluster role of a node. Mutable at runtime via promotion and demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Which demo surface the operator attached to this node. The core only
/// stores it; the binary decides what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ui {
    Waiter,
    Kitchen,
}

impl std::fmt::Display for Ui {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ui::Waiter => write!(f, "waiter"),
            Ui::Kitchen => write!(f, "kitchen"),
        }
    }
}

/// Point-in-time snapshot of a node's externally observable state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u32,
    pub role: Role,
    pub epoch: u64,
    pub last_seq: u64,
    pub expected_seq: u64,
    pub leader_id: Option<u32>,
    pub peer_count: usize,
    pub tcp_connected: bool,
}

/// Builder for [`Node`]. The WAL knobs exist mostly for tests and for
/// operators who want persisted state somewhere other than the working
/// directory.
pub struct NodeBuilder {
    id: u32,
    role: Role,
    tcp_port: u16,
    ui: Ui,
    wal_dir: Option<PathBuf>,
    wal_enabled: bool,
}

impl NodeBuilder {
    #[must_use]
    pub fn ui(mut self, ui: Ui) -> Self {
        self.ui = ui;
        self
    }

    /// Override the directory holding this node's WAL file.
    #[must_use]
    pub fn wal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.wal_dir = Some(dir.into());
        self
    }

    /// Disable disk persistence entirely.
    #[must_use]
    pub fn wal(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    /// Bind the node's unicast port, replay the WAL and assemble the node.
    /// Fails with [`Error::PortInUse`] when another local instance of this
    /// node id is running.
    pub fn build(self) -> Result<Node> {
        let udp_port = config::node_udp_port(self.id);
        let udp = UdpBus::bind(udp_port, false).map_err(|err| {
            if err.kind() == io::ErrorKind::AddrInUse {
                log::error!(
                    "[node] port {} is already in use; is node {} already running on this host?",
                    udp_port,
                    self.id
                );
                Error::PortInUse(udp_port)
            } else {
                Error::from(err)
            }
        })?;

        let wal = if self.wal_enabled {
            let dir = self.wal_dir.unwrap_or_else(config::wal_dir);
            Wal::new(dir.join(config::wal_file_name(self.id)))
        } else {
            Wal::disabled()
        };

        let mut history = History::new();
        let mut seen_uuids = HashSet::new();
        for rec in wal.recover().records {
            seen_uuids.insert(rec.order_uuid.clone());
            history.record(rec);
        }
        let mut delivery = DeliveryState::new();
        delivery.fast_forward(history.last_seq());

        let inner = Arc::new(NodeInner {
            id: self.id,
            tcp_port: self.tcp_port,
            ui: self.ui,
            role: Mutex::new(self.role),
            epoch: AtomicU64::new(1),
            udp,
            disc: Mutex::new(None),
            history: Mutex::new(history),
            delivery: Mutex::new(delivery),
            seen_uuids: Mutex::new(seen_uuids),
            peers: PeerRegistry::new(self.id),
            leader: Mutex::new(None),
            server: Mutex::new(None),
            link: LeaderLink::new(),
            wal,
            answer_latch: Latch::new(),
            coordinator_latch: Latch::new(),
            election_guard: ElectionGuard::new(),
            stop: AtomicBool::new(false),
        });

        Ok(Node {
            inner,
            threads: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// A cluster participant. Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Node {
    /// Start building a node with the given identity, requested role and
    /// operator-assigned TCP port.
    #[must_use]
    pub fn builder(id: u32, role: Role, tcp_port: u16) -> NodeBuilder {
        NodeBuilder {
            id,
            role,
            tcp_port,
            ui: Ui::Kitchen,
            wal_dir: None,
            wal_enabled: true,
        }
    }

    /// Convenience constructor matching the operator surface.
    pub fn new(id: u32, role: Role, tcp_port: u16, ui: Ui) -> Result<Node> {
        Self::builder(id, role, tcp_port).ui(ui).build()
    }

    /// Run the startup probes, then launch the long-lived threads. Returns
    /// once the node is up; it keeps running until [`stop`](Self::stop).
    pub fn run(&self) -> Result<()> {
        let this = &self.inner;

        NodeInner::check_id_available(this)?;

        if *this.role.lock() == Role::Leader {
            if let Some(view) = NodeInner::probe_existing_leader(this) {
                log::warn!(
                    "[node] another leader (id={}) is already active, demoting to follower",
                    view.id
                );
                *this.role.lock() = Role::Follower;
                *this.leader.lock() = Some(view);
            }
        }

        {
            let inner = Arc::clone(this);
            self.spawn("udp", move || NodeInner::udp_node_loop(&inner));
        }

        if *this.role.lock() == Role::Leader {
            NodeInner::bind_discovery(this);
            NodeInner::start_server(this);
        }

        {
            let inner = Arc::clone(this);
            self.spawn("heartbeat", move || NodeInner::heartbeat_loop(&inner));
        }
        {
            let inner = Arc::clone(this);
            self.spawn("discovery", move || NodeInner::discovery_loop(&inner));
        }

        log::info!(
            "[node] id={} running as {} (udp={} tcp={})",
            this.id,
            *this.role.lock(),
            this.udp.port(),
            this.tcp_port
        );
        Ok(())
    }

    /// Signal every loop to stop, close the sockets and join the tracked
    /// threads. Connections close abruptly; durability comes from the WAL
    /// being synced before each delivery was acknowledged.
    pub fn stop(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[node] id={} stopping", self.inner.id);
        self.inner.link.close();
        if let Some(mut server) = self.inner.server.lock().take() {
            server.stop();
        }
        *self.inner.disc.lock() = None;
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Submit an order into the total order. A leader sequences it locally;
    /// a follower forwards it to the leader it is connected to.
    pub fn submit_order(&self, payload: Payload) -> Result<()> {
        let this = &self.inner;
        let order_uuid = Uuid::new_v4().to_string();

        if *this.role.lock() == Role::Leader {
            this.admit_uuid(&order_uuid);
            log::info!("[node] local order accepted, sequencing and broadcasting");
            NodeInner::sequence_and_fan_out(this, order_uuid, payload, Some(this.id));
            return Ok(());
        }

        if !this.link.is_connected() {
            log::warn!("[node] cannot submit order: not connected to a leader yet");
            return Err(Error::NotConnected);
        }
        this.link.send(&Message::NewOrder {
            sender_id: this.id,
            order_uuid: order_uuid.clone(),
            payload,
        })?;
        log::info!("[node] sent NEW_ORDER uuid={}", order_uuid);
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    #[must_use]
    pub fn ui(&self) -> Ui {
        self.inner.ui
    }

    #[must_use]
    pub fn role(&self) -> Role {
        *self.inner.role.lock()
    }

    #[must_use]
    pub fn leader_id(&self) -> Option<u32> {
        self.inner.leader.lock().as_ref().map(|v| v.id)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::Relaxed)
    }

    /// Snapshot the observable state. The fields are read under their own
    /// locks, so the snapshot is per-field consistent, not globally atomic.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let this = &self.inner;
        NodeStatus {
            id: this.id,
            role: *this.role.lock(),
            epoch: this.epoch.load(Ordering::SeqCst),
            last_seq: this.history.lock().last_seq(),
            expected_seq: this.delivery.lock().expected_seq(),
            leader_id: this.leader.lock().as_ref().map(|v| v.id),
            peer_count: this.peers.len(),
            tcp_connected: this.link.is_connected(),
        }
    }

    /// Payload of the order at `seq`, if this node has observed it.
    #[must_use]
    pub fn history_payload(&self, seq: u64) -> Option<Payload> {
        self.inner.history.lock().get(seq).map(|r| r.payload.clone())
    }

    fn spawn<F: FnOnce() + Send + 'static>(&self, name: &str, f: F) {
        match thread::Builder::new()
            .name(format!("cafeds-{}", name))
            .spawn(f)
        {
            Ok(handle) => self.threads.lock().push(handle),
            Err(err) => log::error!("[node] failed to spawn {} thread: {}", name, err),
        }
    }
}

struct NodeInner {
    id: u32,
    tcp_port: u16,
    ui: Ui,
    role: Mutex<Role>,
    epoch: AtomicU64,
    /// Per-node unicast endpoint, bound for the life of the process.
    udp: UdpBus,
    /// Shared discovery endpoint, bound only while in the leader role.
    disc: Mutex<Option<Arc<UdpBus>>>,
    history: Mutex<History>,
    delivery: Mutex<DeliveryState>,
    seen_uuids: Mutex<HashSet<String>>,
    peers: PeerRegistry,
    leader: Mutex<Option<LeaderView>>,
    server: Mutex<Option<OrderServer>>,
    link: LeaderLink,
    wal: Wal,
    answer_latch: Latch<()>,
    coordinator_latch: Latch<LeaderView>,
    election_guard: ElectionGuard,
    stop: AtomicBool,
}

impl NodeInner {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn sleep_with_stop(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.stopped() {
            thread::sleep(config::STOP_POLL_INTERVAL);
        }
    }

    /// True when the uuid was not seen before and is now recorded.
    fn admit_uuid(&self, order_uuid: &str) -> bool {
        if order_uuid.is_empty() {
            return true;
        }
        self.seen_uuids.lock().insert(order_uuid.to_string())
    }

    fn note_peer(&self, id: u32, ip: std::net::IpAddr, tcp_port: u16) {
        match self.peers.register(id, ip, tcp_port) {
            RegisterOutcome::New => {
                log::info!("[node] peer discovered: id={} ip={} tcp={}", id, ip, tcp_port);
            }
            RegisterOutcome::ForeignClaim => {
                log::warn!(
                    "[node] DUPLICATE NODE ID: another node at {} claims id={}; \
                     the cluster will misbehave until every node has a unique --id",
                    ip,
                    id
                );
            }
            RegisterOutcome::Refreshed | RegisterOutcome::SelfId => {}
        }
    }

    // ------------------------------------------------------------------
    // Startup probes
    // ------------------------------------------------------------------

    /// Probe the subnet for another holder of our id. Any matching
    /// `ID_TAKEN` within the window aborts startup.
    fn check_id_available(this: &Arc<Self>) -> Result<()> {
        let token = Uuid::new_v4().to_string();
        let probe = Message::IdCheck {
            node_id: this.id,
            token: token.clone(),
        };
        this.broadcast_to_discovery(&probe, this.udp.port());

        log::info!("[node] checking whether node id {} is free on the subnet", this.id);
        let deadline = Instant::now() + config::PROBE_WINDOW;
        while Instant::now() < deadline && !this.stopped() {
            let Some((msg, src)) = this.udp.recv() else { continue };
            if let Message::IdTaken {
                node_id,
                token: reply_token,
            } = msg
            {
                if node_id == this.id && reply_token == token {
                    log::error!(
                        "[node] node id {} is already in use by {}; choose a different --id",
                        this.id,
                        src.ip()
                    );
                    return Err(Error::IdTaken {
                        id: this.id,
                        claimed_by: src.ip(),
                    });
                }
            }
        }
        log::info!("[node] node id {} is available", this.id);
        Ok(())
    }

    /// Ask the discovery port whether a leader already exists. Used only
    /// when the operator requested the leader role, to avoid transient dual
    /// leaders.
    fn probe_existing_leader(this: &Arc<Self>) -> Option<LeaderView> {
        let query = Message::WhoIsLeader {
            sender_id: this.id,
            sender_tcp_port: this.tcp_port,
        };
        this.broadcast_to_discovery(&query, config::discovery_port());

        log::info!("[node] checking for an existing leader");
        let deadline = Instant::now() + config::PROBE_WINDOW;
        while Instant::now() < deadline && !this.stopped() {
            let Some((msg, src)) = this.udp.recv() else { continue };
            if let Message::IAmLeader {
                leader_id,
                leader_tcp_port,
                epoch,
                last_seq,
                ..
            } = msg
            {
                log::info!("[node] found existing leader: id={} @ {}", leader_id, src.ip());
                return Some(LeaderView {
                    id: leader_id,
                    ip: src.ip(),
                    tcp_port: leader_tcp_port,
                    epoch,
                    last_seq,
                    last_seen: Instant::now(),
                });
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // UDP send helpers
    // ------------------------------------------------------------------

    /// Unicast to a known peer, or fall back to spraying the discovery
    /// targets on the destination's unicast port when it is unknown.
    fn send_to_node(&self, target_id: u32, msg: &Message) {
        let port = config::node_udp_port(target_id);
        if let Some(peer) = self.peers.peer(target_id) {
            if !peer.ip.is_unspecified() {
                self.udp.send_to(msg, peer.ip, port);
                return;
            }
        }
        for ip in net::discovery_targets() {
            self.udp.send_to(msg, ip, port);
        }
    }

    /// Unicast to every registered peer.
    fn broadcast_to_peers(&self, msg: &Message) {
        for peer in self.peers.snapshot() {
            self.udp.send_to(msg, peer.ip, peer.udp_port);
        }
    }

    /// Spray the discovery targets on a fixed port, for reaching nodes we
    /// have never heard from.
    fn broadcast_to_discovery(&self, msg: &Message, port: u16) {
        for ip in net::discovery_targets() {
            self.udp.send_to(msg, ip, port);
        }
    }

    // ------------------------------------------------------------------
    // Listener loops
    // ------------------------------------------------------------------

    fn udp_node_loop(this: &Arc<Self>) {
        log::info!("[node] unicast UDP listener started");
        while !this.stopped() {
            let Some((msg, src)) = this.udp.recv() else { continue };
            if let Some(sender_id) = msg.sender_node_id() {
                this.note_peer(sender_id, src.ip(), msg.sender_tcp_port());
            }
            Self::handle_udp(this, msg, src);
        }
        log::debug!("[node] unicast UDP listener stopped");
    }

    fn udp_disc_loop(this: &Arc<Self>, bus: &Arc<UdpBus>) {
        log::info!("[node] discovery listener started on port {}", bus.port());
        while !this.stopped() {
            {
                let guard = this.disc.lock();
                let still_current = matches!(guard.as_ref(), Some(cur) if Arc::ptr_eq(cur, bus));
                if !still_current {
                    break;
                }
            }
            let Some((msg, src)) = bus.recv() else { continue };
            if let Message::WhoIsLeader {
                sender_id,
                sender_tcp_port,
            } = msg
            {
                if *this.role.lock() != Role::Leader {
                    continue;
                }
                this.note_peer(sender_id, src.ip(), sender_tcp_port);
                let reply = Message::IAmLeader {
                    leader_id: this.id,
                    leader_ip: net::primary_ip(),
                    leader_tcp_port: this.tcp_port,
                    epoch: this.epoch.load(Ordering::SeqCst),
                    last_seq: this.history.lock().last_seq(),
                };
                bus.send_to(&reply, src.ip(), src.port());
            }
        }
        log::debug!("[node] discovery listener stopped");
    }

    fn handle_udp(this: &Arc<Self>, msg: Message, src: std::net::SocketAddr) {
        match msg {
            Message::IAmLeader {
                leader_id,
                leader_tcp_port,
                epoch,
                last_seq,
                ..
            } => {
                if *this.role.lock() != Role::Follower {
                    return;
                }
                let view = LeaderView {
                    id: leader_id,
                    ip: src.ip(),
                    tcp_port: leader_tcp_port,
                    epoch,
                    last_seq,
                    last_seen: Instant::now(),
                };
                Self::adopt_if_better(this, view);
            }

            Message::LeaderAlive {
                leader_id,
                epoch,
                last_seq,
                leader_tcp_port,
                cluster,
            } => {
                Self::on_heartbeat(this, leader_id, epoch, last_seq, leader_tcp_port, src, &cluster);
            }

            Message::Election { candidate_id, epoch, .. } => {
                if this.id > candidate_id {
                    let reply = Message::Answer {
                        responder_id: this.id,
                        epoch: this.epoch.load(Ordering::SeqCst).max(epoch),
                        responder_tcp_port: this.tcp_port,
                    };
                    this.udp.send_to(&reply, src.ip(), src.port());
                    Self::start_election(this, "ELECTION from a lower id");
                }
            }

            Message::Answer { .. } => this.answer_latch.set(()),

            Message::Coordinator {
                leader_id,
                leader_tcp_port,
                epoch,
                last_seq,
                ..
            } => {
                Self::on_coordinator(this, leader_id, leader_tcp_port, epoch, last_seq, src);
            }

            Message::IdCheck { node_id, token } => {
                if node_id == this.id {
                    let reply = Message::IdTaken {
                        node_id: this.id,
                        token,
                    };
                    this.udp.send_to(&reply, src.ip(), src.port());
                }
            }

            // WHO_IS_LEADER belongs on the discovery socket; order traffic
            // belongs on TCP. Anything else here is noise.
            Message::WhoIsLeader { .. }
            | Message::IdTaken { .. }
            | Message::NewOrder { .. }
            | Message::Order(_)
            | Message::ResendRequest { .. } => {}
        }
    }

    /// Replace the follower's leader view when the claim outranks the
    /// current one. Dropping the TCP link on an id change forces the
    /// discovery loop to reconnect to the right host.
    fn adopt_if_better(this: &Arc<Self>, view: LeaderView) {
        let mut close_link = false;
        {
            let mut leader = this.leader.lock();
            if view.outranks(leader.as_ref()) {
                close_link = leader.as_ref().is_some_and(|cur| cur.id != view.id);
                this.epoch.fetch_max(view.epoch, Ordering::SeqCst);
                log::info!(
                    "[node] leader discovered: id={} @ {}:{} (epoch={})",
                    view.id,
                    view.ip,
                    view.tcp_port,
                    view.epoch
                );
                *leader = Some(view);
            }
        }
        if close_link {
            this.link.close();
        }
    }

    fn on_heartbeat(
        this: &Arc<Self>,
        leader_id: u32,
        epoch: u64,
        last_seq: u64,
        leader_tcp_port: u16,
        src: std::net::SocketAddr,
        cluster: &[crate::proto::ClusterEntry],
    ) {
        let role = *this.role.lock();
        if role == Role::Follower {
            let mut leader = this.leader.lock();
            if leader.is_none() {
                // No leader known: a live heartbeat is proof enough.
                *leader = Some(LeaderView {
                    id: leader_id,
                    ip: src.ip(),
                    tcp_port: leader_tcp_port,
                    epoch,
                    last_seq,
                    last_seen: Instant::now(),
                });
                log::info!("[node] adopted leader id={} from heartbeat", leader_id);
            } else if let Some(cur) = leader.as_mut() {
                if leader_id == cur.id || epoch > cur.epoch {
                    cur.last_seen = Instant::now();
                    cur.epoch = cur.epoch.max(epoch);
                    cur.last_seq = cur.last_seq.max(last_seq);
                    // The observed source address wins over whatever the
                    // leader believes its own address to be.
                    cur.ip = src.ip();
                    if leader_tcp_port != 0 {
                        cur.tcp_port = leader_tcp_port;
                    }
                }
            }
        } else if leader_id != this.id {
            // Safety net; the usual step-down path is COORDINATOR.
            let my_epoch = this.epoch.load(Ordering::SeqCst);
            if epoch > my_epoch || (epoch == my_epoch && leader_id > this.id) {
                log::warn!(
                    "[node] superior heartbeat from id={} epoch={}, stepping down",
                    leader_id,
                    epoch
                );
                Self::demote(
                    this,
                    LeaderView {
                        id: leader_id,
                        ip: src.ip(),
                        tcp_port: leader_tcp_port,
                        epoch,
                        last_seq,
                        last_seen: Instant::now(),
                    },
                );
            }
        }

        this.epoch.fetch_max(epoch, Ordering::SeqCst);
        for entry in cluster {
            if entry.id != 0 {
                this.note_peer(entry.id, entry.ip, entry.tcp);
            }
        }
    }

    fn on_coordinator(
        this: &Arc<Self>,
        leader_id: u32,
        leader_tcp_port: u16,
        epoch: u64,
        last_seq: u64,
        src: std::net::SocketAddr,
    ) {
        let view = LeaderView {
            id: leader_id,
            ip: src.ip(),
            tcp_port: leader_tcp_port,
            epoch,
            last_seq,
            last_seen: Instant::now(),
        };
        // Wake any candidate blocked in its election first.
        this.coordinator_latch.set(view.clone());

        if *this.role.lock() == Role::Leader {
            if leader_id == this.id {
                return;
            }
            let my_epoch = this.epoch.load(Ordering::SeqCst);
            // Bully rule: higher epoch wins; at the same epoch, higher id.
            if epoch > my_epoch || (epoch == my_epoch && leader_id > this.id) {
                log::info!("[node] stepping down for coordinator id={} epoch={}", leader_id, epoch);
                Self::demote(this, view);
            }
            return;
        }

        let close_link = {
            let mut leader = this.leader.lock();
            let changed = leader.as_ref().map_or(true, |cur| cur.id != leader_id);
            *leader = Some(view);
            changed
        };
        this.epoch.fetch_max(epoch, Ordering::SeqCst);
        if close_link {
            this.link.close();
        }
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    fn start_election(this: &Arc<Self>, reason: &str) {
        if *this.role.lock() == Role::Leader {
            return;
        }
        if !this.election_guard.try_begin(config::ELECTION_HOLDOFF) {
            return;
        }
        log::info!("[election] {} -> starting election", reason);
        let inner = Arc::clone(this);
        thread::spawn(move || NodeInner::run_election(&inner));
    }

    fn run_election(this: &Arc<Self>) {
        this.answer_latch.clear();
        this.coordinator_latch.clear();

        let proposed_epoch = this.epoch.load(Ordering::SeqCst) + 1;
        let higher = this.peers.higher_than(this.id);
        log::info!(
            "[election] candidate id={} proposed_epoch={} higher={:?}",
            this.id,
            proposed_epoch,
            higher
        );

        if higher.is_empty() {
            log::info!("[election] no known higher peers, promoting self");
            Self::promote(this, proposed_epoch);
            this.election_guard.finish();
            return;
        }

        let challenge = Message::Election {
            candidate_id: this.id,
            epoch: proposed_epoch,
            candidate_tcp_port: this.tcp_port,
        };
        for id in &higher {
            this.send_to_node(*id, &challenge);
        }

        if this.answer_latch.wait(config::ELECTION_ANSWER_TIMEOUT).is_none() {
            if this.stopped() {
                this.election_guard.finish();
                return;
            }
            log::info!("[election] no ANSWER, becoming leader");
            Self::promote(this, proposed_epoch);
            this.election_guard.finish();
            return;
        }

        log::info!("[election] got ANSWER, waiting for COORDINATOR");
        match this.coordinator_latch.wait(config::COORDINATOR_TIMEOUT) {
            Some(view) => {
                this.epoch.fetch_max(view.epoch, Ordering::SeqCst);
                log::info!(
                    "[election] coordinator is id={} @ {}:{} epoch={}",
                    view.id,
                    view.ip,
                    view.tcp_port,
                    view.epoch
                );
                *this.leader.lock() = Some(view);
                this.election_guard.finish();
                Self::ensure_leader_link(this);
            }
            None => {
                // The next trigger retries; the guard must not stay held.
                log::info!("[election] COORDINATOR timeout, releasing guard");
                this.election_guard.finish();
            }
        }
    }

    fn promote(this: &Arc<Self>, proposed_epoch: u64) {
        if this.stopped() {
            return;
        }
        this.link.close();
        *this.role.lock() = Role::Leader;
        *this.leader.lock() = None;

        let bumped = this.epoch.load(Ordering::SeqCst) + 1;
        this.epoch.fetch_max(bumped.max(proposed_epoch), Ordering::SeqCst);

        Self::bind_discovery(this);
        Self::start_server(this);

        let last_seq = {
            let mut history = this.history.lock();
            history.sync_last_seq();
            history.last_seq()
        };
        this.delivery.lock().fast_forward(last_seq);

        let announce = Message::Coordinator {
            leader_id: this.id,
            leader_ip: net::primary_ip(),
            leader_tcp_port: this.tcp_port,
            epoch: this.epoch.load(Ordering::SeqCst),
            last_seq,
        };
        this.broadcast_to_peers(&announce);
        log::info!(
            "[node] promoted to leader, epoch={} last_seq={}",
            this.epoch.load(Ordering::SeqCst),
            last_seq
        );
    }

    fn demote(this: &Arc<Self>, new_leader: LeaderView) {
        {
            let mut role = this.role.lock();
            if *role != Role::Leader {
                *this.leader.lock() = Some(new_leader);
                return;
            }
            *role = Role::Follower;
        }
        if let Some(mut server) = this.server.lock().take() {
            server.stop();
        }
        // Release the discovery port so the new leader can bind it; the
        // listener thread notices within one recv timeout.
        *this.disc.lock() = None;
        this.epoch.fetch_max(new_leader.epoch, Ordering::SeqCst);
        *this.leader.lock() = Some(new_leader);
        log::info!("[node] demoted to follower");
    }

    /// Bind the shared discovery port and start its listener. An ex-leader
    /// may still be releasing the port, so the bind is retried briefly;
    /// failure is logged but does not fail the promotion.
    fn bind_discovery(this: &Arc<Self>) {
        let mut guard = this.disc.lock();
        if guard.is_some() {
            return;
        }
        let port = config::discovery_port();
        for attempt in 1..=8 {
            match UdpBus::bind(port, true) {
                Ok(bus) => {
                    let bus = Arc::new(bus);
                    *guard = Some(Arc::clone(&bus));
                    let inner = Arc::clone(this);
                    thread::spawn(move || NodeInner::udp_disc_loop(&inner, &bus));
                    return;
                }
                Err(err) => {
                    if attempt == 8 {
                        log::error!("[node] could not bind discovery port {}: {}", port, err);
                        return;
                    }
                    log::debug!(
                        "[node] discovery port {} busy (attempt {}): {}",
                        port,
                        attempt,
                        err
                    );
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn start_server(this: &Arc<Self>) {
        let mut server = this.server.lock();
        if server.is_some() {
            return;
        }
        let weak = Arc::downgrade(this);
        let handler: ServerHandler = Arc::new(move |conn, msg| {
            if let Some(inner) = weak.upgrade() {
                NodeInner::handle_client_msg(&inner, conn, msg);
            }
        });
        match OrderServer::start(this.tcp_port, handler) {
            Ok(started) => *server = Some(started),
            Err(err) => {
                log::error!("[node] TCP server start on port {} failed: {}", this.tcp_port, err);
            }
        }
    }

    // ------------------------------------------------------------------
    // Order path
    // ------------------------------------------------------------------

    fn handle_client_msg(
        this: &Arc<Self>,
        conn: &Arc<crate::transport::ClientConn>,
        msg: Message,
    ) {
        match msg {
            Message::NewOrder {
                sender_id,
                order_uuid,
                payload,
            } => {
                if !this.admit_uuid(&order_uuid) {
                    log::info!("[node] duplicate order ignored: {}", order_uuid);
                    return;
                }
                Self::sequence_and_fan_out(this, order_uuid, payload, Some(sender_id));
            }
            Message::ResendRequest { from_seq } => {
                let records = this.history.lock().range_from(from_seq.max(1));
                log::info!(
                    "[node] resending {} records from seq={} to {}",
                    records.len(),
                    from_seq,
                    conn.peer()
                );
                for rec in records {
                    if conn.send(&Message::Order(rec)).is_err() {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    /// Leader-side sequencing: allocate the next sequence under the history
    /// lock, deliver locally (which persists to the WAL), then fan out.
    fn sequence_and_fan_out(
        this: &Arc<Self>,
        order_uuid: String,
        payload: Payload,
        sender_id: Option<u32>,
    ) {
        let rec = {
            let mut history = this.history.lock();
            let seq = history.allocate_seq();
            let rec = OrderRecord {
                leader_id: this.id,
                epoch: this.epoch.load(Ordering::SeqCst),
                seq,
                order_uuid,
                payload,
                sender_id,
            };
            // Recorded under the same lock as the allocation, so a resend
            // racing this submission cannot observe the gap.
            history.record(rec.clone());
            rec
        };
        Self::apply_order(this, rec.clone());
        if let Some(server) = this.server.lock().as_ref() {
            server.broadcast(&Message::Order(rec));
        }
    }

    /// Common ingest path for orders, whether produced locally on the leader
    /// or received from the leader over TCP.
    fn apply_order(this: &Arc<Self>, rec: OrderRecord) {
        if rec.seq == 0 {
            return;
        }
        this.history.lock().record(rec.clone());

        let can_request = this.link.is_connected();
        let disposition = this.delivery.lock().admit(rec, Instant::now(), can_request);
        match disposition {
            Disposition::Duplicate => {}
            Disposition::Buffered { resend_from: Some(from) } => {
                log::info!("[node] gap ahead of seq={}, requesting resend", from);
                let _ = this.link.send(&Message::ResendRequest { from_seq: from });
            }
            Disposition::Buffered { resend_from: None } => {}
            Disposition::Delivered(records) => {
                for rec in &records {
                    this.deliver(rec);
                    this.wal.append(rec);
                }
            }
        }
    }

    /// The observable delivery sink.
    fn deliver(&self, rec: &OrderRecord) {
        let text = match rec.payload.get("text").and_then(|v| v.as_str()) {
            Some(text) => text.to_string(),
            None => serde_json::Value::Object(rec.payload.clone()).to_string(),
        };
        let from = rec
            .sender_id
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        log::info!("[node] id={} DELIVER seq={} from={} | {}", self.id, rec.seq, from, text);
    }

    // ------------------------------------------------------------------
    // Periodic loops
    // ------------------------------------------------------------------

    fn heartbeat_loop(this: &Arc<Self>) {
        while !this.stopped() {
            if *this.role.lock() != Role::Leader {
                this.sleep_with_stop(Duration::from_millis(500));
                continue;
            }

            let last_seq = {
                let mut history = this.history.lock();
                history.sync_last_seq();
                history.last_seq()
            };
            let heartbeat = Message::LeaderAlive {
                leader_id: this.id,
                epoch: this.epoch.load(Ordering::SeqCst),
                last_seq,
                leader_tcp_port: this.tcp_port,
                cluster: this.peers.cluster_entries(),
            };
            for _ in 0..config::HEARTBEAT_REDUNDANCY {
                this.broadcast_to_peers(&heartbeat);
            }
            this.sleep_with_stop(config::HEARTBEAT_INTERVAL);
        }
    }

    fn discovery_loop(this: &Arc<Self>) {
        // Tracks whether the previous tick broadcast an unanswered
        // WHO_IS_LEADER; two quiet ticks in a row trigger an election.
        let mut asked_last_tick = false;

        while !this.stopped() {
            if *this.role.lock() != Role::Follower {
                asked_last_tick = false;
                this.sleep_with_stop(Duration::from_millis(500));
                continue;
            }

            let timed_out = {
                let mut leader = this.leader.lock();
                let stale = leader
                    .as_ref()
                    .is_some_and(|view| view.is_stale(config::LEADER_TIMEOUT));
                if stale {
                    *leader = None;
                }
                stale
            };
            if timed_out {
                this.link.close();
                Self::start_election(this, "leader timeout");
            }

            let have_leader = this.leader.lock().is_some();
            if !have_leader && !this.election_guard.in_flight() {
                if asked_last_tick {
                    asked_last_tick = false;
                    Self::start_election(this, "no answer to WHO_IS_LEADER");
                } else {
                    let query = Message::WhoIsLeader {
                        sender_id: this.id,
                        sender_tcp_port: this.tcp_port,
                    };
                    this.broadcast_to_discovery(&query, config::discovery_port());
                    asked_last_tick = true;
                }
            } else {
                asked_last_tick = false;
            }

            if have_leader {
                Self::ensure_leader_link(this);
            }

            this.peers.prune(config::PEER_EXPIRY);
            this.sleep_with_stop(config::DISCOVERY_INTERVAL);
        }
    }

    /// Connect the order link to the current leader if it is down, then ask
    /// for everything we might have missed while disconnected.
    fn ensure_leader_link(this: &Arc<Self>) {
        if this.stopped() || this.link.is_connected() {
            return;
        }
        let Some(view) = this.leader.lock().clone() else { return };
        if view.tcp_port == 0 {
            return;
        }

        let weak = Arc::downgrade(this);
        let on_msg: LinkHandler = Arc::new(move |msg| {
            if let (Some(inner), Message::Order(rec)) = (weak.upgrade(), msg) {
                NodeInner::apply_order(&inner, rec);
            }
        });

        if this.link.connect(view.ip, view.tcp_port, on_msg) {
            let from_seq = this.delivery.lock().expected_seq();
            let _ = this.link.send(&Message::ResendRequest { from_seq });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Node ids in this module are kept high so the derived UDP ports cannot
    // collide with the integration tests.

    #[test]
    fn fresh_node_starts_with_empty_state() {
        let node = Node::builder(901, Role::Follower, 39901)
            .wal(false)
            .build()
            .expect("build node");
        let status = node.status();
        assert_eq!(status.id, 901);
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.epoch, 1);
        assert_eq!(status.last_seq, 0);
        assert_eq!(status.expected_seq, 1);
        assert_eq!(status.leader_id, None);
        assert!(!status.tcp_connected);
    }

    #[test]
    fn second_instance_of_the_same_id_is_refused() {
        let _first = Node::builder(902, Role::Follower, 39902)
            .wal(false)
            .build()
            .expect("first instance");
        match Node::builder(902, Role::Follower, 39903).wal(false).build() {
            Err(Error::PortInUse(port)) => assert_eq!(port, config::node_udp_port(902)),
            other => panic!("expected PortInUse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn leader_sequences_local_orders_without_a_network() {
        let node = Node::builder(903, Role::Leader, 39904)
            .wal(false)
            .build()
            .expect("build node");
        // No run(): sequencing itself needs neither sockets nor peers.
        node.submit_order(crate::proto::text_payload("Espresso"))
            .expect("local submit");
        node.submit_order(crate::proto::text_payload("Latte"))
            .expect("local submit");

        let status = node.status();
        assert_eq!(status.last_seq, 2);
        assert_eq!(status.expected_seq, 3);
        let payload = node.history_payload(1).expect("seq 1 recorded");
        assert_eq!(payload.get("text").and_then(|v| v.as_str()), Some("Espresso"));
    }

    #[test]
    fn follower_submit_without_leader_is_rejected() {
        let node = Node::builder(904, Role::Follower, 39905)
            .wal(false)
            .build()
            .expect("build node");
        assert!(matches!(
            node.submit_order(crate::proto::text_payload("Mocha")),
            Err(Error::NotConnected)
        ));
    }
}
