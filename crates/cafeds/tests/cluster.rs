// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-node integration tests.
//!
//! Every scenario runs a real cluster inside this process, on loopback, in
//! single-PC mode. The tests share the fixed discovery port, so they are
//! serialized through one lock; node ids (and with them UDP ports and WAL
//! files) are unique per scenario.

use std::sync::{Mutex, Once, OnceLock};
use std::time::{Duration, Instant};

use cafeds::{config, text_payload, Node, Role, Ui};

static TEST_LOCK: Mutex<()> = Mutex::new(());
static WAL_DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
static ENV: Once = Once::new();

/// Serialize the scenario and point the cluster at loopback plus a scratch
/// WAL directory. Environment must be set before the first config access.
fn setup() -> std::sync::MutexGuard<'static, ()> {
    ENV.call_once(|| {
        let dir = WAL_DIR.get_or_init(|| tempfile::tempdir().expect("scratch WAL dir"));
        std::env::set_var("CAFEDS_SINGLE_PC", "1");
        std::env::set_var("CAFEDS_WAL_DIR", dir.path());
    });
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(
            Instant::now() < deadline,
            "timed out after {:?} waiting for: {}",
            timeout,
            what
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn payload_text(node: &Node, seq: u64) -> Option<String> {
    node.history_payload(seq)
        .and_then(|p| p.get("text").and_then(|v| v.as_str()).map(str::to_string))
}

#[test]
fn three_node_order_flow() {
    let _guard = setup();

    let leader = Node::new(10, Role::Leader, 39110, Ui::Kitchen).expect("leader");
    leader.run().expect("leader run");
    let waiter = Node::new(2, Role::Follower, 39102, Ui::Waiter).expect("waiter");
    waiter.run().expect("waiter run");
    let kitchen = Node::new(3, Role::Follower, 39103, Ui::Kitchen).expect("kitchen");
    kitchen.run().expect("kitchen run");

    wait_until("followers connect to the leader", Duration::from_secs(10), || {
        let w = waiter.status();
        let k = kitchen.status();
        w.leader_id == Some(10) && w.tcp_connected && k.leader_id == Some(10) && k.tcp_connected
    });

    waiter
        .submit_order(text_payload("Espresso"))
        .expect("submit at the waiter");

    wait_until("all three nodes deliver seq 1", Duration::from_secs(10), || {
        [&leader, &waiter, &kitchen].into_iter().all(|node| {
            payload_text(node, 1).as_deref() == Some("Espresso")
                && node.status().expected_seq == 2
        })
    });

    for node in [&leader, &waiter, &kitchen] {
        node.stop();
    }
}

#[test]
fn leader_failover_continues_the_log() {
    let _guard = setup();

    let leader = Node::new(30, Role::Leader, 39130, Ui::Kitchen).expect("leader");
    leader.run().expect("leader run");
    let low = Node::new(22, Role::Follower, 39122, Ui::Waiter).expect("low follower");
    low.run().expect("low run");
    let high = Node::new(23, Role::Follower, 39123, Ui::Kitchen).expect("high follower");
    high.run().expect("high run");

    wait_until("cluster forms around node 30", Duration::from_secs(10), || {
        low.status().tcp_connected && high.status().tcp_connected
    });

    low.submit_order(text_payload("Espresso")).expect("first order");
    wait_until("everyone delivers seq 1", Duration::from_secs(10), || {
        [&leader, &low, &high]
            .into_iter()
            .all(|node| node.status().expected_seq == 2)
    });

    leader.stop();

    wait_until("node 23 takes over", Duration::from_secs(10), || {
        high.role() == Role::Leader
            && high.status().epoch >= 2
            && low.leader_id() == Some(23)
    });

    wait_until("node 22 reconnects to the new leader", Duration::from_secs(10), || {
        low.status().tcp_connected
    });
    low.submit_order(text_payload("Latte")).expect("post-failover order");

    wait_until("survivors deliver seq 2", Duration::from_secs(5), || {
        [&low, &high].into_iter().all(|node| {
            payload_text(node, 2).as_deref() == Some("Latte") && node.status().expected_seq == 3
        })
    });

    low.stop();
    high.stop();
}

#[test]
fn second_leader_demotes_itself() {
    let _guard = setup();

    let established = Node::new(40, Role::Leader, 39140, Ui::Kitchen).expect("leader");
    established.run().expect("leader run");

    let latecomer = Node::new(39, Role::Leader, 39139, Ui::Kitchen).expect("latecomer");
    latecomer.run().expect("latecomer run");

    wait_until("latecomer demotes to follower", Duration::from_secs(3), || {
        latecomer.role() == Role::Follower && latecomer.leader_id() == Some(40)
    });
    assert_eq!(established.role(), Role::Leader);

    established.stop();
    latecomer.stop();
}

#[test]
fn duplicate_id_is_refused() {
    let _guard = setup();

    let original = Node::new(50, Role::Follower, 39150, Ui::Kitchen).expect("original");
    original.run().expect("original run");

    // On one host the unicast bind already refuses the duplicate.
    match Node::new(50, Role::Follower, 39151, Ui::Kitchen) {
        Err(cafeds::Error::PortInUse(port)) => assert_eq!(port, config::node_udp_port(50)),
        other => panic!("expected PortInUse, got {:?}", other.map(|_| ())),
    }

    // The network probe side: an ID_CHECK for the taken id is answered with
    // a matching ID_TAKEN, which is what aborts a probing starter on another
    // host.
    let probe_socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe socket");
    probe_socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    let check = cafeds::Message::IdCheck {
        node_id: 50,
        token: "probe-token".to_string(),
    };
    probe_socket
        .send_to(
            &serde_json::to_vec(&check).expect("encode"),
            ("127.0.0.1", config::node_udp_port(50)),
        )
        .expect("send probe");

    let mut buf = [0u8; 4096];
    let (len, _) = probe_socket.recv_from(&mut buf).expect("ID_TAKEN reply");
    let reply: cafeds::Message = serde_json::from_slice(&buf[..len]).expect("decode reply");
    assert_eq!(
        reply,
        cafeds::Message::IdTaken {
            node_id: 50,
            token: "probe-token".to_string(),
        }
    );

    original.stop();
}

#[test]
fn restart_recovers_from_wal() {
    let _guard = setup();

    let node = Node::new(60, Role::Leader, 39160, Ui::Kitchen).expect("first life");
    // No run(): local sequencing exercises the WAL without the network.
    for text in ["Espresso", "Latte", "Flat White"] {
        node.submit_order(text_payload(text)).expect("submit");
    }
    let status = node.status();
    assert_eq!(status.last_seq, 3);
    assert_eq!(status.expected_seq, 4);
    node.stop();
    drop(node);

    let reborn = Node::new(60, Role::Leader, 39160, Ui::Kitchen).expect("second life");
    let status = reborn.status();
    assert_eq!(status.last_seq, 3, "WAL must restore the high-water mark");
    assert_eq!(status.expected_seq, 4, "recovered deliveries must not repeat");
    assert_eq!(payload_text(&reborn, 2).as_deref(), Some("Latte"));

    // Sequencing resumes after the recovered prefix.
    reborn.submit_order(text_payload("Cortado")).expect("submit");
    let status = reborn.status();
    assert_eq!(status.last_seq, 4);
    assert_eq!(status.expected_seq, 5);

    reborn.stop();
}
