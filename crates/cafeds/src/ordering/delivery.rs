// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-order delivery engine.
//!
//! Classifies each incoming order against the delivery frontier and hands the
//! caller back an action: nothing (duplicate), hold it (gap, possibly asking
//! for a resend), or a run of records to deliver. Keeping the engine free of
//! I/O makes the gap and reorder paths deterministic to test.
//!
//! Delivery is at-most-once per sequence per process lifetime and strictly
//! ascending; gaps are only ever closed by retransmission, never skipped.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use crate::config;
use crate::proto::OrderRecord;

/// What the caller should do with an admitted order.
#[derive(Debug)]
pub enum Disposition {
    /// Seen before; nothing to do.
    Duplicate,
    /// Ahead of the frontier; buffered. When `resend_from` is set the caller
    /// should ask the leader to replay from that sequence.
    Buffered { resend_from: Option<u64> },
    /// The frontier advanced. Deliver these records, in this order.
    Delivered(Vec<OrderRecord>),
}

/// Per-node delivery frontier and reorder buffer.
#[derive(Debug)]
pub struct DeliveryState {
    expected_seq: u64,
    delivered: HashSet<u64>,
    buffer: BTreeMap<u64, OrderRecord>,
    last_resend: Option<Instant>,
}

impl Default for DeliveryState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            expected_seq: 1,
            delivered: HashSet::new(),
            buffer: BTreeMap::new(),
            last_resend: None,
        }
    }

    /// Next sequence this node will deliver.
    #[must_use]
    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    /// Largest contiguously delivered prefix.
    #[must_use]
    pub fn delivered_up_to(&self) -> u64 {
        self.expected_seq - 1
    }

    #[must_use]
    pub fn is_delivered(&self, seq: u64) -> bool {
        self.delivered.contains(&seq)
    }

    /// Classify one order. `can_request` tells the engine whether a resend
    /// request could actually be sent right now (a leader connection exists);
    /// requests are additionally rate-limited to one per
    /// [`config::RESEND_MIN_INTERVAL`].
    pub fn admit(&mut self, rec: OrderRecord, now: Instant, can_request: bool) -> Disposition {
        let seq = rec.seq;

        if self.delivered.contains(&seq) || seq < self.expected_seq {
            self.delivered.insert(seq);
            return Disposition::Duplicate;
        }

        if seq > self.expected_seq {
            self.buffer.insert(seq, rec);
            let resend_from = if can_request && self.resend_window_open(now) {
                self.last_resend = Some(now);
                Some(self.expected_seq)
            } else {
                None
            };
            return Disposition::Buffered { resend_from };
        }

        // seq == expected: deliver it, then drain the contiguous run that the
        // reorder buffer can now satisfy.
        let mut out = Vec::with_capacity(1 + self.buffer.len());
        self.delivered.insert(seq);
        self.expected_seq += 1;
        out.push(rec);

        while let Some(next) = self.buffer.remove(&self.expected_seq) {
            let s = self.expected_seq;
            self.expected_seq += 1;
            if self.delivered.contains(&s) {
                continue;
            }
            self.delivered.insert(s);
            out.push(next);
        }
        Disposition::Delivered(out)
    }

    fn resend_window_open(&self, now: Instant) -> bool {
        match self.last_resend {
            Some(prev) => now.duration_since(prev) >= config::RESEND_MIN_INTERVAL,
            None => true,
        }
    }

    /// Mark `[1, last_seq]` as already delivered and move the frontier past
    /// it. Used after WAL recovery and on promotion, where history is known
    /// to have been delivered by a previous life or a previous leader.
    pub fn fast_forward(&mut self, last_seq: u64) {
        let next = last_seq + 1;
        if next <= self.expected_seq {
            return;
        }
        for seq in 1..next {
            self.delivered.insert(seq);
        }
        self.expected_seq = next;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{text_payload, Payload};

    fn rec(seq: u64) -> OrderRecord {
        OrderRecord {
            leader_id: 10,
            epoch: 1,
            seq,
            order_uuid: format!("u-{}", seq),
            payload: Payload::new(),
            sender_id: None,
        }
    }

    fn delivered_seqs(d: Disposition) -> Vec<u64> {
        match d {
            Disposition::Delivered(recs) => recs.iter().map(|r| r.seq).collect(),
            other => panic!("expected Delivered, got {:?}", other),
        }
    }

    #[test]
    fn in_order_arrivals_deliver_one_by_one() {
        let mut state = DeliveryState::new();
        let now = Instant::now();
        assert_eq!(delivered_seqs(state.admit(rec(1), now, true)), vec![1]);
        assert_eq!(delivered_seqs(state.admit(rec(2), now, true)), vec![2]);
        assert_eq!(state.expected_seq(), 3);
    }

    #[test]
    fn gap_buffers_and_requests_resend_from_the_frontier() {
        let mut state = DeliveryState::new();
        let now = Instant::now();
        assert_eq!(delivered_seqs(state.admit(rec(1), now, true)), vec![1]);

        // seq 2 held back; 3 arrives first.
        match state.admit(rec(3), now, true) {
            Disposition::Buffered { resend_from } => assert_eq!(resend_from, Some(2)),
            other => panic!("expected Buffered, got {:?}", other),
        }
        assert_eq!(state.expected_seq(), 2);

        // The retransmitted 2 releases the buffered 3 in order.
        assert_eq!(delivered_seqs(state.admit(rec(2), now, true)), vec![2, 3]);
        assert_eq!(state.expected_seq(), 4);
    }

    #[test]
    fn resend_requests_are_rate_limited() {
        let mut state = DeliveryState::new();
        let t0 = Instant::now();
        match state.admit(rec(3), t0, true) {
            Disposition::Buffered { resend_from } => assert_eq!(resend_from, Some(1)),
            other => panic!("expected Buffered, got {:?}", other),
        }
        // A second gap inside the window stays quiet.
        match state.admit(rec(4), t0 + config::RESEND_MIN_INTERVAL / 2, true) {
            Disposition::Buffered { resend_from } => assert_eq!(resend_from, None),
            other => panic!("expected Buffered, got {:?}", other),
        }
        // Past the window the request fires again.
        match state.admit(rec(5), t0 + config::RESEND_MIN_INTERVAL, true) {
            Disposition::Buffered { resend_from } => assert_eq!(resend_from, Some(1)),
            other => panic!("expected Buffered, got {:?}", other),
        }
    }

    #[test]
    fn no_connection_means_no_resend_request() {
        let mut state = DeliveryState::new();
        match state.admit(rec(5), Instant::now(), false) {
            Disposition::Buffered { resend_from } => assert_eq!(resend_from, None),
            other => panic!("expected Buffered, got {:?}", other),
        }
    }

    #[test]
    fn duplicates_and_stale_sequences_are_dropped() {
        let mut state = DeliveryState::new();
        let now = Instant::now();
        let _ = state.admit(rec(1), now, true);
        assert!(matches!(state.admit(rec(1), now, true), Disposition::Duplicate));

        state.fast_forward(5);
        assert!(matches!(state.admit(rec(3), now, true), Disposition::Duplicate));
        assert_eq!(state.expected_seq(), 6);
    }

    #[test]
    fn fast_forward_never_rewinds() {
        let mut state = DeliveryState::new();
        state.fast_forward(5);
        state.fast_forward(2);
        assert_eq!(state.expected_seq(), 6);
        assert!(state.is_delivered(4));
    }

    #[test]
    fn payload_survives_the_reorder_buffer() {
        let mut state = DeliveryState::new();
        let now = Instant::now();
        let mut hold = rec(2);
        hold.payload = text_payload("Latte");
        let _ = state.admit(hold, now, true);
        match state.admit(rec(1), now, true) {
            Disposition::Delivered(recs) => {
                assert_eq!(recs.len(), 2);
                assert_eq!(recs[1].payload.get("text").and_then(|v| v.as_str()), Some("Latte"));
            }
            other => panic!("expected Delivered, got {:?}", other),
        }
    }
}
