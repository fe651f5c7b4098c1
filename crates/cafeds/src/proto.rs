// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed wire message family and codec.
//!
//! Every control and order message is a flat JSON record whose `"type"` field
//! selects the variant. UDP carries one record per datagram; TCP carries the
//! same records newline-terminated, read line by line.
//!
//! The codec never panics and never propagates parse failures to the caller:
//! a malformed record decodes to `None` and is dropped at the I/O boundary.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Opaque order payload. The core never interprets its contents; the single
/// exception is the delivery log sink, which reads the `"text"` key when
/// present to render a human-friendly line.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Convenience constructor for the common `{"text": ...}` payload shape.
#[must_use]
pub fn text_payload(text: &str) -> Payload {
    let mut map = Payload::new();
    map.insert("text".to_string(), serde_json::Value::String(text.to_string()));
    map
}

/// One member of the cluster list gossiped inside each heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: u32,
    pub ip: IpAddr,
    pub tcp: u16,
}

/// A sequenced order as assigned by the leader. This is both the TCP fan-out
/// record and the WAL line format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub leader_id: u32,
    pub epoch: u64,
    pub seq: u64,
    pub order_uuid: String,
    pub payload: Payload,
    /// Id of the original submitter, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<u32>,
}

/// The complete message family. Serde renames pin the wire tags; field names
/// are the wire field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Any node asking the discovery port who currently leads.
    #[serde(rename = "WHO_IS_LEADER")]
    WhoIsLeader { sender_id: u32, sender_tcp_port: u16 },

    /// Leader's unicast reply to a `WHO_IS_LEADER`.
    #[serde(rename = "I_AM_LEADER")]
    IAmLeader {
        leader_id: u32,
        leader_ip: IpAddr,
        leader_tcp_port: u16,
        epoch: u64,
        last_seq: u64,
    },

    /// Periodic leader liveness signal, carrying the gossiped cluster list.
    #[serde(rename = "LEADER_ALIVE")]
    LeaderAlive {
        leader_id: u32,
        epoch: u64,
        last_seq: u64,
        #[serde(default)]
        leader_tcp_port: u16,
        #[serde(default)]
        cluster: Vec<ClusterEntry>,
    },

    /// Bully challenge from a candidate to a higher-id peer.
    #[serde(rename = "ELECTION")]
    Election {
        candidate_id: u32,
        epoch: u64,
        #[serde(default)]
        candidate_tcp_port: u16,
    },

    /// A higher-id peer suppressing a lower candidate.
    #[serde(rename = "ANSWER")]
    Answer {
        responder_id: u32,
        epoch: u64,
        #[serde(default)]
        responder_tcp_port: u16,
    },

    /// Election winner announcing itself to the cluster.
    #[serde(rename = "COORDINATOR")]
    Coordinator {
        leader_id: u32,
        leader_ip: IpAddr,
        leader_tcp_port: u16,
        epoch: u64,
        last_seq: u64,
    },

    /// Startup probe: is this node id already claimed on the subnet?
    #[serde(rename = "ID_CHECK")]
    IdCheck { node_id: u32, token: String },

    /// Owner's reply to an `ID_CHECK` for its own id.
    #[serde(rename = "ID_TAKEN")]
    IdTaken { node_id: u32, token: String },

    /// Client submission toward the leader.
    #[serde(rename = "NEW_ORDER")]
    NewOrder {
        sender_id: u32,
        order_uuid: String,
        payload: Payload,
    },

    /// Sequenced order fanned out by the leader.
    #[serde(rename = "ORDER")]
    Order(OrderRecord),

    /// Client asking the leader to replay history from a sequence onward.
    #[serde(rename = "RESEND_REQUEST")]
    ResendRequest { from_seq: u64 },
}

impl Message {
    /// Recognized sender-id field of the message, for opportunistic peer
    /// registration from any inbound datagram.
    #[must_use]
    pub fn sender_node_id(&self) -> Option<u32> {
        match self {
            Message::WhoIsLeader { sender_id, .. } | Message::NewOrder { sender_id, .. } => {
                Some(*sender_id)
            }
            Message::IAmLeader { leader_id, .. }
            | Message::LeaderAlive { leader_id, .. }
            | Message::Coordinator { leader_id, .. } => Some(*leader_id),
            Message::Election { candidate_id, .. } => Some(*candidate_id),
            Message::Answer { responder_id, .. } => Some(*responder_id),
            Message::Order(rec) => Some(rec.leader_id),
            Message::IdCheck { .. } | Message::IdTaken { .. } | Message::ResendRequest { .. } => {
                None
            }
        }
    }

    /// TCP port advertised by the sender, 0 when the message carries none.
    #[must_use]
    pub fn sender_tcp_port(&self) -> u16 {
        match self {
            Message::WhoIsLeader { sender_tcp_port, .. } => *sender_tcp_port,
            Message::IAmLeader { leader_tcp_port, .. }
            | Message::LeaderAlive { leader_tcp_port, .. }
            | Message::Coordinator { leader_tcp_port, .. } => *leader_tcp_port,
            Message::Election { candidate_tcp_port, .. } => *candidate_tcp_port,
            Message::Answer { responder_tcp_port, .. } => *responder_tcp_port,
            _ => 0,
        }
    }
}

/// Encode a message as a single JSON record.
#[must_use]
pub fn encode(msg: &Message) -> Vec<u8> {
    // Serialization of this closed type family cannot fail; an empty record
    // is dropped by every receiver, so the fallback is safe either way.
    serde_json::to_vec(msg).unwrap_or_default()
}

/// Encode a message as a newline-terminated record for TCP framing.
#[must_use]
pub fn encode_line(msg: &Message) -> Vec<u8> {
    let mut data = encode(msg);
    data.push(b'\n');
    data
}

/// Decode a single record. Malformed or unknown input yields `None`.
#[must_use]
pub fn decode(data: &[u8]) -> Option<Message> {
    serde_json::from_slice(data).ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_field_selects_the_variant() {
        let raw = br#"{"type":"WHO_IS_LEADER","sender_id":3,"sender_tcp_port":9000}"#;
        let msg = decode(raw).expect("well-formed record must decode");
        assert_eq!(
            msg,
            Message::WhoIsLeader {
                sender_id: 3,
                sender_tcp_port: 9000
            }
        );
    }

    #[test]
    fn order_flattens_record_fields_next_to_tag() {
        let rec = OrderRecord {
            leader_id: 10,
            epoch: 2,
            seq: 5,
            order_uuid: "u-1".to_string(),
            payload: text_payload("Espresso"),
            sender_id: Some(2),
        };
        let data = encode(&Message::Order(rec.clone()));
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["type"], "ORDER");
        assert_eq!(value["seq"], 5);
        assert_eq!(value["payload"]["text"], "Espresso");

        assert_eq!(decode(&data), Some(Message::Order(rec)));
    }

    #[test]
    fn absent_sender_id_is_omitted_from_the_wire() {
        let rec = OrderRecord {
            leader_id: 1,
            epoch: 1,
            seq: 1,
            order_uuid: "u".to_string(),
            payload: Payload::new(),
            sender_id: None,
        };
        let data = encode(&Message::Order(rec));
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert!(value.get("sender_id").is_none());
    }

    #[test]
    fn malformed_records_decode_to_none() {
        assert_eq!(decode(b"not json"), None);
        assert_eq!(decode(br#"{"type":"NO_SUCH_TYPE"}"#), None);
        assert_eq!(decode(br#"{"type":"ELECTION","epoch":1}"#), None);
        assert_eq!(decode(b""), None);
    }

    #[test]
    fn heartbeat_tolerates_missing_optional_fields() {
        // Older senders omit the tcp port and cluster list.
        let raw = br#"{"type":"LEADER_ALIVE","leader_id":9,"epoch":4,"last_seq":17}"#;
        match decode(raw) {
            Some(Message::LeaderAlive {
                leader_id,
                leader_tcp_port,
                cluster,
                ..
            }) => {
                assert_eq!(leader_id, 9);
                assert_eq!(leader_tcp_port, 0);
                assert!(cluster.is_empty());
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn sender_identity_extraction_covers_control_messages() {
        let msg = Message::Election {
            candidate_id: 4,
            epoch: 2,
            candidate_tcp_port: 9004,
        };
        assert_eq!(msg.sender_node_id(), Some(4));
        assert_eq!(msg.sender_tcp_port(), 9004);

        let msg = Message::ResendRequest { from_seq: 3 };
        assert_eq!(msg.sender_node_id(), None);
        assert_eq!(msg.sender_tcp_port(), 0);
    }
}
