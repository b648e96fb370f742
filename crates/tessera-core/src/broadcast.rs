//! Control messages and the broadcaster contract.
//!
//! The core defines the messages it ships; how they travel (gossip, HTTP,
//! an in-memory registry in tests) is the transport's business. Each
//! message is framed as a length-prefixed record carrying an opcode and a
//! bincode payload; the transport treats the payload opaquely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field::FieldOptions;
use crate::index::IndexOptions;
use crate::node::{ClusterState, Node, NodeEvent, NodeState};
use crate::schema::Schema;

// ─────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────

/// Authoritative cluster view published by the coordinator after every
/// membership or state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster_id: String,
    pub state: ClusterState,
    pub coordinator: String,
    pub nodes: Vec<Node>,
}

/// Order from the coordinator to a gaining node: pull `(index, shard)`
/// from one of `sources` (primary first), then acknowledge. Carries the
/// coordinator's schema so a freshly joined node can materialise the
/// entities it is about to receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeInstruction {
    pub job: u64,
    pub instruction: u64,
    pub coordinator: Node,
    pub target: Node,
    pub sources: Vec<Node>,
    pub index: String,
    pub shard: u64,
    pub schema: Schema,
}

/// Periodic per-node status used to repair missed broadcasts: schema plus
/// the highest shard this node has seen per index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: Node,
    pub schema: Schema,
    pub max_shards: HashMap<String, u64>,
}

/// Every control message carried over the broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    CreateIndex {
        index: String,
        options: IndexOptions,
    },
    DeleteIndex {
        index: String,
    },
    CreateField {
        index: String,
        field: String,
        options: FieldOptions,
    },
    DeleteField {
        index: String,
        field: String,
    },
    CreateView {
        index: String,
        field: String,
        view: String,
    },
    DeleteView {
        index: String,
        field: String,
        view: String,
    },
    CreateShard {
        index: String,
        shard: u64,
        origin: String,
    },
    ClusterStatus(ClusterStatus),
    ResizeInstruction(Box<ResizeInstruction>),
    ResizeInstructionComplete {
        job: u64,
        instruction: u64,
        node: String,
    },
    SetCoordinator {
        new: String,
    },
    UpdateCoordinator {
        new: String,
    },
    NodeState {
        node: String,
        state: NodeState,
    },
    RecalculateCaches,
    NodeEvent(NodeEvent),
    NodeStatus(Box<NodeStatus>),
}

impl Message {
    /// Wire opcode, kept stable for cross-version decoding.
    pub fn opcode(&self) -> u8 {
        match self {
            Message::CreateIndex { .. } => 1,
            Message::DeleteIndex { .. } => 2,
            Message::CreateField { .. } => 3,
            Message::DeleteField { .. } => 4,
            Message::CreateView { .. } => 5,
            Message::DeleteView { .. } => 6,
            Message::CreateShard { .. } => 7,
            Message::ClusterStatus(_) => 8,
            Message::ResizeInstruction(_) => 9,
            Message::ResizeInstructionComplete { .. } => 10,
            Message::SetCoordinator { .. } => 11,
            Message::UpdateCoordinator { .. } => 12,
            Message::NodeState { .. } => 13,
            Message::RecalculateCaches => 14,
            Message::NodeEvent(_) => 15,
            Message::NodeStatus(_) => 16,
        }
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::CreateIndex { .. } => "CREATE_INDEX",
            Message::DeleteIndex { .. } => "DELETE_INDEX",
            Message::CreateField { .. } => "CREATE_FIELD",
            Message::DeleteField { .. } => "DELETE_FIELD",
            Message::CreateView { .. } => "CREATE_VIEW",
            Message::DeleteView { .. } => "DELETE_VIEW",
            Message::CreateShard { .. } => "CREATE_SHARD",
            Message::ClusterStatus(_) => "CLUSTER_STATUS",
            Message::ResizeInstruction(_) => "RESIZE_INSTRUCTION",
            Message::ResizeInstructionComplete { .. } => "RESIZE_COMPLETE",
            Message::SetCoordinator { .. } => "SET_COORDINATOR",
            Message::UpdateCoordinator { .. } => "UPDATE_COORDINATOR",
            Message::NodeState { .. } => "NODE_STATE",
            Message::RecalculateCaches => "RECALCULATE_CACHES",
            Message::NodeEvent(_) => "NODE_EVENT",
            Message::NodeStatus(_) => "NODE_STATUS",
        }
    }
}

// ─────────────────────────────────────────────
// Wire framing
// ─────────────────────────────────────────────
//
// Frame: [opcode: u8][len: u32][crc32: u32][payload: bincode Message]

/// Maximum frame payload (64 MiB), guarding against corrupted lengths.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CoreError> {
    let payload = bincode::serialize(msg)?;
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.push(msg.opcode());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> Result<Message, CoreError> {
    let corrupt = |detail: &str| CoreError::Corrupt {
        what: "message frame",
        path: String::new(),
        detail: detail.to_string(),
    };
    if frame.len() < 9 {
        return Err(corrupt("frame too short"));
    }
    let opcode = frame[0];
    let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let crc = u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);
    if len > MAX_FRAME_BYTES || frame.len() != 9 + len as usize {
        return Err(corrupt("length mismatch"));
    }
    let payload = &frame[9..];
    if crc32fast::hash(payload) != crc {
        return Err(corrupt("checksum mismatch"));
    }
    let msg: Message = bincode::deserialize(payload)?;
    if msg.opcode() != opcode {
        return Err(corrupt("opcode does not match payload"));
    }
    Ok(msg)
}

// ─────────────────────────────────────────────
// Broadcaster
// ─────────────────────────────────────────────

/// Fan-out of control messages to cluster peers.
///
/// `send_sync` must not return `Ok` until every non-self peer has
/// acknowledged; any per-peer failure fails the whole call, which schema
/// mutators use to roll back their local change.
pub trait Broadcaster: Send + Sync {
    fn send_sync(&self, msg: &Message) -> Result<(), CoreError>;
    fn send_async(&self, msg: &Message) -> Result<(), CoreError>;
    fn send_to(&self, node: &Node, msg: &Message) -> Result<(), CoreError>;
}

/// Broadcaster that drops everything. Default for single-node operation
/// and for components not yet wired to a transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopBroadcaster;

impl Broadcaster for NopBroadcaster {
    fn send_sync(&self, _msg: &Message) -> Result<(), CoreError> {
        Ok(())
    }

    fn send_async(&self, _msg: &Message) -> Result<(), CoreError> {
        Ok(())
    }

    fn send_to(&self, _node: &Node, _msg: &Message) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Uri;

    #[test]
    fn frame_round_trip() {
        let msg = Message::CreateShard {
            index: "events".into(),
            shard: 3,
            origin: "aabb".into(),
        };
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn frame_rejects_corruption() {
        let msg = Message::RecalculateCaches;
        let mut frame = encode_frame(&msg).unwrap();
        let last = frame.len() - 1;

        frame.push(0); // trailing garbage
        assert!(decode_frame(&frame).is_err());
        frame.pop();

        frame[last] ^= 0xFF; // payload flip
        assert!(decode_frame(&frame).is_err());
        frame[last] ^= 0xFF;

        frame[0] = 99; // wrong opcode
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn status_message_round_trips_nodes() {
        let status = ClusterStatus {
            cluster_id: "c1".into(),
            state: ClusterState::Normal,
            coordinator: "aa".into(),
            nodes: vec![Node::new("aa", Uri::new("http", "a", 1))],
        };
        let frame = encode_frame(&Message::ClusterStatus(status.clone())).unwrap();
        match decode_frame(&frame).unwrap() {
            Message::ClusterStatus(got) => assert_eq!(got, status),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
