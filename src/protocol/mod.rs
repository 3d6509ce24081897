//! Internal wire protocol (C1) for peer-to-peer communication across the
//! fabric: node agents, the coordinator, and the task manager's dispatch
//! workers all speak this one protocol.
//!
//! # Framing
//!
//! ```text
//! +----------------+-----------------+
//! | Length (4, LE) |  Payload (N)    |
//! +----------------+-----------------+
//! ```
//!
//! The payload is a `bincode`-encoded [`Envelope`]. There is no separate
//! header for flags or checksums — exactly a 4-byte little-endian length
//! prefix, nothing more. The receiver reads
//! exactly `L` bytes under a configurable deadline; a connection that
//! closes mid-frame yields [`crate::error::FabricError::TruncatedFrame`],
//! and a length beyond the configured cap yields
//! [`crate::error::FabricError::OversizedFrame`].

pub mod codec;
pub mod types;

pub use codec::FrameCodec;
pub use types::{
    FlightOpcode, FrameBatch, InferenceResult, NodeDescriptor, NodeInfoUpdate, PlacementAnswer,
    PlacementQuery, SubTaskRef,
};

use crate::common::NodeId;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The closed enumeration of message kinds. An unknown
/// kind on the wire is impossible to construct in Rust (the enum is
/// closed) — the `BadEnvelope` case arises only at the front-end JSON
/// boundary (`gateway`), where tags are strings rather than a Rust enum's
/// discriminant, and at `bincode` decode failures on malformed bytes.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum Message {
    GetNodeInfo,
    AnsNodeInfo(NodeDescriptor),
    GetNodesInfo,
    AnsNodesInfo(Vec<NodeDescriptor>),
    SingleNodeInfo(NodeDescriptor),
    GetObjectsNew {
        sub_task: SubTaskRef,
        frames: FrameBatch,
    },
    AnsGetObjects {
        sub_task: SubTaskRef,
        result: InferenceResult,
    },
    SelectedCenterNode(NodeDescriptor),
    UpdateNodeInfo(NodeInfoUpdate),
    Shutdown,
    GetFlying(FlightOpcode),
    MoveMachine(FlightOpcode),
    Ask(PlacementQuery),
    Placement(PlacementAnswer),
    /// Local shortcut used by in-process placement; carries
    /// the same payload as `Ask` when the oracle is co-located with the
    /// task manager.
    DistributeAlgorithm(PlacementQuery),
}

impl Message {
    /// Name of this message's kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::GetNodeInfo => "get_node_info",
            Message::AnsNodeInfo(_) => "ans_node_info",
            Message::GetNodesInfo => "get_nodes_info",
            Message::AnsNodesInfo(_) => "ans_nodes_info",
            Message::SingleNodeInfo(_) => "single_node_info",
            Message::GetObjectsNew { .. } => "get_objects_new",
            Message::AnsGetObjects { .. } => "ans_get_objects",
            Message::SelectedCenterNode(_) => "selected_center_node",
            Message::UpdateNodeInfo(_) => "update_node_info",
            Message::Shutdown => "shutdown",
            Message::GetFlying(_) => "get_flying",
            Message::MoveMachine(_) => "move_machine",
            Message::Ask(_) => "ask",
            Message::Placement(_) => "placement",
            Message::DistributeAlgorithm(_) => "distribute_algorithm",
        }
    }
}

/// A message together with its bus-level addressing: a monotonic id for
/// request/response correlation and an optional reply hint (the address a
/// handler should answer to, rather than the socket the request arrived
/// on).
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Envelope {
    pub message_id: u64,
    pub reply_hint: Option<NodeId>,
    pub message: Message,
}

impl Envelope {
    pub fn new(message_id: u64, message: Message) -> Self {
        Self {
            message_id,
            reply_hint: None,
            message,
        }
    }

    pub fn with_reply_hint(mut self, hint: NodeId) -> Self {
        self.reply_hint = Some(hint);
        self
    }
}
