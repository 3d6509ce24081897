//! Wire-level value types carried inside [`super::Message`] payloads.
//!
//! Cyclic references (a node's neighbor set, its live connection) are never
//! part of these types — only identity strings travel on the wire, and are
//! resolved back to full descriptors within a process, per the "no cyclic
//! object graphs on the wire" design note.

use crate::common::{Coordinates, NodeId, SubTaskId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A node's self-reported telemetry and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub processing_speed: f64,

    pub compute_total: u64,
    pub compute_used: u64,
    pub compute_free: u64,

    pub storage_total: u64,
    pub storage_used: u64,
    pub storage_free: u64,

    pub bandwidth_capacity: u64,
    pub bandwidth_free: u64,
    pub cpu_used_rate: f64,

    pub waiting: u32,
    pub dealing: u32,
    pub dealt: u64,

    /// Milliseconds since the Unix epoch; wall-clock, not monotonic, since
    /// it is compared across processes.
    pub last_heartbeat_millis: u64,

    pub coordinates: Coordinates,
    pub sense_radius: f64,

    /// Identity strings only — never full descriptors.
    pub neighbors: Vec<NodeId>,
}

impl NodeDescriptor {
    pub fn new(id: NodeId, cpu_memory: u64, bandwidth: u64, storage: u64) -> Self {
        Self {
            id,
            processing_speed: 1.0,
            compute_total: cpu_memory,
            compute_used: 0,
            compute_free: cpu_memory,
            storage_total: storage,
            storage_used: 0,
            storage_free: storage,
            bandwidth_capacity: bandwidth,
            bandwidth_free: bandwidth,
            cpu_used_rate: 0.0,
            waiting: 0,
            dealing: 0,
            dealt: 0,
            last_heartbeat_millis: now_millis(),
            coordinates: Coordinates { x: 0.0, y: 0.0 },
            sense_radius: 0.0,
            neighbors: Vec::new(),
        }
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat_millis = now_millis();
    }

    pub fn last_heartbeat(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_heartbeat_millis)
    }

    /// `used + free == total` for every resource — the Node Descriptor's
    /// core balance invariant.
    pub fn resources_balanced(&self) -> bool {
        self.compute_used + self.compute_free == self.compute_total
            && self.storage_used + self.storage_free == self.storage_total
    }

    pub fn within_parallelism_cap(&self, cap: u32) -> bool {
        self.dealing <= cap
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A batch of frames handed to a worker for inference. The splitter and
/// inference worker are external collaborators; frame bodies
/// are treated as opaque byte blobs here.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct FrameBatch {
    pub frames: Vec<Vec<u8>>,
}

impl FrameBatch {
    pub fn size_bytes(&self) -> u64 {
        self.frames.iter().map(|f| f.len() as u64).sum()
    }
}

/// Opaque inference result handed back from an inference worker.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct InferenceResult {
    pub frame_count: usize,
    pub payload: Vec<u8>,
}

/// One `{task, node}` placement query submitted to the oracle for a group.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct PlacementQuery {
    pub task_name_list: Vec<String>,
    pub adjacency_matrix: Vec<Vec<bool>>,
    pub size_list: Vec<u64>,
}

/// The oracle's answer: an ordered list of `{task, node}` pairs covering
/// exactly the submitted `task_name_list`.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct PlacementAnswer {
    pub assignments: Vec<(String, NodeId)>,
}

/// Resource keys a node's operator may update live, per the closed
/// `update_node_info` contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Encode, Decode)]
pub struct NodeInfoUpdate {
    pub cpu_memory: Option<u64>,
    pub bandwidth: Option<u64>,
    pub memory: Option<u64>,
}

/// Opcode forwarded verbatim to the flight-control collaborator (out of
/// scope).
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct FlightOpcode {
    pub opcode: String,
    pub payload: Vec<u8>,
}

/// A reference to a sub-task carried in `get_objects_new`/`ans_get_objects`.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct SubTaskRef {
    pub sub_task_id: String,
}

impl SubTaskRef {
    pub fn new(id: &SubTaskId) -> Self {
        Self {
            sub_task_id: id.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_descriptor_is_balanced_and_idle() {
        let d = NodeDescriptor::new(NodeId::from_string("a:1"), 1024, 10, 100);
        assert!(d.resources_balanced());
        assert!(d.within_parallelism_cap(2));
        assert_eq!(d.waiting, 0);
    }
}
