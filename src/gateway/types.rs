//! Front-end JSON wire types: newline-terminated JSON
//! envelopes of shape `{"type": ..., "content": ...}`, the same envelope
//! shape the archival sink protocol uses ([`crate::sink`]).
//!
//! Inbound tags are a closed set; an unrecognized `type` fails to
//! deserialize and the connection is closed with `BadEnvelope`, the same
//! treatment framing errors get on the internal wire protocol.

use crate::common::{JobId, NodeId};
use crate::protocol::NodeDescriptor;
use crate::task_manager::progress::ProgressEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum InboundMessage {
    CreateTasks { media: String, job_id: JobId },
    StartAll,
    NodeInfo,
    Shutdown,
    GetFlying { opcode: String, payload: Vec<u8> },
    UpdateNodeInfo {
        cpu_memory: Option<u64>,
        bandwidth: Option<u64>,
        memory: Option<u64>,
    },
    AddNewNode { node_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "content")]
pub enum OutboundMessage {
    #[serde(rename = "start_success")]
    StartSuccess,
    #[serde(rename = "ans_node_info")]
    AnsNodeInfo { node: NodeDescriptor },
    #[serde(rename = "cluster_info")]
    ClusterInfo { members: Vec<NodeDescriptor> },
    #[serde(rename = "Subtasks_info")]
    SubtasksInfo { job_id: JobId, groups: Vec<Vec<String>> },
    #[serde(rename = "tasks_info")]
    TasksInfo {
        job_id: JobId,
        assignments: Vec<(String, NodeId)>,
    },
    #[serde(rename = "task_info")]
    TaskInfo {
        job_id: JobId,
        sub_task_id: Option<String>,
        path: Option<String>,
        error: Option<String>,
    },
    #[serde(rename = "reassign_info")]
    ReassignInfo {
        job_id: JobId,
        sub_task_id: String,
        from: NodeId,
        to: NodeId,
    },
}

impl From<ProgressEvent> for OutboundMessage {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::SubtasksInfo { job_id, groups } => {
                OutboundMessage::SubtasksInfo { job_id, groups }
            }
            ProgressEvent::TasksInfo { job_id, assignments } => {
                OutboundMessage::TasksInfo { job_id, assignments }
            }
            ProgressEvent::TaskInfo {
                job_id,
                sub_task_id,
                path,
                error,
            } => OutboundMessage::TaskInfo {
                job_id,
                sub_task_id,
                path,
                error,
            },
            ProgressEvent::ReassignInfo {
                job_id,
                sub_task_id,
                from,
                to,
            } => OutboundMessage::ReassignInfo {
                job_id,
                sub_task_id,
                from,
                to,
            },
        }
    }
}
