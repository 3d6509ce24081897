//! Progress events: the domain-level events the task
//! manager emits as a job moves through split, placement, dispatch, and
//! completion. The front-end gateway (C7) serializes these to the JSON
//! tags the front-end protocol exposes.

use crate::common::{JobId, NodeId};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Emitted once, right after DAG split: every group's task names.
    SubtasksInfo {
        job_id: JobId,
        groups: Vec<Vec<String>>,
    },
    /// Emitted once, right after every group has been placed.
    TasksInfo {
        job_id: JobId,
        assignments: Vec<(String, NodeId)>,
    },
    /// Covers every shape of the front-end's `task_info` tag: a
    /// per-sub-task completion (`sub_task_id` set), the final success
    /// event (`path` set), and a job-level failure terminal event
    /// (`error` set, e.g. a placement outage) — one tag covers all three.
    TaskInfo {
        job_id: JobId,
        sub_task_id: Option<String>,
        path: Option<String>,
        error: Option<String>,
    },
    /// Emitted once a sub-task migrates to a new destination.
    ReassignInfo {
        job_id: JobId,
        sub_task_id: String,
        from: NodeId,
        to: NodeId,
    },
}
