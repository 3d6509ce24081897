//! Job and sub-task data model.

use crate::common::{GroupIdx, JobId, NodeId, SubTaskId, TaskIdx};
use crate::protocol::FrameBatch;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Placing,
    Dispatching,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubTaskState {
    Queued,
    InFlight,
    Done,
    Failed,
}

/// One group's adjacency matrix and task names.
#[derive(Debug, Clone)]
pub struct Group {
    pub task_names: Vec<String>,
    /// `adjacency[i][j]` true means an edge i→j; only ever set for i<j.
    pub adjacency: Vec<Vec<bool>>,
}

impl Group {
    /// `true` iff every set edge satisfies i<j — the DAG well-formedness
    /// invariant.
    pub fn is_well_formed(&self) -> bool {
        let k = self.task_names.len();
        if self.adjacency.len() != k {
            return false;
        }
        for (i, row) in self.adjacency.iter().enumerate() {
            if row.len() != k {
                return false;
            }
            for (j, &edge) in row.iter().enumerate() {
                if edge && i >= j {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SubTask {
    pub id: SubTaskId,
    pub group_idx: GroupIdx,
    pub task_idx: TaskIdx,
    pub node: NodeId,
    pub payload: FrameBatch,
    pub size_bytes: u64,
    pub state: SubTaskState,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Monotonically increasing re-placement count, bounded at
    /// `config.placement_retries`.
    pub reassignment_count: u32,
    pub last_error: Option<String>,
}

impl SubTask {
    pub fn new(
        job_id: JobId,
        group_idx: GroupIdx,
        task_idx: TaskIdx,
        node: NodeId,
        payload: FrameBatch,
    ) -> Self {
        let size_bytes = payload.size_bytes();
        Self {
            id: SubTaskId::new(job_id, group_idx, task_idx),
            group_idx,
            task_idx,
            node,
            payload,
            size_bytes,
            state: SubTaskState::Queued,
            start: None,
            end: None,
            reassignment_count: 0,
            last_error: None,
        }
    }
}

pub struct Job {
    pub id: JobId,
    pub media: String,
    pub groups: Vec<Group>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn total_sub_tasks(&self) -> usize {
        self.groups.iter().map(|g| g.task_names.len()).sum()
    }
}
