//! Shared identifiers and small value types used across every module.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Node identity. Always `ip:port`; wrapped in a newtype so a bare
/// formatted string can't be confused with a job id or sub-task id at a
/// call site.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.0
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Job identity, a front-end-supplied UUID.
pub type JobId = uuid::Uuid;

/// Index of a group within a job (0-based, default 10 groups per job).
pub type GroupIdx = usize;

/// Index of a sub-task within a group (0-based, default 10 per group).
pub type TaskIdx = usize;

/// Sub-task identity: `"{job_id}_{group_idx}_{task_idx}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubTaskId(String);

impl SubTaskId {
    pub fn new(job_id: JobId, group_idx: GroupIdx, task_idx: TaskIdx) -> Self {
        Self(format!("{job_id}_{group_idx}_{task_idx}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 2-D coordinate used for the optional physical placement hints carried
/// on a Node Descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        let id = NodeId::from(addr);
        assert_eq!(id.as_str(), "127.0.0.1:5002");
        assert_eq!(id.socket_addr().unwrap(), addr);
    }

    #[test]
    fn sub_task_id_formats_as_job_group_task() {
        let job_id = uuid::Uuid::nil();
        let id = SubTaskId::new(job_id, 3, 7);
        assert_eq!(id.as_str(), format!("{job_id}_3_7"));
    }
}
