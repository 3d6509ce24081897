use thiserror::Error;

/// Error kinds for the compute fabric, one variant per failure domain named
/// in the control-plane design plus the ambient IO/serialization/config
/// failures every module needs to propagate with `?`.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before {expected} bytes arrived ({got} received)")]
    TruncatedFrame { expected: u32, got: u32 },

    #[error("frame length {len} exceeds the {max} byte cap")]
    OversizedFrame { len: u32, max: u32 },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("heartbeat lost from coordinator {0}")]
    HeartbeatLost(String),

    /// Admission control only blocks per the control-plane design; this
    /// variant exists to keep the error enumeration closed but has no
    /// reachable constructor.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("placement oracle unavailable: {0}")]
    PlacementUnavailable(String),

    #[error("sub-task {0} failed after exhausting re-placement attempts")]
    SubTaskFailed(String),

    #[error("archival session failed: {0}")]
    ArchivalFailed(String),

    #[error("rejected envelope with unknown or malformed tag: {0}")]
    BadEnvelope(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;

impl From<bincode::error::EncodeError> for FabricError {
    fn from(e: bincode::error::EncodeError) -> Self {
        FabricError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for FabricError {
    fn from(e: bincode::error::DecodeError) -> Self {
        FabricError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(e: serde_json::Error) -> Self {
        FabricError::Serialization(e.to_string())
    }
}
