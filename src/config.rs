//! Crate-wide configuration: a plain struct with sensible defaults,
//! loadable from a TOML file and overridable by environment variables.
//!
//! The key set below is closed — no additional configuration surface is
//! introduced.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// This node's advertised IP (`machine_ip`).
    pub machine_ip: String,
    /// Front-end UI gateway IP (`ui_ip`).
    pub ui_ip: String,
    /// Placement oracle IP (`alg_ip`).
    pub alg_ip: String,
    /// Front-end UI gateway port (`ui_port`), default 5007.
    pub ui_port: u16,
    /// Archival sink IP (`sink_ip`).
    pub sink_ip: String,
    /// Archival sink port (`sink_port`), default 5009.
    pub sink_port: u16,
    /// Placement oracle port, default 5008.
    pub alg_port: u16,
    /// Node agent / coordinator listen port (`port`), default 5002.
    pub port: u16,
    /// In-process dispatcher helper port, default 5005.
    pub dispatch_helper_port: u16,
    /// Per-node configured CPU memory budget, in bytes (`cpu_memory`).
    pub cpu_memory: u64,
    /// Per-node configured bandwidth capacity, in bytes/sec (`bandwidth`).
    pub bandwidth: u64,
    /// Per-node configured storage budget, in bytes (`memory`).
    pub memory: u64,
    /// Heartbeat interval, default 2s.
    pub heartbeat_interval: Duration,
    /// Coordinator member-expiry threshold, default 20s.
    pub expiry_threshold: Duration,
    /// Coordinator expiry sweep interval, default 10s.
    pub expiry_sweep_interval: Duration,
    /// Admission-control parallelism cap (`dealing`), default 2.
    pub admission_parallelism: usize,
    /// Max consecutive re-placements per sub-task before `SubTaskFailed`.
    pub placement_retries: u32,
    /// Max archival retries on connect/send failure.
    pub archival_retries: u32,
    /// Default number of groups per job.
    pub groups_per_job: usize,
    /// Default number of sub-tasks per group.
    pub tasks_per_group: usize,
    /// DAG edge probability (i->j, i<j).
    pub dag_edge_probability: f64,
    /// Read deadline for heartbeat-bearing sockets.
    pub heartbeat_read_deadline: Duration,
    /// Hard cap on a decoded frame's payload length.
    pub max_frame_size: u32,
    /// Discovery sweep per-address timeout.
    pub discovery_probe_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_ip: "127.0.0.1".to_string(),
            ui_ip: "127.0.0.1".to_string(),
            alg_ip: "127.0.0.1".to_string(),
            ui_port: 5007,
            sink_ip: "127.0.0.1".to_string(),
            sink_port: 5009,
            alg_port: 5008,
            port: 5002,
            dispatch_helper_port: 5005,
            cpu_memory: 4 * 1024 * 1024 * 1024,
            bandwidth: 100 * 1024 * 1024,
            memory: 64 * 1024 * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(2),
            expiry_threshold: Duration::from_secs(20),
            expiry_sweep_interval: Duration::from_secs(10),
            admission_parallelism: 2,
            placement_retries: 3,
            archival_retries: 3,
            groups_per_job: 10,
            tasks_per_group: 10,
            dag_edge_probability: 0.3,
            heartbeat_read_deadline: Duration::from_secs(10),
            max_frame_size: 64 * 1024 * 1024,
            discovery_probe_timeout: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Load from a TOML file if present, falling back to defaults;
    /// `FRAMEGRID_*` environment variables (e.g. `FRAMEGRID_PORT`) override
    /// individual fields that are simple integers or strings.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text).map_err(|e| {
                crate::error::FabricError::Configuration(format!("{}: {e}", path.display()))
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FRAMEGRID_MACHINE_IP") {
            self.machine_ip = v;
        }
        if let Ok(v) = std::env::var("FRAMEGRID_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("FRAMEGRID_UI_PORT") {
            if let Ok(port) = v.parse() {
                self.ui_port = port;
            }
        }
    }
}
