//! `framegrid-node`: the per-process entry point.
//!
//! Every process runs C1-C3 (wire protocol, node agent, membership) for as
//! long as it lives. Whichever process the election rule currently names
//! as coordinator additionally activates C4-C8 (coordinator state,
//! placement client, task manager, front-end gateway, sink client) and
//! tears them back down the moment it loses that role.

use framegrid::agent::inference::StubInferenceRunner;
use framegrid::agent::NodeAgent;
use framegrid::common::NodeId;
use framegrid::config::Config;
use framegrid::coordinator::CoordinatorState;
use framegrid::error::FabricError;
use framegrid::gateway::Gateway;
use framegrid::membership::Membership;
use framegrid::placement::{OracleClient, PlacementClient};
use framegrid::pool::ConnectionPool;
use framegrid::protocol::NodeDescriptor;
use framegrid::sink::TcpSinkClient;
use framegrid::task_manager::dag::StubFrameSplitter;
use framegrid::task_manager::TaskManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("framegrid.toml"));
    let config = match Config::load(&config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    let self_id = NodeId::from_string(format!("{}:{}", config.machine_ip, config.port));
    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = config.port, "failed to bind node listener");
            std::process::exit(1);
        }
    };

    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(5)));
    let membership = Arc::new(Membership::new(self_id.clone(), pool.clone(), config.clone()));
    let agent = NodeAgent::new(
        self_id.clone(),
        config.clone(),
        membership.clone(),
        pool.clone(),
        Arc::new(StubInferenceRunner),
    );

    let descriptor = NodeDescriptor::new(
        self_id.clone(),
        config.cpu_memory,
        config.bandwidth,
        config.memory,
    );
    membership.bootstrap(descriptor).await;

    tokio::spawn(agent.clone().run_accept_loop(listener));
    agent.spawn_heartbeat();

    info!(node = %self_id, port = config.port, "framegrid node started");

    run_coordinator_supervisor(self_id.clone(), config, membership, pool, agent).await;

    info!(node = %self_id, "framegrid node exiting");
}

/// Services only the current coordinator runs. Torn down as soon as this
/// process is no longer the elected coordinator.
struct CoordinatorServices {
    accept_loop: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl CoordinatorServices {
    fn stop(self) {
        self.accept_loop.abort();
        self.sweeper.abort();
    }
}

/// Polls the election outcome once per heartbeat interval and flips C4-C8
/// on or off accordingly, returning once `shutdown` fires (exit code 0 on
/// a clean shutdown).
async fn run_coordinator_supervisor(
    self_id: NodeId,
    config: Arc<Config>,
    membership: Arc<Membership>,
    pool: Arc<ConnectionPool>,
    agent: Arc<NodeAgent>,
) {
    let mut shutdown = agent.shutdown_watch();
    let mut poll = tokio::time::interval(config.heartbeat_interval);
    let mut active: Option<CoordinatorServices> = None;

    loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(services) = active.take() {
                        services.stop();
                    }
                    return;
                }
            }
        }

        let holds_role = membership.view.is_coordinator(&self_id);
        match (holds_role, active.is_some()) {
            (true, false) => {
                info!(node = %self_id, "elected coordinator, activating C4-C8");
                match start_coordinator_services(
                    self_id.clone(),
                    config.clone(),
                    membership.clone(),
                    pool.clone(),
                    agent.clone(),
                )
                .await
                {
                    Ok(services) => active = Some(services),
                    Err(e) => warn!(error = %e, "failed to activate coordinator services"),
                }
            }
            (false, true) => {
                info!(node = %self_id, "lost coordinator role, tearing down C4-C8");
                if let Some(services) = active.take() {
                    services.stop();
                }
            }
            _ => {}
        }
    }
}

async fn start_coordinator_services(
    self_id: NodeId,
    config: Arc<Config>,
    membership: Arc<Membership>,
    pool: Arc<ConnectionPool>,
    agent: Arc<NodeAgent>,
) -> framegrid::Result<CoordinatorServices> {
    let ui_listener = TcpListener::bind((config.ui_ip.as_str(), config.ui_port)).await?;

    let coordinator_state = Arc::new(CoordinatorState::new(membership.view.clone(), config.clone()));
    let sweeper = tokio::spawn(
        coordinator_state
            .clone()
            .run_expiry_sweeper(self_id.clone(), agent.shutdown_watch()),
    );

    let oracle_addr = format!("{}:{}", config.alg_ip, config.alg_port)
        .parse()
        .map_err(|_| FabricError::Configuration("invalid alg_ip/alg_port".to_string()))?;
    let placement: Arc<dyn PlacementClient> = Arc::new(OracleClient::new(
        oracle_addr,
        config.max_frame_size,
        Duration::from_secs(5),
    ));

    let sink_addr = format!("{}:{}", config.sink_ip, config.sink_port)
        .parse()
        .map_err(|_| FabricError::Configuration("invalid sink_ip/sink_port".to_string()))?;
    let sink = Arc::new(TcpSinkClient::new(
        sink_addr,
        config.archival_retries,
        Duration::from_secs(5),
    ));

    // The frame splitter has no wire contract of its own, unlike the
    // placement oracle and sink, so there is nothing to dial here; a real
    // splitter process would be wired in behind the same `FrameSplitter`
    // trait.
    let splitter = Arc::new(StubFrameSplitter {
        total_frames: config.groups_per_job * config.tasks_per_group,
        frame_size_bytes: 1024,
    });

    let task_manager = TaskManager::new(
        self_id,
        config,
        pool,
        placement,
        splitter,
        sink,
        agent.shutdown_watch(),
    );

    let gateway = Gateway::new(agent.clone(), coordinator_state, task_manager, agent.shutdown_watch());
    let accept_loop = tokio::spawn(gateway.run_accept_loop(ui_listener));

    Ok(CoordinatorServices { accept_loop, sweeper })
}
