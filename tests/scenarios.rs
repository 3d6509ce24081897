//! End-to-end scenario tests, exercising the control plane
//! across real `NodeAgent` sockets bound to loopback with the
//! placement/sink/splitter/inference seams replaced by their test doubles
//! — no real oracle, archival, or inference process required.

use async_trait::async_trait;
use framegrid::agent::inference::StubInferenceRunner;
use framegrid::agent::NodeAgent;
use framegrid::common::NodeId;
use framegrid::config::Config;
use framegrid::error::{FabricError, Result};
use framegrid::membership::Membership;
use framegrid::placement::{PlacementClient, StubPlacementClient, UnavailablePlacementClient};
use framegrid::pool::ConnectionPool;
use framegrid::protocol::{NodeDescriptor, PlacementAnswer, PlacementQuery};
use framegrid::sink::{RecordingSinkClient, SinkClient};
use framegrid::task_manager::dag::StubFrameSplitter;
use framegrid::task_manager::progress::ProgressEvent;
use framegrid::task_manager::TaskManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Boots one real `NodeAgent` on an ephemeral loopback port and returns its
/// identity plus the accept-loop task, mirroring `task_manager`'s own
/// `spawn_echo_agent` test helper.
async fn spawn_node() -> (NodeId, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(Config::default());
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
    let self_id = NodeId::from(addr);
    let membership = Arc::new(Membership::new(self_id.clone(), pool.clone(), config.clone()));
    let agent = NodeAgent::new(
        self_id.clone(),
        config,
        membership,
        pool,
        Arc::new(StubInferenceRunner),
    );
    let handle = tokio::spawn(agent.run_accept_loop(listener));
    (self_id, handle)
}

fn small_config() -> Arc<Config> {
    let mut config = Config::default();
    config.groups_per_job = 1;
    config.tasks_per_group = 4;
    Arc::new(config)
}

/// Scenario 1 ("Happy path"): a job dispatched across a multi-node fabric
/// emits `subtasks_info`, `tasks_info`, one `task_info` per sub-task, a
/// terminal `task_info` with `path`, and one archival session per frame.
#[tokio::test]
async fn happy_path_completes_with_one_archival_session_per_frame() {
    let (a, _a_handle) = spawn_node().await;
    let (b, _b_handle) = spawn_node().await;
    let (c, _c_handle) = spawn_node().await;

    let config = small_config();
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
    let placement = Arc::new(StubPlacementClient::new(vec![a, b, c]));
    let splitter = Arc::new(StubFrameSplitter {
        total_frames: 40,
        frame_size_bytes: 8,
    });
    let sink = Arc::new(RecordingSinkClient::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = TaskManager::new(
        NodeId::from_string("coordinator:0"),
        config,
        pool,
        placement,
        splitter,
        sink.clone(),
        shutdown_rx,
    );

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let job_id = uuid::Uuid::new_v4();
    manager.submit_job(job_id, "video.mp4".to_string(), progress_tx);

    let mut saw_subtasks_info = false;
    let mut saw_tasks_info = false;
    let mut task_info_count = 0usize;
    let mut completion_path = None;

    for _ in 0..300 {
        match tokio::time::timeout(Duration::from_secs(2), progress_rx.recv()).await {
            Ok(Some(ProgressEvent::SubtasksInfo { groups, .. })) => {
                saw_subtasks_info = true;
                assert_eq!(groups.len(), 1);
                assert_eq!(groups[0].len(), 4);
            }
            Ok(Some(ProgressEvent::TasksInfo { assignments, .. })) => {
                saw_tasks_info = true;
                assert_eq!(assignments.len(), 4);
            }
            Ok(Some(ProgressEvent::TaskInfo { sub_task_id: Some(_), path: None, .. })) => {
                task_info_count += 1;
            }
            Ok(Some(ProgressEvent::TaskInfo { path: Some(path), .. })) => {
                completion_path = Some(path);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }

    assert!(saw_subtasks_info, "expected one subtasks_info event");
    assert!(saw_tasks_info, "expected one tasks_info event");
    assert_eq!(task_info_count, 4, "expected one task_info per sub-task");
    let path = completion_path.expect("job should complete");
    assert!(path.ends_with(&job_id.to_string()));
    assert_eq!(sink.images.lock().len(), 40);
}

/// `PlacementClient` whose first call (the initial per-group placement)
/// round-robins across every node it was built with, and whose later
/// calls (single-task re-placement after a connect failure) always land
/// on the first node — modeling "B has become unreachable" without
/// needing a stateful fake oracle process.
struct ReplacementClient {
    initial: Vec<NodeId>,
}

#[async_trait]
impl PlacementClient for ReplacementClient {
    async fn place(&self, query: PlacementQuery) -> Result<PlacementAnswer> {
        if query.task_name_list.len() == 1 {
            let only = self.initial[0].clone();
            return Ok(PlacementAnswer {
                assignments: vec![(query.task_name_list[0].clone(), only)],
            });
        }
        let assignments = query
            .task_name_list
            .into_iter()
            .enumerate()
            .map(|(i, task)| (task, self.initial[i % self.initial.len()].clone()))
            .collect();
        Ok(PlacementAnswer { assignments })
    }
}

/// Scenario 2 ("Mid-flight peer loss"): once a destination node goes
/// unreachable, every sub-task assigned to it gets exactly one
/// `reassign_info` and the job still reaches completion.
#[tokio::test]
async fn mid_flight_peer_loss_reassigns_and_job_still_completes() {
    let (a, _a_handle) = spawn_node().await;
    let (b, b_handle) = spawn_node().await;

    let config = small_config();
    let pool = Arc::new(ConnectionPool::new(Duration::from_millis(200)));
    let placement = Arc::new(ReplacementClient {
        initial: vec![a.clone(), b.clone()],
    });
    let splitter = Arc::new(StubFrameSplitter {
        total_frames: 8,
        frame_size_bytes: 4,
    });
    let sink = Arc::new(RecordingSinkClient::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = TaskManager::new(
        NodeId::from_string("coordinator:0"),
        config,
        pool,
        placement,
        splitter,
        sink,
        shutdown_rx,
    );

    // Kill B immediately so any sub-task routed to it hits a connect
    // failure rather than racing a real in-flight request.
    b_handle.abort();
    drop(b);

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let job_id = uuid::Uuid::new_v4();
    manager.submit_job(job_id, "video.mp4".to_string(), progress_tx);

    let mut reassign_count = 0usize;
    let completion_path = loop {
        match tokio::time::timeout(Duration::from_secs(5), progress_rx.recv()).await {
            Ok(Some(ProgressEvent::ReassignInfo { to, .. })) => {
                reassign_count += 1;
                assert_eq!(to, a);
            }
            Ok(Some(ProgressEvent::TaskInfo { path: Some(path), .. })) => break Some(path),
            Ok(Some(_)) => continue,
            _ => break None,
        }
    };

    assert!(reassign_count >= 1, "expected at least one reassignment off the dead node");
    let path = completion_path.expect("job should still complete after reassignment");
    assert!(path.ends_with(&job_id.to_string()));
}

/// Scenario 3 ("Coordinator churn"): once the current coordinator is
/// removed from the view, the next recompute fails over to the surviving
/// member with the largest `compute_free`.
#[tokio::test]
async fn coordinator_churn_elects_next_largest_free_memory_survivor() {
    let config = Arc::new(Config::default());
    let pool = Arc::new(ConnectionPool::new(Duration::from_millis(200)));
    let membership = Membership::new(NodeId::from_string("self:0"), pool, config);

    let mut a = NodeDescriptor::new(NodeId::from_string("a:1"), 4096, 10, 100);
    a.compute_free = 4096;
    let mut b = NodeDescriptor::new(NodeId::from_string("b:1"), 4096, 10, 100);
    b.compute_free = 8192;
    let mut c = NodeDescriptor::new(NodeId::from_string("c:1"), 4096, 10, 100);
    c.compute_free = 2048;

    membership.view.upsert(a.clone());
    membership.view.upsert(b.clone());
    membership.view.upsert(c.clone());
    membership.recompute_and_broadcast().await;
    assert_eq!(membership.view.coordinator(), Some(b.id.clone()));

    membership.view.remove(&b.id);
    membership.recompute_and_broadcast().await;
    assert_eq!(
        membership.view.coordinator(),
        Some(a.id.clone()),
        "election should fail over to the next-largest compute_free survivor"
    );
}

/// Scenario 4 ("Placement outage"): with the oracle unreachable, the job
/// terminates with a failure event, no sub-tasks are dispatched, and the
/// sink never receives a single image.
#[tokio::test]
async fn placement_outage_fails_the_job_with_no_dispatch() {
    let config = small_config();
    let pool = Arc::new(ConnectionPool::new(Duration::from_millis(200)));
    let placement = Arc::new(UnavailablePlacementClient);
    let splitter = Arc::new(StubFrameSplitter {
        total_frames: 8,
        frame_size_bytes: 4,
    });
    let sink = Arc::new(RecordingSinkClient::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = TaskManager::new(
        NodeId::from_string("coordinator:0"),
        config,
        pool,
        placement,
        splitter,
        sink.clone(),
        shutdown_rx,
    );

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let job_id = uuid::Uuid::new_v4();
    manager.submit_job(job_id, "video.mp4".to_string(), progress_tx);

    let event = tokio::time::timeout(Duration::from_secs(2), progress_rx.recv())
        .await
        .unwrap()
        .expect("expected a failure event");

    match event {
        ProgressEvent::TaskInfo { sub_task_id: None, path: None, error: Some(_), .. } => {}
        other => panic!("expected a job-level failure task_info, got {other:?}"),
    }
    assert!(sink.images.lock().is_empty());
    assert!(sink.results.lock().is_empty());
}

/// `SinkClient` that simulates one image arriving truncated in transit: the
/// body it is handed for `image_index == 1` is one byte short of the
/// `filesize` the caller reports, so that single archival session aborts
/// with `ArchivalFailed` while every other image ships normally.
struct TruncatesFirstImageSink {
    recorded: parking_lot::Mutex<Vec<usize>>,
}

#[async_trait]
impl SinkClient for TruncatesFirstImageSink {
    async fn send_image(
        &self,
        _task_id: &str,
        _subtask_name: &str,
        image_index: usize,
        _total_images: usize,
        _filename: &str,
        filesize: usize,
        body: &[u8],
    ) -> Result<()> {
        let streamed = if image_index == 1 {
            &body[..body.len().saturating_sub(1)]
        } else {
            body
        };
        if filesize != streamed.len() {
            return Err(FabricError::ArchivalFailed(format!(
                "filesize {filesize} does not match streamed body length {}",
                streamed.len()
            )));
        }
        self.recorded.lock().push(image_index);
        Ok(())
    }

    async fn send_task_result(&self, _task_id: &str, _subtask_name: &str, _result: &str) -> Result<()> {
        Ok(())
    }
}

/// Scenario 5 ("Archival size mismatch"): a single image's session aborts
/// with `ArchivalFailed` when its streamed length doesn't match `filesize`,
/// but that failure is contained to that one archival session — the job
/// still reaches completion with a terminal `task_info`.
#[tokio::test]
async fn archival_size_mismatch_aborts_one_session_but_job_still_completes() {
    let (a, _a_handle) = spawn_node().await;

    let config = Arc::new({
        let mut c = Config::default();
        c.groups_per_job = 1;
        c.tasks_per_group = 1;
        c
    });
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
    let placement = Arc::new(StubPlacementClient::new(vec![a]));
    let splitter = Arc::new(StubFrameSplitter {
        total_frames: 4,
        frame_size_bytes: 8,
    });
    let sink = Arc::new(TruncatesFirstImageSink {
        recorded: parking_lot::Mutex::new(Vec::new()),
    });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = TaskManager::new(
        NodeId::from_string("coordinator:0"),
        config,
        pool,
        placement,
        splitter,
        sink.clone(),
        shutdown_rx,
    );

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let job_id = uuid::Uuid::new_v4();
    manager.submit_job(job_id, "video.mp4".to_string(), progress_tx);

    let mut completion_path = None;
    for _ in 0..300 {
        match tokio::time::timeout(Duration::from_secs(2), progress_rx.recv()).await {
            Ok(Some(ProgressEvent::TaskInfo { path: Some(path), .. })) => {
                completion_path = Some(path);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }

    let path = completion_path.expect("job should complete despite one aborted archival session");
    assert!(path.ends_with(&job_id.to_string()));
    assert_eq!(
        sink.recorded.lock().len(),
        3,
        "one of the 4 images should be missing from the sink due to its aborted session"
    );
}

/// Scenario 6 ("Graceful shutdown"): `shutdown` always succeeds, closes
/// every pooled socket, and is observable on the watch channel.
#[tokio::test]
async fn graceful_shutdown_closes_the_pool_and_signals_every_watcher() {
    let (peer, _peer_handle) = spawn_node().await;

    let config = Arc::new(Config::default());
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
    let self_id = NodeId::from_string("127.0.0.1:0");
    let membership = Arc::new(Membership::new(self_id.clone(), pool.clone(), config.clone()));
    let agent = NodeAgent::new(
        self_id,
        config,
        membership,
        pool.clone(),
        Arc::new(StubInferenceRunner),
    );

    pool.get_or_connect(&peer).await.unwrap();
    assert_eq!(pool.len(), 1);

    let mut watcher = agent.shutdown_watch();
    assert!(!agent.is_shutting_down());

    agent.shutdown();

    watcher.changed().await.unwrap();
    assert!(*watcher.borrow());
    assert!(agent.is_shutting_down());
    assert!(pool.is_empty());
}

/// Also covers a non-blocking edge case of the Placement Client seam: an
/// oracle reachable but returning no replacement for a re-placement query
/// still surfaces as `PlacementUnavailable` to the task manager's
/// exhausted-retry path, matching `FabricError::PlacementUnavailable`'s
/// contract used throughout scenario 4 and `handle_connect_failure`.
#[tokio::test]
async fn unavailable_placement_client_reports_placement_unavailable() {
    let client = UnavailablePlacementClient;
    let query = PlacementQuery {
        task_name_list: vec!["t0".to_string()],
        adjacency_matrix: vec![vec![false]],
        size_list: vec![0],
    };
    let err = client.place(query).await.unwrap_err();
    assert!(matches!(err, FabricError::PlacementUnavailable(_)));
}
