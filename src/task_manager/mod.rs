//! Task Manager (C6): owns a job's sub-tasks, per-
//! destination FIFO queues and dispatch workers, re-placement on
//! failure, and result collection.
//!
//! Only one process holds an active `TaskManager` at a time — the
//! current coordinator.

pub mod dag;
pub mod job;
pub mod progress;
pub mod queue;

use crate::common::{JobId, NodeId, SubTaskId};
use crate::config::Config;
use crate::placement::PlacementClient;
use crate::pool::ConnectionPool;
use crate::protocol::{codec::FrameCodec, Envelope, Message, PlacementQuery, SubTaskRef};
use crate::sink::SinkClient;
use chrono::Utc;
use dag::FrameSplitter;
use dashmap::DashMap;
use job::{Job, JobState, SubTask, SubTaskState};
use progress::ProgressEvent;
use queue::NodeQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

struct JobHandle {
    job: Mutex<Job>,
    queues: DashMap<NodeId, Arc<NodeQueue>>,
    outcomes: Mutex<HashMap<SubTaskId, bool>>,
    total_sub_tasks: usize,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl JobHandle {
    /// Returns `node`'s queue, creating it if absent, and whether this
    /// call created it — checked and inserted under one `DashMap` shard
    /// lock so two concurrent first-enqueues for the same destination
    /// can't both believe they created the queue.
    fn queue_for(&self, node: &NodeId) -> (Arc<NodeQueue>, bool) {
        match self.queues.entry(node.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let queue = Arc::new(NodeQueue::new());
                e.insert(queue.clone());
                (queue, true)
            }
        }
    }

    /// Records one sub-task's terminal outcome and returns the archival
    /// path iff this was the last outstanding sub-task — the job's
    /// result bag has reached the full sub-task count.
    async fn record_outcome(&self, id: SubTaskId, success: bool) -> Option<String> {
        let mut outcomes = self.outcomes.lock().await;
        outcomes.insert(id, success);
        if outcomes.len() == self.total_sub_tasks {
            let job_id = self.job.lock().await.id;
            Some(format!("/archive/{job_id}"))
        } else {
            None
        }
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.progress_tx.send(event);
    }
}

pub struct TaskManager {
    self_id: NodeId,
    config: Arc<Config>,
    pool: Arc<ConnectionPool>,
    codec: FrameCodec,
    placement: Arc<dyn PlacementClient>,
    splitter: Arc<dyn FrameSplitter>,
    sink: Arc<dyn SinkClient>,
    jobs: DashMap<JobId, Arc<JobHandle>>,
    message_ids: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        pool: Arc<ConnectionPool>,
        placement: Arc<dyn PlacementClient>,
        splitter: Arc<dyn FrameSplitter>,
        sink: Arc<dyn SinkClient>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            codec: FrameCodec::new(config.max_frame_size),
            self_id,
            config,
            pool,
            placement,
            splitter,
            sink,
            jobs: DashMap::new(),
            message_ids: AtomicU64::new(1),
            shutdown_rx,
        })
    }

    fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Job ingest (steps 1-4): split, build the DAG,
    /// place every group, enqueue every sub-task on its assigned
    /// destination's queue, and spawn a dispatch worker for any queue
    /// not already being serviced.
    pub fn submit_job(
        self: &Arc<Self>,
        job_id: JobId,
        media: String,
        progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.ingest_job(job_id, media, progress_tx.clone()).await {
                warn!(job = %job_id, error = %e, "job ingest failed");
                let _ = progress_tx.send(ProgressEvent::TaskInfo {
                    job_id,
                    sub_task_id: None,
                    path: None,
                    error: Some(e.to_string()),
                });
            }
        });
    }

    async fn ingest_job(
        self: &Arc<Self>,
        job_id: JobId,
        media: String,
        progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    ) -> crate::error::Result<()> {
        let total_segments = self.config.groups_per_job * self.config.tasks_per_group;
        let segments = self.splitter.split(&media, total_segments).await?;

        let mut rng = rand::rng();
        let (groups, segments) = dag::build_groups(
            segments,
            self.config.groups_per_job,
            self.config.tasks_per_group,
            self.config.dag_edge_probability,
            &mut rng,
        );

        let job = Job {
            id: job_id,
            media,
            groups: groups.clone(),
            state: JobState::Placing,
            created_at: Utc::now(),
        };
        let total_sub_tasks = job.total_sub_tasks();

        progress_tx
            .send(ProgressEvent::SubtasksInfo {
                job_id,
                groups: groups.iter().map(|g| g.task_names.clone()).collect(),
            })
            .ok();

        let handle = Arc::new(JobHandle {
            job: Mutex::new(job),
            queues: DashMap::new(),
            outcomes: Mutex::new(HashMap::new()),
            total_sub_tasks,
            progress_tx: progress_tx.clone(),
        });
        self.jobs.insert(job_id, handle.clone());

        let mut all_assignments = Vec::new();
        let mut segment_offset = 0usize;
        for (group_idx, group) in groups.iter().enumerate() {
            let k = group.task_names.len();
            let group_segments = &segments[segment_offset..segment_offset + k];
            segment_offset += k;

            let sizes = group_segments.iter().map(|s| s.size_bytes()).collect();
            let query = PlacementQuery {
                task_name_list: group.task_names.clone(),
                adjacency_matrix: group.adjacency.clone(),
                size_list: sizes,
            };
            let answer = self.placement.place(query).await?;
            let assignment: HashMap<&str, NodeId> = answer
                .assignments
                .iter()
                .map(|(name, node)| (name.as_str(), node.clone()))
                .collect();

            for (task_idx, task_name) in group.task_names.iter().enumerate() {
                let node = assignment
                    .get(task_name.as_str())
                    .cloned()
                    .ok_or_else(|| {
                        crate::error::FabricError::PlacementUnavailable(format!(
                            "oracle mapping missing task {task_name}"
                        ))
                    })?;
                all_assignments.push((task_name.clone(), node.clone()));
                let sub_task = SubTask::new(
                    job_id,
                    group_idx,
                    task_idx,
                    node.clone(),
                    group_segments[task_idx].clone(),
                );
                self.enqueue(&handle, node, sub_task).await;
            }
        }

        handle.job.lock().await.state = JobState::Dispatching;
        progress_tx
            .send(ProgressEvent::TasksInfo {
                job_id,
                assignments: all_assignments,
            })
            .ok();
        Ok(())
    }

    /// Pushes `sub_task` onto `node`'s queue, spawning that queue's
    /// dispatch worker the first time it is used. Awaited directly by
    /// every caller rather than
    /// fire-and-forget: spawning a task per push would let two pushes to
    /// the same destination race past each other, breaking the
    /// strict-insertion-order guarantee on a per-node queue.
    async fn enqueue(self: &Arc<Self>, handle: &Arc<JobHandle>, node: NodeId, sub_task: SubTask) {
        let (queue, is_new_queue) = handle.queue_for(&node);
        queue.push_back(sub_task).await;
        if is_new_queue {
            self.spawn_dispatch_worker(handle.clone(), node, queue);
        }
    }

    /// One dispatch worker per `(job, destination)` queue, strictly FIFO.
    fn spawn_dispatch_worker(
        self: &Arc<Self>,
        handle: Arc<JobHandle>,
        destination: NodeId,
        queue: Arc<NodeQueue>,
    ) {
        let manager = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                let sub_task = tokio::select! {
                    st = queue.pop_front() => st,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                };
                manager
                    .process_sub_task(&handle, &destination, &queue, sub_task)
                    .await;
            }
        });
    }

    async fn process_sub_task(
        self: &Arc<Self>,
        handle: &Arc<JobHandle>,
        destination: &NodeId,
        queue: &Arc<NodeQueue>,
        mut sub_task: SubTask,
    ) {
        sub_task.state = SubTaskState::InFlight;
        sub_task.start = Some(Utc::now());

        match self.attempt_dispatch(destination, &sub_task).await {
            DispatchOutcome::Success(result) => {
                sub_task.state = SubTaskState::Done;
                sub_task.end = Some(Utc::now());
                self.ship_result(handle, &sub_task, &result).await;
                self.finish_sub_task(handle, sub_task.id.clone(), true).await;
            }
            DispatchOutcome::ConnectOrSendFailed => {
                self.handle_connect_failure(handle, destination, sub_task)
                    .await;
            }
            DispatchOutcome::ResultWaitFailed => {
                self.pool.evict(destination);
                sub_task.state = SubTaskState::Queued;
                queue.push_front(sub_task).await;
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    /// Step 6: connect/send failure asks placement for a
    /// single-task replacement, bounded at `placement_retries`
    /// consecutive re-placements.
    async fn handle_connect_failure(
        self: &Arc<Self>,
        handle: &Arc<JobHandle>,
        destination: &NodeId,
        mut sub_task: SubTask,
    ) {
        if sub_task.reassignment_count >= self.config.placement_retries {
            self.handle_connect_failure_exhausted(handle, sub_task).await;
            return;
        }

        let query = PlacementQuery {
            task_name_list: vec![sub_task.id.to_string()],
            adjacency_matrix: vec![vec![false]],
            size_list: vec![sub_task.size_bytes],
        };
        match self.placement.place(query).await {
            Ok(answer) => {
                let Some((_, new_node)) = answer.assignments.into_iter().next() else {
                    self.handle_connect_failure_exhausted(handle, sub_task).await;
                    return;
                };
                let old_node = destination.clone();
                sub_task.node = new_node.clone();
                sub_task.reassignment_count += 1;
                sub_task.state = SubTaskState::Queued;

                handle.emit(ProgressEvent::ReassignInfo {
                    job_id: current_job_id(handle).await,
                    sub_task_id: sub_task.id.to_string(),
                    from: old_node,
                    to: new_node.clone(),
                });
                self.enqueue(handle, new_node, sub_task).await;
            }
            Err(e) => {
                warn!(sub_task = %sub_task.id, error = %e, "re-placement failed");
                self.handle_connect_failure_exhausted(handle, sub_task).await;
            }
        }
    }

    async fn handle_connect_failure_exhausted(self: &Arc<Self>, handle: &Arc<JobHandle>, mut sub_task: SubTask) {
        sub_task.state = SubTaskState::Failed;
        sub_task.last_error = Some("placement unavailable during re-placement".to_string());
        handle.emit(ProgressEvent::TaskInfo {
            job_id: current_job_id(handle).await,
            sub_task_id: Some(sub_task.id.to_string()),
            path: None,
            error: Some("SubTaskFailed".to_string()),
        });
        self.finish_sub_task(handle, sub_task.id.clone(), false).await;
    }

    async fn finish_sub_task(self: &Arc<Self>, handle: &Arc<JobHandle>, id: SubTaskId, success: bool) {
        let job_id = current_job_id(handle).await;
        if success {
            handle.emit(ProgressEvent::TaskInfo {
                job_id,
                sub_task_id: Some(id.to_string()),
                path: None,
                error: None,
            });
        }
        if let Some(path) = handle.record_outcome(id, success).await {
            handle.job.lock().await.state = JobState::Completed;
            handle.emit(ProgressEvent::TaskInfo {
                job_id,
                sub_task_id: None,
                path: Some(path.clone()),
                error: None,
            });
            let _ = self
                .sink
                .send_task_result(&job_id.to_string(), "*", "completed")
                .await;
            info!(job = %job_id, path = %path, "job completed");
        }
    }

    async fn attempt_dispatch(&self, destination: &NodeId, sub_task: &SubTask) -> DispatchOutcome {
        let conn = match self.pool.get_or_connect(destination).await {
            Ok(conn) => conn,
            Err(_) => return DispatchOutcome::ConnectOrSendFailed,
        };
        let mut stream = conn.lock().await;
        let message_id = self.next_message_id();
        let envelope = Envelope::new(
            message_id,
            Message::GetObjectsNew {
                sub_task: SubTaskRef::new(&sub_task.id),
                frames: sub_task.payload.clone(),
            },
        );
        // `reply_hint` is deliberately left unset: the dispatcher keeps
        // this connection open across the destination's admission wait
        // and reads `ans_get_objects` back on it directly, avoiding the
        // coordinator's accept loop needing a special case for
        // unsolicited replies.
        if self.codec.write_message(&mut *stream, &envelope).await.is_err() {
            drop(stream);
            self.pool.evict(destination);
            return DispatchOutcome::ConnectOrSendFailed;
        }

        match self.codec.read_message(&mut *stream, None).await {
            Ok(reply) => match reply.message {
                Message::AnsGetObjects { result, .. } => DispatchOutcome::Success(result),
                _ => DispatchOutcome::ResultWaitFailed,
            },
            Err(_) => DispatchOutcome::ResultWaitFailed,
        }
    }

    async fn ship_result(&self, handle: &Arc<JobHandle>, sub_task: &SubTask, result: &crate::protocol::InferenceResult) {
        let job_id = current_job_id(handle).await;
        let total_images = result.frame_count;
        if total_images == 0 {
            return;
        }
        let chunk_size = result.payload.len() / total_images;
        let mut offset = 0;
        for image_index in 1..=total_images {
            let end = if image_index == total_images {
                result.payload.len()
            } else {
                offset + chunk_size
            };
            let chunk = &result.payload[offset..end];
            offset = end;
            if let Err(e) = self
                .sink
                .send_image(
                    &job_id.to_string(),
                    sub_task.id.as_str(),
                    image_index,
                    total_images,
                    &format!("{}_{}.jpg", sub_task.id, image_index),
                    chunk.len(),
                    chunk,
                )
                .await
            {
                warn!(sub_task = %sub_task.id, error = %e, "archival session failed");
            }
        }
    }

}

async fn current_job_id(handle: &Arc<JobHandle>) -> JobId {
    handle.job.lock().await.id
}

enum DispatchOutcome {
    Success(crate::protocol::InferenceResult),
    ConnectOrSendFailed,
    ResultWaitFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::StubPlacementClient;
    use crate::sink::RecordingSinkClient;
    use dag::StubFrameSplitter;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_echo_agent(runner: Arc<crate::agent::inference::StubInferenceRunner>) -> (NodeId, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(Config::default());
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
        let self_id = NodeId::from(addr);
        let membership = Arc::new(crate::membership::Membership::new(self_id.clone(), pool.clone(), config.clone()));
        let agent = crate::agent::NodeAgent::new(self_id.clone(), config, membership, pool, runner);
        let handle = tokio::spawn(agent.run_accept_loop(listener));
        (self_id, handle)
    }

    #[tokio::test]
    async fn single_group_single_task_job_completes_with_one_archival_session() {
        let (node_id, _server) = spawn_echo_agent(Arc::new(crate::agent::inference::StubInferenceRunner)).await;

        let config = Arc::new({
            let mut c = Config::default();
            c.groups_per_job = 1;
            c.tasks_per_group = 1;
            c
        });
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
        let placement = Arc::new(StubPlacementClient::new(vec![node_id.clone()]));
        let splitter = Arc::new(StubFrameSplitter {
            total_frames: 4,
            frame_size_bytes: 8,
        });
        let sink = Arc::new(RecordingSinkClient::default());
        let (_tx, rx) = watch::channel(false);
        let manager = TaskManager::new(
            NodeId::from_string("coordinator:5002"),
            config,
            pool,
            placement,
            splitter,
            sink.clone(),
            rx,
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let job_id = Uuid::new_v4();
        manager.submit_job(job_id, "video.mp4".to_string(), progress_tx);

        let mut saw_completion_path = None;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(2), progress_rx.recv()).await {
                Ok(Some(ProgressEvent::TaskInfo { path: Some(path), .. })) => {
                    saw_completion_path = Some(path);
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }

        let path = saw_completion_path.expect("job should complete");
        assert!(path.ends_with(&job_id.to_string()));
        assert_eq!(sink.images.lock().len(), 4);
    }
}
