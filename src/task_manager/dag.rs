//! DAG generation and frame splitting: split a job's media into `G·K`
//! segments, group into `G` groups of `K` sub-tasks, and generate a
//! random per-group DAG (edges i→j for i<j at probability 0.3).
//!
//! The video frame splitter is an external collaborator producing a
//! fixed-count segment list; `FrameSplitter` is a narrow trait over that
//! boundary, mirroring `PlacementClient`/`SinkClient`.

use super::job::Group;
use crate::protocol::FrameBatch;
use async_trait::async_trait;
use rand::Rng;

#[async_trait]
pub trait FrameSplitter: Send + Sync {
    /// Splits `media` into exactly `total_segments` ordered frame
    /// batches. A frame count not evenly divisible by `total_segments`
    /// places the surplus in the last segment without loss.
    async fn split(&self, media: &str, total_segments: usize) -> crate::error::Result<Vec<FrameBatch>>;
}

/// Deterministic stand-in: synthesizes `total_segments` batches from a
/// configurable total frame count, used by tests and local demos in
/// place of the real splitter process.
pub struct StubFrameSplitter {
    pub total_frames: usize,
    pub frame_size_bytes: usize,
}

#[async_trait]
impl FrameSplitter for StubFrameSplitter {
    async fn split(&self, _media: &str, total_segments: usize) -> crate::error::Result<Vec<FrameBatch>> {
        Ok(split_frame_count(self.total_frames, total_segments)
            .into_iter()
            .map(|count| FrameBatch {
                frames: vec![vec![0u8; self.frame_size_bytes]; count],
            })
            .collect())
    }
}

/// Divides `total_frames` into `segments` buckets as evenly as possible,
/// placing any remainder in the last bucket.
fn split_frame_count(total_frames: usize, segments: usize) -> Vec<usize> {
    if segments == 0 {
        return Vec::new();
    }
    let base = total_frames / segments;
    let remainder = total_frames % segments;
    let mut counts = vec![base; segments];
    if let Some(last) = counts.last_mut() {
        *last += remainder;
    }
    counts
}

/// Builds the `groups_per_job` groups for a job from its split segments,
/// generating a random DAG per group.
pub fn build_groups(
    segments: Vec<FrameBatch>,
    groups_per_job: usize,
    tasks_per_group: usize,
    edge_probability: f64,
    rng: &mut impl Rng,
) -> (Vec<Group>, Vec<FrameBatch>) {
    let mut groups = Vec::with_capacity(groups_per_job);
    for group_idx in 0..groups_per_job {
        let task_names = (0..tasks_per_group)
            .map(|task_idx| format!("g{group_idx}_t{task_idx}"))
            .collect();
        groups.push(Group {
            task_names,
            adjacency: random_dag(tasks_per_group, edge_probability, rng),
        });
    }
    (groups, segments)
}

/// Generates a `k x k` adjacency matrix with edges i→j (i<j) each present
/// independently with probability `edge_probability` — always a valid DAG
/// since edges only ever point from a lower index to a higher one.
pub fn random_dag(k: usize, edge_probability: f64, rng: &mut impl Rng) -> Vec<Vec<bool>> {
    let mut adjacency = vec![vec![false; k]; k];
    for i in 0..k {
        for j in (i + 1)..k {
            if rng.random_bool(edge_probability) {
                adjacency[i][j] = true;
            }
        }
    }
    adjacency
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn split_frame_count_puts_remainder_in_last_bucket() {
        let counts = split_frame_count(103, 10);
        assert_eq!(counts.len(), 10);
        assert_eq!(&counts[0..9], &[10; 9]);
        assert_eq!(counts[9], 13);
        assert_eq!(counts.iter().sum::<usize>(), 103);
    }

    #[test]
    fn split_frame_count_handles_exact_multiples() {
        let counts = split_frame_count(100, 10);
        assert_eq!(counts, vec![10; 10]);
    }

    #[test]
    fn random_dag_never_has_lower_triangular_edges() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let adjacency = random_dag(10, 0.3, &mut rng);
        for i in 0..10 {
            for j in 0..10 {
                if adjacency[i][j] {
                    assert!(i < j);
                }
            }
        }
    }

    #[tokio::test]
    async fn stub_splitter_produces_exact_segment_count() {
        let splitter = StubFrameSplitter {
            total_frames: 55,
            frame_size_bytes: 4,
        };
        let segments = splitter.split("video.mp4", 10).await.unwrap();
        assert_eq!(segments.len(), 10);
        let total: usize = segments.iter().map(|s| s.frames.len()).sum();
        assert_eq!(total, 55);
    }
}
