//! Inference is an external collaborator: an opaque request/response
//! over a frame batch. `InferenceRunner` is a narrow trait over that
//! boundary so the node agent can be tested against a deterministic
//! double without a real inference process.

use crate::error::Result;
use crate::protocol::{FrameBatch, InferenceResult};
use async_trait::async_trait;

#[async_trait]
pub trait InferenceRunner: Send + Sync {
    async fn infer(&self, frames: &FrameBatch) -> Result<InferenceResult>;
}

/// Deterministic stand-in used by tests and local demos: "runs" inference
/// by echoing the frame count back as the result payload. A real worker
/// process replaces this at deployment time.
pub struct StubInferenceRunner;

#[async_trait]
impl InferenceRunner for StubInferenceRunner {
    async fn infer(&self, frames: &FrameBatch) -> Result<InferenceResult> {
        Ok(InferenceResult {
            frame_count: frames.frames.len(),
            payload: frames.frames.iter().map(|f| f.len() as u8).collect(),
        })
    }
}
