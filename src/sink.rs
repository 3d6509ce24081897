//! Image Sink Client (C8): ships finished frames to the
//! archival endpoint, one fresh TCP connection per image.
//!
//! Protocol per connection: a JSON envelope, a single `0x0A` delimiter
//! byte, then exactly `filesize` raw bytes. `filesize` must equal the
//! bytes actually streamed — any mismatch aborts that image's session and
//! is reported as `ArchivalFailed`. Up to 3 retries with linear back-off
//! on connect/send failure.
//!
//! `SinkClient` is a narrow trait over this wire contract (mirrors
//! [`crate::placement::PlacementClient`]) so task-manager tests can
//! substitute an in-memory recorder for the real archival process.

use crate::error::{FabricError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::warn;

const DELIMITER: u8 = 0x0A;

#[async_trait]
pub trait SinkClient: Send + Sync {
    async fn send_image(
        &self,
        task_id: &str,
        subtask_name: &str,
        image_index: usize,
        total_images: usize,
        filename: &str,
        filesize: usize,
        body: &[u8],
    ) -> Result<()>;

    async fn send_task_result(&self, task_id: &str, subtask_name: &str, result: &str) -> Result<()>;
}

/// Talks to the real archival sink process over its JSON+binary
/// protocol.
pub struct TcpSinkClient {
    addr: SocketAddr,
    retries: u32,
    connect_timeout: Duration,
}

impl TcpSinkClient {
    pub fn new(addr: SocketAddr, retries: u32, connect_timeout: Duration) -> Self {
        Self {
            addr,
            retries,
            connect_timeout,
        }
    }

    async fn with_retries<F, Fut>(&self, mut attempt: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for try_num in 0..=self.retries {
            match attempt().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = try_num, error = %e, "archival send failed");
                    last_err = Some(e);
                    if try_num < self.retries {
                        tokio::time::sleep(Duration::from_secs(1) * (try_num + 1)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FabricError::ArchivalFailed("no attempts made".to_string())))
    }
}

#[async_trait]
impl SinkClient for TcpSinkClient {
    async fn send_image(
        &self,
        task_id: &str,
        subtask_name: &str,
        image_index: usize,
        total_images: usize,
        filename: &str,
        filesize: usize,
        body: &[u8],
    ) -> Result<()> {
        if filesize != body.len() {
            return Err(FabricError::ArchivalFailed(format!(
                "filesize {filesize} does not match streamed body length {}",
                body.len()
            )));
        }
        self.with_retries(|| async {
            let envelope = serde_json::json!({
                "type": "single_image",
                "content": {
                    "task_id": task_id,
                    "subtask_name": subtask_name,
                    "image_index": image_index,
                    "total_images": total_images,
                    "filename": filename,
                    "filesize": filesize,
                }
            });
            let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| FabricError::ArchivalFailed(format!("connect timeout to {}", self.addr)))??;
            let header = serde_json::to_vec(&envelope)?;
            stream.write_all(&header).await?;
            stream.write_all(&[DELIMITER]).await?;
            stream.write_all(body).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    async fn send_task_result(&self, task_id: &str, subtask_name: &str, result: &str) -> Result<()> {
        self.with_retries(|| async {
            let envelope = serde_json::json!({
                "type": "task_result",
                "content": {
                    "task_id": task_id,
                    "subtask_name": subtask_name,
                    "result": result,
                }
            });
            let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| FabricError::ArchivalFailed(format!("connect timeout to {}", self.addr)))??;
            let body = serde_json::to_vec(&envelope)?;
            stream.write_all(&body).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }
}

/// In-memory double used by task-manager tests: records every call
/// instead of opening sockets.
#[derive(Default)]
pub struct RecordingSinkClient {
    pub images: parking_lot::Mutex<Vec<(String, String, usize, usize, usize)>>,
    pub results: parking_lot::Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl SinkClient for RecordingSinkClient {
    async fn send_image(
        &self,
        task_id: &str,
        subtask_name: &str,
        image_index: usize,
        total_images: usize,
        _filename: &str,
        filesize: usize,
        body: &[u8],
    ) -> Result<()> {
        if filesize != body.len() {
            return Err(FabricError::ArchivalFailed(format!(
                "filesize {filesize} does not match streamed body length {}",
                body.len()
            )));
        }
        self.images.lock().push((
            task_id.to_string(),
            subtask_name.to_string(),
            image_index,
            total_images,
            filesize,
        ));
        Ok(())
    }

    async fn send_task_result(&self, task_id: &str, subtask_name: &str, result: &str) -> Result<()> {
        self.results
            .lock()
            .push((task_id.to_string(), subtask_name.to_string(), result.to_string()));
        Ok(())
    }
}
