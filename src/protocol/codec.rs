//! Length-prefixed framing and `bincode` (de)serialization of
//! [`super::Envelope`] over any `tokio::io` duplex stream.
//!
//! A concrete 4-byte little-endian length prefix with no header beyond
//! the length, read asynchronously with a caller-supplied deadline.

use crate::error::{FabricError, Result};
use crate::protocol::Envelope;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Reads and writes [`Envelope`]s framed with a 4-byte little-endian
/// length prefix, enforcing a maximum frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Serializes `envelope` and writes it length-prefixed to `writer`.
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        envelope: &Envelope,
    ) -> Result<()> {
        let payload = bincode::encode_to_vec(envelope, bincode::config::standard())?;
        if payload.len() as u64 > self.max_frame_size as u64 {
            return Err(FabricError::OversizedFrame {
                len: payload.len() as u32,
                max: self.max_frame_size,
            });
        }
        let len = payload.len() as u32;
        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one length-prefixed frame from `reader` and decodes it as an
    /// [`Envelope`]. `deadline` bounds the whole read (length prefix +
    /// payload); `None` means the read is unbounded, the default for
    /// request-response sockets.
    pub async fn read_message<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        deadline: Option<Duration>,
    ) -> Result<Envelope> {
        match deadline {
            Some(d) => tokio::time::timeout(d, self.read_message_inner(reader))
                .await
                .map_err(|_| FabricError::ConnectTimeout("read deadline exceeded".to_string()))?,
            None => self.read_message_inner(reader).await,
        }
    }

    async fn read_message_inner<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Envelope> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        read_exact_or_truncated(reader, &mut len_buf, 0).await?;
        let len = u32::from_le_bytes(len_buf);

        if len > self.max_frame_size {
            return Err(FabricError::OversizedFrame {
                len,
                max: self.max_frame_size,
            });
        }

        let mut payload = BytesMut::zeroed(len as usize);
        read_exact_or_truncated(reader, &mut payload, len).await?;

        let (envelope, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
        Ok(envelope)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

/// Reads exactly `buf.len()` bytes, translating an early EOF into
/// `TruncatedFrame` rather than the generic `UnexpectedEof` io error —
/// `expected` is the total frame length being assembled (0 while still
/// reading the length prefix itself).
async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    expected: u32,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FabricError::TruncatedFrame {
                expected: if expected == 0 {
                    LENGTH_PREFIX_BYTES as u32
                } else {
                    expected
                },
                got: 0,
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;
    use crate::protocol::{Message, NodeDescriptor};
    use tokio::io::duplex;

    fn sample_envelope() -> Envelope {
        Envelope::new(
            1,
            Message::AnsNodeInfo(NodeDescriptor::new(
                NodeId::from_string("127.0.0.1:5002"),
                1024,
                10,
                100,
            )),
        )
    }

    #[tokio::test]
    async fn encode_then_decode_is_identity() {
        let codec = FrameCodec::default();
        let (mut client, mut server) = duplex(4096);
        let original = sample_envelope();

        codec.write_message(&mut client, &original).await.unwrap();
        let decoded = codec.read_message(&mut server, None).await.unwrap();

        assert_eq!(decoded.message_id, original.message_id);
        assert_eq!(decoded.message.kind_name(), original.message.kind_name());
    }

    #[tokio::test]
    async fn truncated_connection_is_reported() {
        let codec = FrameCodec::default();
        let (mut client, mut server) = duplex(4096);

        // Write a length prefix promising 100 bytes, then close.
        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        drop(client);

        let err = codec.read_message(&mut server, None).await.unwrap_err();
        assert!(matches!(err, FabricError::TruncatedFrame { .. }));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let codec = FrameCodec::new(8);
        let (mut client, mut server) = duplex(4096);
        let original = sample_envelope();

        let write_result = codec.write_message(&mut client, &original).await;
        assert!(matches!(write_result, Err(FabricError::OversizedFrame { .. })));

        // Simulate a peer that ignores the cap and sends a large length
        // prefix anyway; the reader must still reject it.
        client.write_all(&1000u32.to_le_bytes()).await.unwrap();
        let read_result = codec.read_message(&mut server, None).await;
        assert!(matches!(read_result, Err(FabricError::OversizedFrame { .. })));
    }
}
