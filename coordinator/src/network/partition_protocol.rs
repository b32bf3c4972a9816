// Partition protocol: request-response framing for partition work over libp2p

use futures::prelude::*;
use libp2p::request_response::{self, Behaviour, Config, ProtocolSupport};
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

use super::transport::{PartitionRequest, PartitionResponse};

/// Protocol ID for partition dispatch
pub const PARTITION_PROTOCOL_ID: StreamProtocol = StreamProtocol::new("/mesh/partition/1.0.0");

/// Largest frame accepted on the wire (10MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Wire envelope for a partition request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionEnvelope {
    pub request: PartitionRequest,
    /// Deadline the sender will wait, in milliseconds
    pub timeout_ms: u64,
    /// Unix timestamp (ms) when the envelope was created
    pub created_at: i64,
}

impl PartitionEnvelope {
    pub fn new(request: PartitionRequest, timeout: Duration) -> Self {
        Self {
            request,
            timeout_ms: timeout.as_millis() as u64,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Wire reply: either a response or the remote error text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionReply {
    pub request_id: String,
    pub response: Option<PartitionResponse>,
    pub error: Option<String>,
}

impl PartitionReply {
    pub fn success(request_id: impl Into<String>, response: PartitionResponse) -> Self {
        Self {
            request_id: request_id.into(),
            response: Some(response),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            response: None,
            error: Some(error.into()),
        }
    }

    /// Convert into the transport result seen by the coordinator
    pub fn into_result(self) -> crate::errors::Result<PartitionResponse> {
        match (self.response, self.error) {
            (Some(response), None) => Ok(response),
            (_, Some(error)) => Err(crate::errors::CoordinatorError::Transport(error)),
            (None, None) => Err(crate::errors::CoordinatorError::Transport(format!(
                "empty reply for {}",
                self.request_id
            ))),
        }
    }
}

/// CBOR codec for partition protocol messages
#[derive(Debug, Clone, Default)]
pub struct PartitionCodec;

#[async_trait::async_trait]
impl request_response::Codec for PartitionCodec {
    type Protocol = StreamProtocol;
    type Request = PartitionEnvelope;
    type Response = PartitionReply;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_cbor_frame(io).await
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_cbor_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_cbor_frame(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_cbor_frame(io, &res).await
    }
}

/// Read a u32 big-endian length prefix followed by a CBOR body
async fn read_cbor_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_MESSAGE_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_cbor_frame<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {})", buf.len(), MAX_MESSAGE_SIZE),
        ));
    }

    io.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}

/// Configuration for the partition protocol behaviour
#[derive(Debug, Clone)]
pub struct PartitionProtocolConfig {
    pub request_timeout: Duration,
}

impl Default for PartitionProtocolConfig {
    fn default() -> Self {
        Self {
            // matches the default inference timeout
            request_timeout: Duration::from_secs(300),
        }
    }
}

pub type PartitionProtocol = Behaviour<PartitionCodec>;

/// Create the request-response behaviour for partition dispatch
pub fn new_partition_protocol(config: PartitionProtocolConfig) -> PartitionProtocol {
    let protocols = std::iter::once((PARTITION_PROTOCOL_ID, ProtocolSupport::Full));
    let cfg = Config::default().with_request_timeout(config.request_timeout);
    Behaviour::new(protocols, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{InferenceParams, LayerRange};
    use futures::io::Cursor;
    use std::collections::BTreeMap;

    fn envelope() -> PartitionEnvelope {
        let mut parameters = InferenceParams::new();
        parameters.insert("temperature".to_string(), serde_json::json!(0.7));
        let mut metadata = BTreeMap::new();
        metadata.insert("inference_id".to_string(), "inf_42".to_string());

        PartitionEnvelope::new(
            PartitionRequest {
                request_id: "inf_42_partition_0".to_string(),
                model: "llama".to_string(),
                prompt: "hello world".to_string(),
                parameters,
                partition_id: "partition_0".to_string(),
                layer_range: Some(LayerRange::new(0, 15)),
                token_range: None,
                metadata,
            },
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_protocol_id() {
        assert_eq!(PARTITION_PROTOCOL_ID.as_ref(), "/mesh/partition/1.0.0");
    }

    #[tokio::test]
    async fn test_frame_carries_envelope() {
        let original = envelope();

        let mut write_buf = Vec::new();
        write_cbor_frame(&mut write_buf, &original).await.unwrap();
        let declared = u32::from_be_bytes([write_buf[0], write_buf[1], write_buf[2], write_buf[3]]);
        assert_eq!(declared as usize, write_buf.len() - 4);

        let mut read_buf = Cursor::new(write_buf);
        let decoded: PartitionEnvelope = read_cbor_frame(&mut read_buf).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        let mut read_buf = Cursor::new(buf);
        let result: io::Result<PartitionReply> = read_cbor_frame(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_reply_into_result() {
        let ok = PartitionReply::success("r", PartitionResponse::default());
        assert!(ok.into_result().is_ok());

        let err = PartitionReply::failure("r", "out of memory")
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("out of memory"));
    }
}
