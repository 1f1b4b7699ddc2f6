use crate::message::{Response, Status};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("batch split failed: {detail}")]
    Split { detail: String },
    #[error("batch payload is empty")]
    EmptyBatch,
}

impl AdapterError {
    pub fn split(detail: impl Into<String>) -> Self {
        AdapterError::Split {
            detail: detail.into(),
        }
    }
}

/// Inbound data-type seam. Supplies batch splitting and the auto-generated
/// responses used by the auto respond-from modes.
#[async_trait]
pub trait InboundAdapter: Send + Sync {
    /// Splits one inbound payload into an ordered sequence of sub-payloads.
    /// Only invoked when the channel processes batches.
    async fn split(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, AdapterError>;

    /// Produces the canned response for the given source-stage status.
    fn auto_response(&self, status: Status) -> Response;
}

/// Adapter for data types without batch structure: the whole payload is one
/// message and auto responses are plain text acknowledgements.
pub struct PassthroughAdapter;

#[async_trait]
impl InboundAdapter for PassthroughAdapter {
    async fn split(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, AdapterError> {
        if payload.is_empty() {
            return Err(AdapterError::EmptyBatch);
        }
        Ok(vec![payload.to_vec()])
    }

    fn auto_response(&self, status: Status) -> Response {
        let message = match status {
            Status::Received => "Message received.",
            Status::Transformed => "Message transformed.",
            Status::Filtered => "Message filtered.",
            Status::Sent => "Message delivered.",
            Status::Queued => "Message queued for delivery.",
            Status::Error => "Message processing failed.",
        };
        Response::of(status, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_keeps_payload_whole() {
        let adapter = PassthroughAdapter;
        let parts = adapter.split(b"one\ntwo").await.unwrap();
        assert_eq!(parts, vec![b"one\ntwo".to_vec()]);
    }

    #[tokio::test]
    async fn passthrough_rejects_empty_payload() {
        let adapter = PassthroughAdapter;
        assert!(matches!(
            adapter.split(b"").await,
            Err(AdapterError::EmptyBatch)
        ));
    }

    #[test]
    fn auto_response_carries_status() {
        let adapter = PassthroughAdapter;
        let response = adapter.auto_response(Status::Filtered);
        assert_eq!(response.status, Status::Filtered);
        assert_eq!(response.message, "Message filtered.");
    }
}
