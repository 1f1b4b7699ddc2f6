use crate::message::Message;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The remote party refused the message outright; retrying will not help.
    #[error("send rejected: {detail}")]
    Rejected { detail: String },
    /// Transient send failure; the destination's retry policy decides whether
    /// to re-attempt.
    #[error("send failed: {detail}")]
    Failed { detail: String },
    #[error("send timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

impl DispatchError {
    pub fn rejected(detail: impl Into<String>) -> Self {
        DispatchError::Rejected {
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        DispatchError::Failed {
            detail: detail.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        DispatchError::Timeout { timeout }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Failed { .. } | DispatchError::Timeout { .. }
        )
    }
}

/// Protocol-specific send seam for one destination. The engine applies the
/// destination's send timeout around the call and treats the body as opaque;
/// a successful send yields the remote acknowledgement content.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn send(&self, message: &Message) -> Result<String, DispatchError>;
}
