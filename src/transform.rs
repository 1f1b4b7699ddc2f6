use crate::message::Message;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Stage at which a transformer is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageContext {
    Source,
    Destination { ordinal: usize, name: String },
}

impl StageContext {
    pub fn destination(ordinal: usize, name: impl Into<String>) -> Self {
        StageContext::Destination {
            ordinal,
            name: name.into(),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, StageContext::Source)
    }
}

impl fmt::Display for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageContext::Source => f.write_str("source"),
            StageContext::Destination { name, .. } => write!(f, "destination:{name}"),
        }
    }
}

/// Result of a transformer run that did not fail outright.
#[derive(Debug)]
pub enum TransformOutcome {
    Transformed(Message),
    Filtered,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform failed at {stage}: {detail}")]
    Failed { stage: String, detail: String },
    #[error("payload rejected at {stage}: {detail}")]
    InvalidPayload { stage: String, detail: String },
}

impl TransformError {
    pub fn failed(stage: &StageContext, detail: impl Into<String>) -> Self {
        TransformError::Failed {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }

    pub fn invalid_payload(stage: &StageContext, detail: impl Into<String>) -> Self {
        TransformError::InvalidPayload {
            stage: stage.to_string(),
            detail: detail.into(),
        }
    }
}

/// Transformation seam applied once at the source stage and once per
/// destination. Filtering is an elective drop, not a failure.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn apply(
        &self,
        message: Message,
        stage: &StageContext,
    ) -> Result<TransformOutcome, TransformError>;
}

/// Transformer that forwards the message unchanged.
pub struct IdentityTransformer;

#[async_trait]
impl Transformer for IdentityTransformer {
    async fn apply(
        &self,
        message: Message,
        _stage: &StageContext,
    ) -> Result<TransformOutcome, TransformError> {
        Ok(TransformOutcome::Transformed(message))
    }
}

/// Stage run after every destination for a message has settled. May append
/// variable bindings consumed by the postprocessor respond-from mode.
#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn process(&self, message: &mut Message) -> Result<(), TransformError>;
}
