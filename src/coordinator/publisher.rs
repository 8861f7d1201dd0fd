//! Downstream transition events and their publishers

use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::BatchKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use uuid::Uuid;

/// Published once per batch when its stage is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub batch_key: BatchKey,
    pub stage: String,
    pub reason: String,
    pub correlation_id: Uuid,
    pub emitted_at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(batch_key: BatchKey, stage: &str, reason: impl Into<String>, emitted_at: DateTime<Utc>) -> Self {
        Self {
            batch_key,
            stage: stage.to_string(),
            reason: reason.into(),
            correlation_id: Uuid::new_v4(),
            emitted_at,
        }
    }
}

/// Outbound side of a stage transition.
pub trait TransitionPublisher: Send + Sync {
    fn publish(&self, event: &TransitionEvent) -> CoordinationResult<()>;
}

/// Hands events to an in-process consumer, for phases running in one
/// service.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<TransitionEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::Receiver<TransitionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl TransitionPublisher for ChannelPublisher {
    fn publish(&self, event: &TransitionEvent) -> CoordinationResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| CoordinationError::Upstream("transition receiver dropped".to_string()))
    }
}

/// Writes events to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl TransitionPublisher for LogPublisher {
    fn publish(&self, event: &TransitionEvent) -> CoordinationResult<()> {
        tracing::info!(
            batch_key = %event.batch_key,
            stage = %event.stage,
            correlation_id = %event.correlation_id,
            reason = %event.reason,
            "stage transition"
        );
        Ok(())
    }
}
