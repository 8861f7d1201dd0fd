//! Persisted stage completion tracking
//!
//! One document per batch records which workers finished, which failed and
//! whether the batch has been handed to the next stage. The document is the
//! only state shared between processes and is only changed through
//! optimistic transactions.

mod document;
mod tracker;

pub use document::{CompletionChange, HandoffState, StageCompletionDocument};
pub use tracker::{CompletionReceipt, StageCompletionTracker, COMPLETION_NAMESPACE};
