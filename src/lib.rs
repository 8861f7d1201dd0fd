//! Stagegate: completion tracking and phase transitions for batch pipelines
//!
//! A pipeline stage fans out into many independent workers that each report
//! completion over an at-least-once bus. Stagegate counts distinct
//! completions per batch, fires the transition to the next stage exactly
//! once, detects stages that stall or overrun, and retries work deferred on
//! missing upstream data.
//!
//! # Core Concepts
//!
//! - **Completion documents**: persisted per-batch state, mutated only
//!   through optimistic transactions over a versioned store
//! - **Progress tracking**: live, in-process view of one batch for status
//!   and ETA
//! - **Locks**: TTL-bounded mutual exclusion across processes
//! - **Self-heal**: bounded polling retry of deferred work items
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stagegate::{BatchKey, MemoryStore, RetryPolicy, StageCompletionTracker, SystemClock, WorkerId};
//!
//! let tracker = StageCompletionTracker::new(
//!     Arc::new(MemoryStore::new()),
//!     "predictions",
//!     Arc::new(SystemClock),
//!     RetryPolicy::default(),
//! );
//! let batch = BatchKey::parse("2024-01-15").unwrap();
//! tracker.register_batch(&batch, 1).unwrap();
//! let receipt = tracker.report_completion(&batch, &WorkerId::parse("w-1").unwrap(), 10).unwrap();
//! assert!(receipt.triggered_now);
//! ```

pub mod clock;
pub mod completion;
pub mod config;
pub mod coordinator;
mod error;
pub mod heal;
pub mod keys;
pub mod lock;
pub mod monitor;
pub mod progress;
pub mod storage;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{CompletionReceipt, HandoffState, StageCompletionDocument, StageCompletionTracker};
pub use config::StagegateConfig;
pub use coordinator::{
    BatchContext, ChannelPublisher, CompletionOutcome, Coordinator, CoordinatorSettings, LogPublisher,
    StartRequest, StatusView, TransitionEvent, TransitionPublisher,
};
pub use error::{CoordinationError, CoordinationResult, ExitStatus};
pub use heal::{
    CycleOptions, HealCycleReport, ItemStatus, PartialFailurePolicy, ReadinessCheck, RerunStep,
    RetryableWorkItem, SelfHealAgent,
};
pub use keys::{normalize_key, BatchKey, WorkerId};
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use monitor::{EntityState, MonitorReport, MonitoredEntity, StallMonitor};
pub use progress::{BatchSummary, Progress, ProgressTracker};
pub use storage::{
    MemoryStore, OpenStore, RetryPolicy, SqliteStore, StorageError, StorageResult, VersionedStore,
};
pub use validation::{HandoffChecks, HandoffValidator, Severity, ValidationMode, ValidationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
