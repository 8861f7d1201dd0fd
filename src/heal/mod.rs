//! Self-heal retry of work deferred on incomplete upstream data
//!
//! Items are polled until a readiness check passes (the downstream steps
//! are then re-run once) or until they run out of checks and fail.

mod agent;
mod command;
mod item;

pub use agent::{
    CycleOptions, HealAction, HealCycleReport, HealSettings, ItemResult, PartialFailurePolicy,
    ReadinessCheck, RerunStep, SelfHealAgent, HEAL_NAMESPACE,
};
pub use command::{ShellCommand, DEFAULT_COMMAND_TIMEOUT};
pub use item::{ItemStatus, RetryableWorkItem};
