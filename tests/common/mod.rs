//! Shared helpers for stagegate integration tests
//!
//! Fixtures build trackers, coordinators and stores; `delivery` produces
//! shuffled at-least-once delivery plans.

#![allow(dead_code)]

pub mod delivery;
pub mod fixtures;

pub use delivery::{deliver_with_redelivery, DeliveryPlan};
pub use fixtures::{batch, contention_policy, memory_coordinator, temp_db, worker, Harness};
