//! Data Transfer Objects
//!
//! Records passed between the store, the task queue and the runner.
//! Insert requests are lightweight versions of domain entities without
//! store-assigned fields.

pub mod build;
pub mod hook;
pub mod job;
pub mod log;
pub mod payload;
pub mod task;
