//! Scheduler layer for the worker
//!
//! This layer polls the task queue and hands claimed tasks to the
//! dispatcher, bounding how many jobs run at once.

pub mod poller;

pub use poller::TaskPoller;
