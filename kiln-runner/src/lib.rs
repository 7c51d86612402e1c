//! Kiln Runner
//!
//! The worker side of Kiln: executes commit-triggered builds in podman
//! containers and reports their outcome.
//!
//! Architecture:
//! - Configuration: Load settings from the environment
//! - Execution: throwaway deploy keys, the builder and the log tailer
//! - Cache keys: fingerprints of prepared build environments
//! - Services: build numbering, commit status reconciliation, mail
//! - Dispatcher: turns one queued task into one finished job
//! - Scheduler: polls the task queue and bounds parallelism

pub mod ansi;
pub mod builder;
pub mod cache_key;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod keypair;
pub mod podman;
pub mod scheduler;
pub mod service;
pub mod tailer;

#[cfg(test)]
mod testing;
