//! Kiln Core
//!
//! Core types and abstractions for the Kiln build executor.
//!
//! This crate contains:
//! - Domain types: Core business entities (Project, Build, Hook, Job, etc.)
//! - DTOs: Records passed between the store, the queue and the runner
//! - Source host port: The interface the runner uses to talk to the code host

pub mod domain;
pub mod dto;
pub mod source;
