//! Core domain types
//!
//! This module contains the core domain structures used across Kiln crates.
//! These types represent the fundamental business entities and are shared between
//! the store (for persistence) and the runner (for execution).

pub mod build;
pub mod hook;
pub mod job;
pub mod project;
pub mod status;
