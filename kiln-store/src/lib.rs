//! Kiln Store
//!
//! Persistence for the Kiln build executor.
//!
//! Architecture:
//! - Repository traits: what the runner needs from storage (projects, builds,
//!   hooks, jobs), the task queue, and the log hub
//! - PostgreSQL: sqlx-backed implementation used in production
//! - Memory: in-process implementation used by tests and local runs
//!
//! Callers hold an explicit `Arc<dyn Store>` handle; there is no ambient
//! session. Multi-statement writes run in explicit transactions.

pub mod db;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use error::{Result, StoreError};
pub use memory::{MemoryLogHub, MemoryStore};
pub use postgres::{PgLogHub, PgStore};
pub use repository::{
    BuildRepository, HookRepository, JobRepository, LogHub, LogStream, LogSubscription,
    ProjectRepository, Store, TaskQueue,
};
