//! Service layer
//!
//! Services hold the runner's business rules on top of the store and the
//! source host: build numbering, commit status reconciliation and mail
//! notifications.
//!
//! Collaborators are trait objects so tests can swap in fakes.

pub mod build;
pub mod notifier;
pub mod status;

pub use build::{BuildNumberAllocator, BuildService};
pub use notifier::{NoopNotifier, Notification, Notifier, SmtpNotifier};
pub use status::StatusReconciler;
