//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dto::log::channel_name;

/// One execution attempt of a build
///
/// A job goes from running to finished exactly once. Restarting creates a
/// new job for the same hook call; the newest one is the "latest" job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub build_id: i64,
    pub hook_call_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    /// Cache fingerprint the job ran with
    pub cache_id: Option<String>,
    /// Correlation id of the queue task that produced this job
    pub task_id: Uuid,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Pub/sub channel live output of this job is published to
    pub fn log_channel(&self) -> String {
        channel_name(self.build_id, self.hook_call_id)
    }
}

/// Terminal result of executing a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl JobOutcome {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    /// Outcome for a job that could not run its script
    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(1, message)
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_outcome() {
        assert!(JobOutcome::new(0, "ok").succeeded());
        assert!(!JobOutcome::new(137, "").succeeded());

        let fault = JobOutcome::fault("image pull failed");
        assert_eq!(fault.exit_code, 1);
        assert_eq!(fault.output, "image pull failed");
    }

    #[test]
    fn test_log_channel() {
        let job = Job {
            id: 10,
            build_id: 4,
            hook_call_id: 9,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            output: None,
            cache_id: None,
            task_id: Uuid::new_v4(),
        };
        assert_eq!(job.log_channel(), "kiln:build:4:hook-call:9");
        assert!(!job.is_finished());
    }
}
