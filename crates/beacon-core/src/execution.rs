// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution attempts and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a per-region execution attempt.
///
/// `Completed` and `Failed` are terminal: an attempt never transitions back
/// out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Recorded but not yet picked up.
    Pending,
    /// Actively executing on an acquired provider.
    Running,
    /// Finished with output.
    Completed,
    /// Exhausted its providers, timed out, or was cancelled.
    Failed,
    /// A content-refusal retry intent has been accepted.
    Retrying,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether `next` is a legal transition from this status.
    ///
    /// Terminal states accept no transitions; `Retrying` may only be entered
    /// from `Failed`... except that `Failed` is terminal, so the retry path
    /// goes through [`ExecutionAttempt::mark_retrying`], which is the single
    /// sanctioned exception for content refusals.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        if self == next {
            return false;
        }
        match self {
            ExecutionStatus::Pending => matches!(
                next,
                ExecutionStatus::Running | ExecutionStatus::Failed | ExecutionStatus::Completed
            ),
            ExecutionStatus::Running => {
                matches!(next, ExecutionStatus::Completed | ExecutionStatus::Failed)
            }
            ExecutionStatus::Retrying => matches!(
                next,
                ExecutionStatus::Running | ExecutionStatus::Completed | ExecutionStatus::Failed
            ),
            ExecutionStatus::Completed | ExecutionStatus::Failed => false,
        }
    }
}

/// One retry of a content-refused question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryRecord {
    /// Index of the retried question within the job's question set.
    pub question_index: usize,
    /// When the retry intent was accepted.
    pub at: DateTime<Utc>,
    /// Outcome summary, filled in when the retry resolves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// A single per-region execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionAttempt {
    /// Attempt identifier.
    pub id: String,

    /// Owning job.
    pub job_id: String,

    /// Target region bucket (`US`, `EU`, `ASIA`).
    pub region: String,

    /// Provider the attempt ran on, once acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Current lifecycle state.
    pub status: ExecutionStatus,

    /// When the attempt was created.
    pub started_at: DateTime<Utc>,

    /// When the attempt reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Raw output payload from the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,

    /// Serialized receipt, persisted after building.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_data: Option<serde_json::Value>,

    /// Content-refusal retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Retries permitted for this attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timestamp of the most recent retry intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,

    /// Per-question retry history.
    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,

    /// Whether the failure was a provider content refusal rather than an
    /// infrastructure fault.
    #[serde(default)]
    pub is_content_refusal: bool,
}

fn default_max_retries() -> u32 {
    3
}

/// Error returned when a status update would violate the state machine.
#[derive(Debug, thiserror::Error)]
#[error("illegal transition {from:?} -> {to:?} for attempt {id}")]
pub struct TransitionError {
    /// Attempt id.
    pub id: String,
    /// Current status.
    pub from: ExecutionStatus,
    /// Requested status.
    pub to: ExecutionStatus,
}

impl ExecutionAttempt {
    /// Create a fresh pending attempt.
    pub fn new(id: impl Into<String>, job_id: impl Into<String>, region: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            region: region.into(),
            provider_id: None,
            status: ExecutionStatus::Pending,
            started_at: now,
            completed_at: None,
            output_data: None,
            receipt_data: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            last_retry_at: None,
            retry_history: Vec::new(),
            is_content_refusal: false,
        }
    }

    /// Apply a status transition, enforcing terminal-state immutability.
    pub fn transition(&mut self, to: ExecutionStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Enter `Retrying` for a content-refused question.
    ///
    /// The only path out of `Failed`, and only when the failure was a
    /// content refusal with retry budget remaining.
    pub fn mark_retrying(
        &mut self,
        question_index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let eligible = self.status == ExecutionStatus::Failed
            && self.is_content_refusal
            && self.retry_count < self.max_retries;
        if !eligible {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to: ExecutionStatus::Retrying,
            });
        }
        self.status = ExecutionStatus::Retrying;
        self.completed_at = None;
        self.retry_count += 1;
        self.last_retry_at = Some(now);
        self.retry_history.push(RetryRecord {
            question_index,
            at: now,
            outcome: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn happy_path_transitions() {
        let mut a = ExecutionAttempt::new("e1", "j1", "US", now());
        a.transition(ExecutionStatus::Running, now()).unwrap();
        a.transition(ExecutionStatus::Completed, now()).unwrap();
        assert!(a.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut a = ExecutionAttempt::new("e1", "j1", "US", now());
        a.transition(ExecutionStatus::Running, now()).unwrap();
        a.transition(ExecutionStatus::Completed, now()).unwrap();
        assert!(a.transition(ExecutionStatus::Running, now()).is_err());
        assert!(a.transition(ExecutionStatus::Failed, now()).is_err());
    }

    #[test]
    fn retry_requires_content_refusal() {
        let mut a = ExecutionAttempt::new("e1", "j1", "US", now());
        a.transition(ExecutionStatus::Running, now()).unwrap();
        a.transition(ExecutionStatus::Failed, now()).unwrap();
        assert!(a.mark_retrying(0, now()).is_err());

        a.is_content_refusal = true;
        a.mark_retrying(0, now()).unwrap();
        assert_eq!(a.status, ExecutionStatus::Retrying);
        assert_eq!(a.retry_count, 1);
        assert_eq!(a.retry_history.len(), 1);
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut a = ExecutionAttempt::new("e1", "j1", "US", now());
        a.is_content_refusal = true;
        a.max_retries = 1;
        a.status = ExecutionStatus::Failed;
        a.mark_retrying(0, now()).unwrap();
        // Fail again, budget now exhausted.
        a.transition(ExecutionStatus::Failed, now()).unwrap();
        assert!(a.mark_retrying(1, now()).is_err());
    }

    #[test]
    fn no_self_transitions() {
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Running));
    }
}
