use chrono::{DateTime, Utc};
use std::fmt;

/// One effort to label a single file on behalf of its owner.
///
/// At most one of the terminal markers (`applied`, `error_forbidden`,
/// `error_no_identity`) is ever set. `attempts` starts at 1 and only grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentAttempt {
    pub id: Option<i64>,
    pub file_id: String,
    pub file_owner: String,
    pub classification: String,
    pub policy_id: String,
    /// File name reported by the target platform, known once it was fetched.
    pub file_name: Option<String>,
    pub applied: bool,
    pub attempts: u32,
    pub error_forbidden: Option<bool>,
    pub error_no_identity: Option<bool>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssignmentAttempt {
    /// Fresh, unpersisted record for a newly observed trigger.
    pub fn pending(
        file_id: impl Into<String>,
        file_owner: impl Into<String>,
        classification: impl Into<String>,
        policy_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            file_id: file_id.into(),
            file_owner: file_owner.into(),
            classification: classification.into(),
            policy_id: policy_id.into(),
            file_name: None,
            applied: false,
            attempts: 1,
            error_forbidden: None,
            error_no_identity: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.error_forbidden.unwrap_or(false)
    }

    pub fn is_no_identity(&self) -> bool {
        self.error_no_identity.unwrap_or(false)
    }

    pub fn is_terminal(&self) -> bool {
        self.applied || self.is_forbidden() || self.is_no_identity()
    }

    pub fn mark_applied(&mut self) {
        debug_assert!(!self.is_forbidden() && !self.is_no_identity());
        self.applied = true;
        self.error_message = None;
    }

    /// Sets only the forbidden marker; the denial itself is logged by the caller.
    pub fn mark_forbidden(&mut self) {
        debug_assert!(!self.applied && !self.is_no_identity());
        self.error_forbidden = Some(true);
    }

    pub fn mark_no_identity(&mut self) {
        debug_assert!(!self.applied && !self.is_forbidden());
        self.error_no_identity = Some(true);
    }

    /// Records a retryable failure.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    /// Counts the next delivery attempt of a previously persisted record.
    pub fn begin_retry(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        !self.applied
            && !self.is_forbidden()
            && !self.is_no_identity()
            && self.attempts < max_attempts
    }

    pub fn status(&self) -> &'static str {
        if self.applied {
            "applied"
        } else if self.is_forbidden() {
            "forbidden"
        } else if self.is_no_identity() {
            "no_identity"
        } else if self.error_message.is_some() {
            "failed"
        } else {
            "pending"
        }
    }
}

impl fmt::Display for AssignmentAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "attempt #{id}")?,
            None => write!(f, "attempt (unsaved)")?,
        }
        write!(
            f,
            " file={} owner={} label={} policy={} status={} attempts={}",
            self.file_id,
            self.file_owner,
            self.classification,
            self.policy_id,
            self.status(),
            self.attempts
        )
    }
}
