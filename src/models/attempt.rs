use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Eligible,
    Created,
    DownloadSoftwareClicked,
    ReadyToStart,
    Started,
    ReadyToSubmit,
    Declined,
    TimedOut,
    Submitted,
    SecondReviewRequired,
    Verified,
    Rejected,
    Error,
    Expired,
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 14] = [
        AttemptStatus::Eligible,
        AttemptStatus::Created,
        AttemptStatus::DownloadSoftwareClicked,
        AttemptStatus::ReadyToStart,
        AttemptStatus::Started,
        AttemptStatus::ReadyToSubmit,
        AttemptStatus::Declined,
        AttemptStatus::TimedOut,
        AttemptStatus::Submitted,
        AttemptStatus::SecondReviewRequired,
        AttemptStatus::Verified,
        AttemptStatus::Rejected,
        AttemptStatus::Error,
        AttemptStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Eligible => "eligible",
            AttemptStatus::Created => "created",
            AttemptStatus::DownloadSoftwareClicked => "download_software_clicked",
            AttemptStatus::ReadyToStart => "ready_to_start",
            AttemptStatus::Started => "started",
            AttemptStatus::ReadyToSubmit => "ready_to_submit",
            AttemptStatus::Declined => "declined",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::SecondReviewRequired => "second_review_required",
            AttemptStatus::Verified => "verified",
            AttemptStatus::Rejected => "rejected",
            AttemptStatus::Error => "error",
            AttemptStatus::Expired => "expired",
        }
    }

    /// Completed statuses: nothing may leave them through `transition`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Declined
                | AttemptStatus::TimedOut
                | AttemptStatus::Submitted
                | AttemptStatus::SecondReviewRequired
                | AttemptStatus::Verified
                | AttemptStatus::Rejected
                | AttemptStatus::Error
                | AttemptStatus::Expired
        )
    }

    /// Statuses that change the learner's credit standing.
    pub fn affects_credit(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Verified
                | AttemptStatus::Rejected
                | AttemptStatus::Declined
                | AttemptStatus::Submitted
                | AttemptStatus::Error
        )
    }

    /// Statuses reached before the learner has actually begun the exam.
    pub fn is_pre_start(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Eligible
                | AttemptStatus::Created
                | AttemptStatus::DownloadSoftwareClicked
                | AttemptStatus::ReadyToStart
        )
    }

    /// Statuses a third-party review may settle or overturn.
    pub fn awaits_review(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Submitted
                | AttemptStatus::SecondReviewRequired
                | AttemptStatus::Verified
                | AttemptStatus::Rejected
        )
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttemptStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "attempt status",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for AttemptStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, UnknownVariant> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Attempt {
    pub id: i64,
    pub user_id: i64,
    pub exam_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_code: String,
    pub external_id: Option<String>,
    pub allowed_time_limit_mins: i32,
    #[sqlx(try_from = "String")]
    pub status: AttemptStatus,
    pub taking_as_proctored: bool,
    pub is_sample_attempt: bool,
    pub student_name: String,
    pub review_policy_id: Option<i64>,
    pub is_status_acknowledged: bool,
    pub provider_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub exam_id: i64,
    pub user_id: i64,
    pub student_name: String,
    pub allowed_time_limit_mins: i32,
    pub attempt_code: String,
    pub taking_as_proctored: bool,
    pub is_sample_attempt: bool,
    pub external_id: Option<String>,
    pub provider_name: Option<String>,
    pub review_policy_id: Option<i64>,
}

/// Single-row change applied by the archival-aware update path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptChange {
    pub status: Option<AttemptStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_status_acknowledged: Option<bool>,
}

impl AttemptChange {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, attempt: &mut Attempt, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            attempt.status = status;
        }
        if let Some(at) = self.started_at {
            attempt.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            attempt.completed_at = Some(at);
        }
        if let Some(ack) = self.is_status_acknowledged {
            attempt.is_status_acknowledged = ack;
        }
        attempt.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    StatusChange,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::StatusChange => "status_change",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl TryFrom<String> for ChangeKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "status_change" => Ok(ChangeKind::StatusChange),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            _ => Err(UnknownVariant {
                kind: "change kind",
                value,
            }),
        }
    }
}

/// Immutable snapshot of an attempt as it was before a change.
/// `attempt_id` is the original key, not a live reference.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct AttemptHistory {
    pub id: i64,
    pub attempt_id: i64,
    pub user_id: i64,
    pub exam_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_code: String,
    pub external_id: Option<String>,
    pub allowed_time_limit_mins: i32,
    #[sqlx(try_from = "String")]
    pub status: AttemptStatus,
    pub taking_as_proctored: bool,
    pub is_sample_attempt: bool,
    pub student_name: String,
    pub review_policy_id: Option<i64>,
    pub is_status_acknowledged: bool,
    pub provider_name: Option<String>,
    #[sqlx(try_from = "String")]
    pub change_kind: ChangeKind,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set_matches_completed_statuses() {
        let terminal: Vec<_> = AttemptStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            terminal,
            vec![
                "declined",
                "timed_out",
                "submitted",
                "second_review_required",
                "verified",
                "rejected",
                "error",
                "expired"
            ]
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for status in AttemptStatus::ALL {
            assert_eq!(status.as_str().parse::<AttemptStatus>().unwrap(), status);
        }
        assert!("finished".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn database_column_decodes_error_status() {
        assert_eq!(
            AttemptStatus::try_from("error".to_string()).unwrap(),
            AttemptStatus::Error
        );
        let err = AttemptStatus::try_from("finished".to_string()).unwrap_err();
        assert_eq!(err.value, "finished");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&AttemptStatus::DownloadSoftwareClicked).unwrap();
        assert_eq!(json, "\"download_software_clicked\"");
    }
}
