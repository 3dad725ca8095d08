//! Persistence for exams, attempts, allowances, review policies and reviews.
//!
//! Every method that changes an Attempt, Allowance, ReviewPolicy or Review runs
//! as one atomic unit: the pre-mutation row is copied into its history table by
//! the [`ledger`] and the live row is written in the same unit, or neither
//! happens. There is deliberately no bulk-update entry point for those types.

pub mod ledger;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::allowance::{Allowance, AllowanceHistory, AllowanceKey};
use crate::models::attempt::{Attempt, AttemptChange, AttemptHistory, AttemptStatus, NewAttempt};
use crate::models::exam::{Exam, ExamParams, ExamParamsInput, ExamUpdate, NewExam};
use crate::models::review::{
    NewReview, NewReviewComment, Review, ReviewComment, ReviewCommentHistory, ReviewHistory,
};
use crate::models::review_policy::{ReviewPolicy, ReviewPolicyHistory};
use crate::models::user::{NewUser, User, UserRef};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Result of an allowance write: the row plus whether it was newly created.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowanceWrite {
    pub allowance: Allowance,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredReview {
    pub review: Review,
    pub comments: Vec<ReviewComment>,
    /// Set when an earlier verdict was archived by this write.
    pub superseded: Option<ReviewHistory>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    // Users
    async fn insert_user(&self, user: NewUser) -> Result<User>;
    async fn find_user(&self, user_ref: &UserRef) -> Result<Option<User>>;

    // Exams
    async fn insert_exam(&self, exam: NewExam) -> Result<Exam>;
    async fn update_exam(&self, exam_id: i64, update: ExamUpdate) -> Result<Exam>;
    async fn find_exam(&self, exam_id: i64) -> Result<Option<Exam>>;
    async fn list_course_exams(&self, course_id: &str) -> Result<Vec<Exam>>;
    async fn find_exam_params(&self, exam_id: i64) -> Result<Option<ExamParams>>;
    async fn put_exam_params(&self, exam_id: i64, params: ExamParamsInput) -> Result<ExamParams>;

    // Attempts
    /// Fails with `DuplicateAttempt` when a live row exists for (exam, user).
    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt>;
    async fn find_attempt(&self, attempt_id: i64) -> Result<Option<Attempt>>;
    async fn find_attempt_for(&self, exam_id: i64, user_id: i64) -> Result<Option<Attempt>>;
    async fn find_attempt_by_code(&self, attempt_code: &str) -> Result<Option<Attempt>>;
    /// Archives the current row and applies `change`, provided the row still has
    /// `expected_status`; otherwise fails with `ConcurrentModification`.
    async fn update_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
        change: AttemptChange,
    ) -> Result<Attempt>;
    /// Archives the full row then removes it, provided the row still has
    /// `expected_status`. Returns the archived snapshot.
    async fn delete_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
    ) -> Result<AttemptHistory>;
    /// Most recent first.
    async fn attempt_history_by_code(&self, attempt_code: &str) -> Result<Vec<AttemptHistory>>;
    /// Most recent first.
    async fn attempt_history(&self, attempt_id: i64) -> Result<Vec<AttemptHistory>>;
    async fn list_stale_attempts(
        &self,
        status: AttemptStatus,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<Attempt>>;

    // Allowances
    async fn find_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<Option<Allowance>>;
    async fn list_allowances(&self, exam_id: i64, user_id: i64) -> Result<Vec<Allowance>>;
    async fn list_course_allowances(&self, course_id: &str) -> Result<Vec<Allowance>>;
    /// Inserts or overwrites. `expected_value` is the value the caller read
    /// (`None` = no row); a mismatch fails with `ConcurrentModification`.
    async fn put_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
        value: &str,
        expected_value: Option<&str>,
    ) -> Result<AllowanceWrite>;
    async fn delete_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<AllowanceHistory>;
    /// Most recent first.
    async fn allowance_history(&self, exam_id: i64, user_id: i64) -> Result<Vec<AllowanceHistory>>;

    // Review policies
    async fn find_review_policy(&self, exam_id: i64) -> Result<Option<ReviewPolicy>>;
    async fn put_review_policy(
        &self,
        exam_id: i64,
        set_by_user_id: i64,
        policy_text: &str,
    ) -> Result<ReviewPolicy>;
    async fn delete_review_policy(&self, exam_id: i64) -> Result<ReviewPolicyHistory>;
    /// Most recent first.
    async fn review_policy_history(&self, exam_id: i64) -> Result<Vec<ReviewPolicyHistory>>;

    /// History is permanent.
    async fn delete_review_policy_history(&self, history_id: i64) -> Result<()> {
        Err(Error::OperationNotSupported(format!(
            "review policy history row {} cannot be deleted",
            history_id
        )))
    }

    // Reviews
    async fn find_review(&self, attempt_code: &str) -> Result<Option<Review>>;
    /// Archives any existing review for the code (with its comments) and
    /// replaces it with `review`. When `allow_replace` is false an existing
    /// review fails the call with `ReviewAlreadyExists` and nothing is written.
    async fn put_review(
        &self,
        review: NewReview,
        comments: Vec<NewReviewComment>,
        allow_replace: bool,
    ) -> Result<StoredReview>;
    async fn review_comments(&self, review_id: i64) -> Result<Vec<ReviewComment>>;
    /// Most recent first.
    async fn review_history(&self, attempt_code: &str) -> Result<Vec<ReviewHistory>>;
    async fn review_comment_history(
        &self,
        review_history_id: i64,
    ) -> Result<Vec<ReviewCommentHistory>>;
}
