//! In-process store. A single mutex guards every table, so each method body is
//! one atomic unit, mirroring a database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{ledger, AllowanceWrite, EntityStore, StoredReview};
use crate::error::{Error, Result};
use crate::models::allowance::{Allowance, AllowanceHistory, AllowanceKey};
use crate::models::attempt::{
    Attempt, AttemptChange, AttemptHistory, AttemptStatus, ChangeKind, NewAttempt,
};
use crate::models::exam::{Exam, ExamParams, ExamParamsInput, ExamUpdate, NewExam};
use crate::models::review::{
    NewReview, NewReviewComment, Review, ReviewComment, ReviewCommentHistory, ReviewHistory,
};
use crate::models::review_policy::{ReviewPolicy, ReviewPolicyHistory};
use crate::models::user::{NewUser, User, UserRef};

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, User>,
    exams: BTreeMap<i64, Exam>,
    exam_params: HashMap<i64, ExamParams>,
    attempts: BTreeMap<i64, Attempt>,
    attempt_history: Vec<AttemptHistory>,
    allowances: BTreeMap<i64, Allowance>,
    allowance_history: Vec<AllowanceHistory>,
    review_policies: BTreeMap<i64, ReviewPolicy>,
    review_policy_history: Vec<ReviewPolicyHistory>,
    reviews: BTreeMap<i64, Review>,
    review_comments: Vec<ReviewComment>,
    review_history: Vec<ReviewHistory>,
    review_comment_history: Vec<ReviewCommentHistory>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn allowance_id(&self, exam_id: i64, user_id: i64, key: AllowanceKey) -> Option<i64> {
        self.allowances
            .values()
            .find(|a| a.exam_id == exam_id && a.user_id == user_id && a.key == key)
            .map(|a| a.id)
    }

    fn review_policy_id(&self, exam_id: i64) -> Option<i64> {
        self.review_policies
            .values()
            .filter(|p| p.exam_id == exam_id)
            .map(|p| p.id)
            .max()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut t = self.tables.lock().await;
        if t
            .users
            .values()
            .any(|u| u.username == user.username || u.email == user.email)
        {
            return Err(Error::Conflict(format!("user '{}' already exists", user.username)));
        }
        let row = User {
            id: t.next_id(),
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            created_at: Utc::now(),
        };
        t.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_user(&self, user_ref: &UserRef) -> Result<Option<User>> {
        let t = self.tables.lock().await;
        let found = t.users.values().find(|u| match user_ref {
            UserRef::Id(id) => u.id == *id,
            UserRef::Email(email) => u.email.eq_ignore_ascii_case(email),
            UserRef::Username(name) => &u.username == name,
        });
        Ok(found.cloned())
    }

    async fn insert_exam(&self, exam: NewExam) -> Result<Exam> {
        let mut t = self.tables.lock().await;
        if t
            .exams
            .values()
            .any(|e| e.course_id == exam.course_id && e.content_id == exam.content_id)
        {
            return Err(Error::Conflict(format!(
                "exam for content '{}' already exists in course '{}'",
                exam.content_id, exam.course_id
            )));
        }
        let now = Utc::now();
        let row = Exam {
            id: t.next_id(),
            course_id: exam.course_id,
            content_id: exam.content_id,
            external_id: exam.external_id,
            exam_name: exam.exam_name,
            time_limit_mins: exam.time_limit_mins,
            due_date: exam.due_date,
            is_proctored: exam.is_proctored,
            is_practice_exam: exam.is_practice_exam,
            is_active: exam.is_active,
            hide_after_due: exam.hide_after_due,
            created_at: now,
            updated_at: now,
        };
        t.exams.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_exam(&self, exam_id: i64, update: ExamUpdate) -> Result<Exam> {
        let mut t = self.tables.lock().await;
        let exam = t.exams.get_mut(&exam_id).ok_or(Error::ExamNotFound(exam_id))?;
        update.apply(exam);
        exam.updated_at = Utc::now();
        Ok(exam.clone())
    }

    async fn find_exam(&self, exam_id: i64) -> Result<Option<Exam>> {
        Ok(self.tables.lock().await.exams.get(&exam_id).cloned())
    }

    async fn list_course_exams(&self, course_id: &str) -> Result<Vec<Exam>> {
        let t = self.tables.lock().await;
        Ok(t.exams
            .values()
            .filter(|e| e.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn find_exam_params(&self, exam_id: i64) -> Result<Option<ExamParams>> {
        Ok(self.tables.lock().await.exam_params.get(&exam_id).cloned())
    }

    async fn put_exam_params(&self, exam_id: i64, params: ExamParamsInput) -> Result<ExamParams> {
        let mut t = self.tables.lock().await;
        if !t.exams.contains_key(&exam_id) {
            return Err(Error::ExamNotFound(exam_id));
        }
        let row = ExamParams {
            exam_id,
            service: params.service,
            deadline: params.deadline,
            start: params.start,
            visible_to_staff_only: params.visible_to_staff_only,
            review_checkbox_config: params
                .review_checkbox_config
                .unwrap_or_else(|| serde_json::json!({})),
            updated_at: Utc::now(),
        };
        t.exam_params.insert(exam_id, row.clone());
        Ok(row)
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt> {
        let mut t = self.tables.lock().await;
        if t
            .attempts
            .values()
            .any(|a| a.exam_id == attempt.exam_id && a.user_id == attempt.user_id)
        {
            return Err(Error::DuplicateAttempt {
                exam_id: attempt.exam_id,
                user_id: attempt.user_id,
            });
        }
        if t
            .attempts
            .values()
            .any(|a| a.attempt_code == attempt.attempt_code)
        {
            return Err(Error::Conflict("attempt code already in use".to_string()));
        }
        let now = Utc::now();
        let row = Attempt {
            id: t.next_id(),
            user_id: attempt.user_id,
            exam_id: attempt.exam_id,
            started_at: None,
            completed_at: None,
            attempt_code: attempt.attempt_code,
            external_id: attempt.external_id,
            allowed_time_limit_mins: attempt.allowed_time_limit_mins,
            status: AttemptStatus::Created,
            taking_as_proctored: attempt.taking_as_proctored,
            is_sample_attempt: attempt.is_sample_attempt,
            student_name: attempt.student_name,
            review_policy_id: attempt.review_policy_id,
            is_status_acknowledged: false,
            provider_name: attempt.provider_name,
            created_at: now,
            updated_at: now,
        };
        t.attempts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_attempt(&self, attempt_id: i64) -> Result<Option<Attempt>> {
        Ok(self.tables.lock().await.attempts.get(&attempt_id).cloned())
    }

    async fn find_attempt_for(&self, exam_id: i64, user_id: i64) -> Result<Option<Attempt>> {
        let t = self.tables.lock().await;
        Ok(t.attempts
            .values()
            .find(|a| a.exam_id == exam_id && a.user_id == user_id)
            .cloned())
    }

    async fn find_attempt_by_code(&self, attempt_code: &str) -> Result<Option<Attempt>> {
        let t = self.tables.lock().await;
        Ok(t.attempts
            .values()
            .find(|a| a.attempt_code == attempt_code)
            .cloned())
    }

    async fn update_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
        change: AttemptChange,
    ) -> Result<Attempt> {
        let mut t = self.tables.lock().await;
        let before = t
            .attempts
            .get(&attempt_id)
            .cloned()
            .ok_or_else(|| Error::AttemptNotFound(format!("attempt {}", attempt_id)))?;
        if before.status != expected_status {
            return Err(Error::ConcurrentModification(format!(
                "attempt {} is '{}', expected '{}'",
                attempt_id, before.status, expected_status
            )));
        }

        let now = Utc::now();
        let history_id = t.next_id();
        let snapshot =
            ledger::attempt_snapshot(history_id, &before, ledger::change_kind(&before, &change), now);
        let mut after = before;
        change.apply(&mut after, now);

        t.attempt_history.push(snapshot);
        t.attempts.insert(attempt_id, after.clone());
        Ok(after)
    }

    async fn delete_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
    ) -> Result<AttemptHistory> {
        let mut t = self.tables.lock().await;
        let before = t
            .attempts
            .get(&attempt_id)
            .cloned()
            .ok_or_else(|| Error::AttemptNotFound(format!("attempt {}", attempt_id)))?;
        if before.status != expected_status {
            return Err(Error::ConcurrentModification(format!(
                "attempt {} is '{}', expected '{}'",
                attempt_id, before.status, expected_status
            )));
        }
        let history_id = t.next_id();
        let snapshot = ledger::attempt_snapshot(history_id, &before, ChangeKind::Delete, Utc::now());
        t.attempt_history.push(snapshot.clone());
        t.attempts.remove(&attempt_id);
        Ok(snapshot)
    }

    async fn attempt_history_by_code(&self, attempt_code: &str) -> Result<Vec<AttemptHistory>> {
        let t = self.tables.lock().await;
        Ok(t.attempt_history
            .iter()
            .rev()
            .filter(|h| h.attempt_code == attempt_code)
            .cloned()
            .collect())
    }

    async fn attempt_history(&self, attempt_id: i64) -> Result<Vec<AttemptHistory>> {
        let t = self.tables.lock().await;
        Ok(t.attempt_history
            .iter()
            .rev()
            .filter(|h| h.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn list_stale_attempts(
        &self,
        status: AttemptStatus,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<Attempt>> {
        let t = self.tables.lock().await;
        Ok(t.attempts
            .values()
            .filter(|a| a.status == status && a.updated_at < modified_before)
            .cloned()
            .collect())
    }

    async fn find_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<Option<Allowance>> {
        let t = self.tables.lock().await;
        Ok(t.allowance_id(exam_id, user_id, key)
            .and_then(|id| t.allowances.get(&id).cloned()))
    }

    async fn list_allowances(&self, exam_id: i64, user_id: i64) -> Result<Vec<Allowance>> {
        let t = self.tables.lock().await;
        Ok(t.allowances
            .values()
            .filter(|a| a.exam_id == exam_id && a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_course_allowances(&self, course_id: &str) -> Result<Vec<Allowance>> {
        let t = self.tables.lock().await;
        Ok(t.allowances
            .values()
            .filter(|a| {
                t.exams
                    .get(&a.exam_id)
                    .map(|e| e.course_id == course_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn put_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
        value: &str,
        expected_value: Option<&str>,
    ) -> Result<AllowanceWrite> {
        let mut t = self.tables.lock().await;
        let existing = t
            .allowance_id(exam_id, user_id, key)
            .and_then(|id| t.allowances.get(&id).cloned());
        if existing.as_ref().map(|a| a.value.as_str()) != expected_value {
            return Err(Error::ConcurrentModification(format!(
                "allowance '{}' for user {} on exam {} changed concurrently",
                key, user_id, exam_id
            )));
        }

        let now = Utc::now();
        match existing {
            Some(before) => {
                let history_id = t.next_id();
                let snapshot = ledger::allowance_snapshot(history_id, &before, now);
                let mut after = before;
                after.value = value.to_string();
                after.updated_at = now;
                t.allowance_history.push(snapshot);
                t.allowances.insert(after.id, after.clone());
                Ok(AllowanceWrite {
                    allowance: after,
                    created: false,
                })
            }
            None => {
                let row = Allowance {
                    id: t.next_id(),
                    user_id,
                    exam_id,
                    key,
                    value: value.to_string(),
                    created_at: now,
                    updated_at: now,
                };
                t.allowances.insert(row.id, row.clone());
                Ok(AllowanceWrite {
                    allowance: row,
                    created: true,
                })
            }
        }
    }

    async fn delete_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<AllowanceHistory> {
        let mut t = self.tables.lock().await;
        let id = t
            .allowance_id(exam_id, user_id, key)
            .ok_or_else(|| Error::NotFound(format!("allowance '{}' not found", key)))?;
        let before = t
            .allowances
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("allowance '{}' not found", key)))?;
        let history_id = t.next_id();
        let snapshot = ledger::allowance_snapshot(history_id, &before, Utc::now());
        t.allowance_history.push(snapshot.clone());
        t.allowances.remove(&id);
        Ok(snapshot)
    }

    async fn allowance_history(&self, exam_id: i64, user_id: i64) -> Result<Vec<AllowanceHistory>> {
        let t = self.tables.lock().await;
        Ok(t.allowance_history
            .iter()
            .rev()
            .filter(|h| h.exam_id == exam_id && h.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_review_policy(&self, exam_id: i64) -> Result<Option<ReviewPolicy>> {
        let t = self.tables.lock().await;
        Ok(t.review_policy_id(exam_id)
            .and_then(|id| t.review_policies.get(&id).cloned()))
    }

    async fn put_review_policy(
        &self,
        exam_id: i64,
        set_by_user_id: i64,
        policy_text: &str,
    ) -> Result<ReviewPolicy> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let existing = t
            .review_policy_id(exam_id)
            .and_then(|id| t.review_policies.get(&id).cloned());
        let row = match existing {
            Some(before) => {
                let history_id = t.next_id();
                let snapshot = ledger::review_policy_snapshot(history_id, &before, now);
                let mut after = before;
                after.set_by_user_id = set_by_user_id;
                after.policy_text = policy_text.to_string();
                after.updated_at = now;
                t.review_policy_history.push(snapshot);
                after
            }
            None => ReviewPolicy {
                id: t.next_id(),
                exam_id,
                set_by_user_id,
                policy_text: policy_text.to_string(),
                created_at: now,
                updated_at: now,
            },
        };
        t.review_policies.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete_review_policy(&self, exam_id: i64) -> Result<ReviewPolicyHistory> {
        let mut t = self.tables.lock().await;
        let before = t
            .review_policy_id(exam_id)
            .and_then(|id| t.review_policies.get(&id).cloned())
            .ok_or_else(|| Error::NotFound(format!("no review policy for exam {}", exam_id)))?;
        let history_id = t.next_id();
        let snapshot = ledger::review_policy_snapshot(history_id, &before, Utc::now());
        t.review_policy_history.push(snapshot.clone());
        t.review_policies.remove(&before.id);
        Ok(snapshot)
    }

    async fn review_policy_history(&self, exam_id: i64) -> Result<Vec<ReviewPolicyHistory>> {
        let t = self.tables.lock().await;
        Ok(t.review_policy_history
            .iter()
            .rev()
            .filter(|h| h.exam_id == exam_id)
            .cloned()
            .collect())
    }

    async fn find_review(&self, attempt_code: &str) -> Result<Option<Review>> {
        let t = self.tables.lock().await;
        Ok(t.reviews
            .values()
            .find(|r| r.attempt_code == attempt_code)
            .cloned())
    }

    async fn put_review(
        &self,
        review: NewReview,
        comments: Vec<NewReviewComment>,
        allow_replace: bool,
    ) -> Result<StoredReview> {
        let mut t = self.tables.lock().await;
        let now = Utc::now();
        let existing = t
            .reviews
            .values()
            .find(|r| r.attempt_code == review.attempt_code)
            .cloned();
        if existing.is_some() && !allow_replace {
            return Err(Error::ReviewAlreadyExists(review.attempt_code));
        }

        let superseded = match &existing {
            Some(before) => {
                let history_id = t.next_id();
                let snapshot = ledger::review_snapshot(history_id, before, now);
                let old_comments: Vec<ReviewComment> = t
                    .review_comments
                    .iter()
                    .filter(|c| c.review_id == before.id)
                    .cloned()
                    .collect();
                for comment in &old_comments {
                    let id = t.next_id();
                    let archived = ledger::review_comment_snapshot(id, history_id, comment, now);
                    t.review_comment_history.push(archived);
                }
                t.review_comments.retain(|c| c.review_id != before.id);
                t.review_history.push(snapshot.clone());
                Some(snapshot)
            }
            None => None,
        };

        let row = Review {
            id: match &existing {
                Some(before) => before.id,
                None => t.next_id(),
            },
            attempt_code: review.attempt_code,
            review_status: review.review_status,
            raw_payload: review.raw_payload,
            reviewed_by: review.reviewed_by,
            student_id: review.student_id,
            exam_id: review.exam_id,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };
        let mut stored_comments = Vec::with_capacity(comments.len());
        for comment in comments {
            let stored = ReviewComment {
                id: t.next_id(),
                review_id: row.id,
                start_time: comment.start_time,
                stop_time: comment.stop_time,
                duration: comment.duration,
                comment_text: comment.comment_text,
                status: comment.status,
                created_at: now,
            };
            t.review_comments.push(stored.clone());
            stored_comments.push(stored);
        }
        t.reviews.insert(row.id, row.clone());

        Ok(StoredReview {
            review: row,
            comments: stored_comments,
            superseded,
        })
    }

    async fn review_comments(&self, review_id: i64) -> Result<Vec<ReviewComment>> {
        let t = self.tables.lock().await;
        Ok(t.review_comments
            .iter()
            .filter(|c| c.review_id == review_id)
            .cloned()
            .collect())
    }

    async fn review_history(&self, attempt_code: &str) -> Result<Vec<ReviewHistory>> {
        let t = self.tables.lock().await;
        Ok(t.review_history
            .iter()
            .rev()
            .filter(|h| h.attempt_code == attempt_code)
            .cloned()
            .collect())
    }

    async fn review_comment_history(
        &self,
        review_history_id: i64,
    ) -> Result<Vec<ReviewCommentHistory>> {
        let t = self.tables.lock().await;
        Ok(t.review_comment_history
            .iter()
            .filter(|c| c.review_history_id == review_history_id)
            .cloned()
            .collect())
    }
}
