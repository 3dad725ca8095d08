use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

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

/// The provider association lives in a side table; every attempt read joins it.
const ATTEMPT_SELECT: &str = r#"
    SELECT a.id, a.user_id, a.exam_id, a.started_at, a.completed_at, a.attempt_code,
           a.external_id, a.allowed_time_limit_mins, a.status, a.taking_as_proctored,
           a.is_sample_attempt, a.student_name, a.review_policy_id, a.is_status_acknowledged,
           s.service AS provider_name, a.created_at, a.updated_at
    FROM exam_attempts a
    LEFT JOIN exam_attempt_services s ON s.attempt_id = a.id
"#;

const DUPLICATE_ATTEMPT_CONSTRAINT: &str = "exam_attempts_user_exam_unique";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

async fn fetch_attempt(
    conn: &mut PgConnection,
    attempt_id: i64,
    lock: bool,
) -> Result<Option<Attempt>> {
    let sql = if lock {
        format!("{} WHERE a.id = $1 FOR UPDATE OF a", ATTEMPT_SELECT)
    } else {
        format!("{} WHERE a.id = $1", ATTEMPT_SELECT)
    };
    let row = sqlx::query_as::<_, Attempt>(&sql)
        .bind(attempt_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

async fn set_attempt_service(conn: &mut PgConnection, attempt_id: i64, service: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO exam_attempt_services (attempt_id, service) VALUES ($1, $2)
        ON CONFLICT (attempt_id) DO UPDATE SET service = EXCLUDED.service
        "#,
    )
    .bind(attempt_id)
    .bind(service)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_review_comments(conn: &mut PgConnection, review_id: i64) -> Result<Vec<ReviewComment>> {
    let rows = sqlx::query_as::<_, ReviewComment>(
        r#"SELECT * FROM review_comments WHERE review_id = $1 ORDER BY id ASC"#,
    )
    .bind(review_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

#[async_trait]
impl EntityStore for PgStore {
    async fn insert_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, User>(
            r#"INSERT INTO users (username, email, full_name) VALUES ($1, $2, $3) RETURNING *"#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_user(&self, user_ref: &UserRef) -> Result<Option<User>> {
        let query = match user_ref {
            UserRef::Id(id) => {
                sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE id = $1"#).bind(*id)
            }
            UserRef::Email(email) => {
                sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE LOWER(email) = LOWER($1)"#)
                    .bind(email.clone())
            }
            UserRef::Username(name) => {
                sqlx::query_as::<_, User>(r#"SELECT * FROM users WHERE username = $1"#)
                    .bind(name.clone())
            }
        };
        Ok(query.fetch_optional(&self.pool).await?)
    }

    async fn insert_exam(&self, exam: NewExam) -> Result<Exam> {
        let row = sqlx::query_as::<_, Exam>(
            r#"
            INSERT INTO exams (
                course_id, content_id, external_id, exam_name, time_limit_mins, due_date,
                is_proctored, is_practice_exam, is_active, hide_after_due
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&exam.course_id)
        .bind(&exam.content_id)
        .bind(&exam.external_id)
        .bind(&exam.exam_name)
        .bind(exam.time_limit_mins)
        .bind(exam.due_date)
        .bind(exam.is_proctored)
        .bind(exam.is_practice_exam)
        .bind(exam.is_active)
        .bind(exam.hide_after_due)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_exam(&self, exam_id: i64, update: ExamUpdate) -> Result<Exam> {
        let mut tx = self.pool.begin().await?;
        let mut exam = sqlx::query_as::<_, Exam>(r#"SELECT * FROM exams WHERE id = $1 FOR UPDATE"#)
            .bind(exam_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::ExamNotFound(exam_id))?;
        update.apply(&mut exam);

        let row = sqlx::query_as::<_, Exam>(
            r#"
            UPDATE exams
            SET external_id = $2, exam_name = $3, time_limit_mins = $4, due_date = $5,
                is_proctored = $6, is_practice_exam = $7, is_active = $8, hide_after_due = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(exam.id)
        .bind(&exam.external_id)
        .bind(&exam.exam_name)
        .bind(exam.time_limit_mins)
        .bind(exam.due_date)
        .bind(exam.is_proctored)
        .bind(exam.is_practice_exam)
        .bind(exam.is_active)
        .bind(exam.hide_after_due)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn find_exam(&self, exam_id: i64) -> Result<Option<Exam>> {
        let row = sqlx::query_as::<_, Exam>(r#"SELECT * FROM exams WHERE id = $1"#)
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_course_exams(&self, course_id: &str) -> Result<Vec<Exam>> {
        let rows = sqlx::query_as::<_, Exam>(
            r#"SELECT * FROM exams WHERE course_id = $1 ORDER BY id ASC"#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_exam_params(&self, exam_id: i64) -> Result<Option<ExamParams>> {
        let row = sqlx::query_as::<_, ExamParams>(r#"SELECT * FROM exam_params WHERE exam_id = $1"#)
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn put_exam_params(&self, exam_id: i64, params: ExamParamsInput) -> Result<ExamParams> {
        let result = sqlx::query_as::<_, ExamParams>(
            r#"
            INSERT INTO exam_params (
                exam_id, service, deadline, start, visible_to_staff_only, review_checkbox_config
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (exam_id) DO UPDATE SET
                service = EXCLUDED.service,
                deadline = EXCLUDED.deadline,
                start = EXCLUDED.start,
                visible_to_staff_only = EXCLUDED.visible_to_staff_only,
                review_checkbox_config = EXCLUDED.review_checkbox_config,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(exam_id)
        .bind(&params.service)
        .bind(params.deadline)
        .bind(params.start)
        .bind(params.visible_to_staff_only)
        .bind(
            params
                .review_checkbox_config
                .clone()
                .unwrap_or_else(|| serde_json::json!({})),
        )
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(err) if is_foreign_key_violation(&err) => Err(Error::ExamNotFound(exam_id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO exam_attempts (
                user_id, exam_id, attempt_code, external_id, allowed_time_limit_mins, status,
                taking_as_proctored, is_sample_attempt, student_name, review_policy_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(attempt.user_id)
        .bind(attempt.exam_id)
        .bind(&attempt.attempt_code)
        .bind(&attempt.external_id)
        .bind(attempt.allowed_time_limit_mins)
        .bind(AttemptStatus::Created.as_str())
        .bind(attempt.taking_as_proctored)
        .bind(attempt.is_sample_attempt)
        .bind(&attempt.student_name)
        .bind(attempt.review_policy_id)
        .fetch_one(&mut *tx)
        .await;

        let attempt_id = match inserted {
            Ok(id) => id,
            Err(err) => {
                return Err(match unique_violation(&err) {
                    Some(constraint) if constraint == DUPLICATE_ATTEMPT_CONSTRAINT => {
                        Error::DuplicateAttempt {
                            exam_id: attempt.exam_id,
                            user_id: attempt.user_id,
                        }
                    }
                    Some(_) => Error::Conflict("attempt code already in use".to_string()),
                    None => err.into(),
                })
            }
        };

        if let Some(service) = &attempt.provider_name {
            set_attempt_service(&mut tx, attempt_id, service).await?;
        }
        let row = fetch_attempt(&mut tx, attempt_id, false)
            .await?
            .ok_or_else(|| Error::Internal(format!("attempt {} vanished after insert", attempt_id)))?;
        tx.commit().await?;
        Ok(row)
    }

    async fn find_attempt(&self, attempt_id: i64) -> Result<Option<Attempt>> {
        let mut conn = self.pool.acquire().await?;
        fetch_attempt(&mut conn, attempt_id, false).await
    }

    async fn find_attempt_for(&self, exam_id: i64, user_id: i64) -> Result<Option<Attempt>> {
        let sql = format!("{} WHERE a.exam_id = $1 AND a.user_id = $2", ATTEMPT_SELECT);
        let row = sqlx::query_as::<_, Attempt>(&sql)
            .bind(exam_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_attempt_by_code(&self, attempt_code: &str) -> Result<Option<Attempt>> {
        let sql = format!("{} WHERE a.attempt_code = $1", ATTEMPT_SELECT);
        let row = sqlx::query_as::<_, Attempt>(&sql)
            .bind(attempt_code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
        change: AttemptChange,
    ) -> Result<Attempt> {
        let mut tx = self.pool.begin().await?;
        let before = fetch_attempt(&mut tx, attempt_id, true)
            .await?
            .ok_or_else(|| Error::AttemptNotFound(format!("attempt {}", attempt_id)))?;
        if before.status != expected_status {
            return Err(Error::ConcurrentModification(format!(
                "attempt {} is '{}', expected '{}'",
                attempt_id, before.status, expected_status
            )));
        }

        ledger::archive_attempt(&mut tx, &before, ledger::change_kind(&before, &change)).await?;

        let mut after = before.clone();
        change.apply(&mut after, Utc::now());
        let updated = sqlx::query(
            r#"
            UPDATE exam_attempts
            SET status = $2, started_at = $3, completed_at = $4, is_status_acknowledged = $5,
                updated_at = $6
            WHERE id = $1 AND status = $7
            "#,
        )
        .bind(attempt_id)
        .bind(after.status.as_str())
        .bind(after.started_at)
        .bind(after.completed_at)
        .bind(after.is_status_acknowledged)
        .bind(after.updated_at)
        .bind(expected_status.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(Error::ConcurrentModification(format!(
                "attempt {} changed during update",
                attempt_id
            )));
        }

        tx.commit().await?;
        Ok(after)
    }

    async fn delete_attempt(
        &self,
        attempt_id: i64,
        expected_status: AttemptStatus,
    ) -> Result<AttemptHistory> {
        let mut tx = self.pool.begin().await?;
        let before = fetch_attempt(&mut tx, attempt_id, true)
            .await?
            .ok_or_else(|| Error::AttemptNotFound(format!("attempt {}", attempt_id)))?;
        if before.status != expected_status {
            return Err(Error::ConcurrentModification(format!(
                "attempt {} is '{}', expected '{}'",
                attempt_id, before.status, expected_status
            )));
        }
        let archived = ledger::archive_attempt(&mut tx, &before, ChangeKind::Delete).await?;

        sqlx::query(r#"DELETE FROM exam_attempt_services WHERE attempt_id = $1"#)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r#"DELETE FROM exam_attempts WHERE id = $1"#)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(archived)
    }

    async fn attempt_history_by_code(&self, attempt_code: &str) -> Result<Vec<AttemptHistory>> {
        let rows = sqlx::query_as::<_, AttemptHistory>(
            r#"SELECT * FROM exam_attempt_history WHERE attempt_code = $1 ORDER BY id DESC"#,
        )
        .bind(attempt_code)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn attempt_history(&self, attempt_id: i64) -> Result<Vec<AttemptHistory>> {
        let rows = sqlx::query_as::<_, AttemptHistory>(
            r#"SELECT * FROM exam_attempt_history WHERE attempt_id = $1 ORDER BY id DESC"#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_stale_attempts(
        &self,
        status: AttemptStatus,
        modified_before: DateTime<Utc>,
    ) -> Result<Vec<Attempt>> {
        let sql = format!(
            "{} WHERE a.status = $1 AND a.updated_at < $2 ORDER BY a.id ASC",
            ATTEMPT_SELECT
        );
        let rows = sqlx::query_as::<_, Attempt>(&sql)
            .bind(status.as_str())
            .bind(modified_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<Option<Allowance>> {
        let row = sqlx::query_as::<_, Allowance>(
            r#"SELECT * FROM allowances WHERE exam_id = $1 AND user_id = $2 AND key = $3"#,
        )
        .bind(exam_id)
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_allowances(&self, exam_id: i64, user_id: i64) -> Result<Vec<Allowance>> {
        let rows = sqlx::query_as::<_, Allowance>(
            r#"SELECT * FROM allowances WHERE exam_id = $1 AND user_id = $2 ORDER BY id ASC"#,
        )
        .bind(exam_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_course_allowances(&self, course_id: &str) -> Result<Vec<Allowance>> {
        let rows = sqlx::query_as::<_, Allowance>(
            r#"
            SELECT al.* FROM allowances al
            JOIN exams e ON e.id = al.exam_id
            WHERE e.course_id = $1
            ORDER BY al.id ASC
            "#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
        value: &str,
        expected_value: Option<&str>,
    ) -> Result<AllowanceWrite> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, Allowance>(
            r#"SELECT * FROM allowances WHERE exam_id = $1 AND user_id = $2 AND key = $3 FOR UPDATE"#,
        )
        .bind(exam_id)
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if existing.as_ref().map(|a| a.value.as_str()) != expected_value {
            return Err(Error::ConcurrentModification(format!(
                "allowance '{}' for user {} on exam {} changed concurrently",
                key, user_id, exam_id
            )));
        }

        let write = match existing {
            Some(before) => {
                ledger::archive_allowance(&mut tx, &before).await?;
                let row = sqlx::query_as::<_, Allowance>(
                    r#"UPDATE allowances SET value = $2, updated_at = NOW() WHERE id = $1 RETURNING *"#,
                )
                .bind(before.id)
                .bind(value)
                .fetch_one(&mut *tx)
                .await?;
                AllowanceWrite {
                    allowance: row,
                    created: false,
                }
            }
            None => {
                let inserted = sqlx::query_as::<_, Allowance>(
                    r#"
                    INSERT INTO allowances (user_id, exam_id, key, value)
                    VALUES ($1, $2, $3, $4)
                    RETURNING *
                    "#,
                )
                .bind(user_id)
                .bind(exam_id)
                .bind(key.as_str())
                .bind(value)
                .fetch_one(&mut *tx)
                .await;
                match inserted {
                    Ok(row) => AllowanceWrite {
                        allowance: row,
                        created: true,
                    },
                    Err(err) if unique_violation(&err).is_some() => {
                        return Err(Error::ConcurrentModification(format!(
                            "allowance '{}' for user {} on exam {} was created concurrently",
                            key, user_id, exam_id
                        )))
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };
        tx.commit().await?;
        Ok(write)
    }

    async fn delete_allowance(
        &self,
        exam_id: i64,
        user_id: i64,
        key: AllowanceKey,
    ) -> Result<AllowanceHistory> {
        let mut tx = self.pool.begin().await?;
        let before = sqlx::query_as::<_, Allowance>(
            r#"SELECT * FROM allowances WHERE exam_id = $1 AND user_id = $2 AND key = $3 FOR UPDATE"#,
        )
        .bind(exam_id)
        .bind(user_id)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("allowance '{}' not found", key)))?;

        let archived = ledger::archive_allowance(&mut tx, &before).await?;
        sqlx::query(r#"DELETE FROM allowances WHERE id = $1"#)
            .bind(before.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(archived)
    }

    async fn allowance_history(&self, exam_id: i64, user_id: i64) -> Result<Vec<AllowanceHistory>> {
        let rows = sqlx::query_as::<_, AllowanceHistory>(
            r#"
            SELECT * FROM allowance_history
            WHERE exam_id = $1 AND user_id = $2
            ORDER BY id DESC
            "#,
        )
        .bind(exam_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_review_policy(&self, exam_id: i64) -> Result<Option<ReviewPolicy>> {
        let row = sqlx::query_as::<_, ReviewPolicy>(
            r#"SELECT * FROM review_policies WHERE exam_id = $1 ORDER BY id DESC LIMIT 1"#,
        )
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put_review_policy(
        &self,
        exam_id: i64,
        set_by_user_id: i64,
        policy_text: &str,
    ) -> Result<ReviewPolicy> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, ReviewPolicy>(
            r#"SELECT * FROM review_policies WHERE exam_id = $1 ORDER BY id DESC LIMIT 1 FOR UPDATE"#,
        )
        .bind(exam_id)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            Some(before) => {
                ledger::archive_review_policy(&mut tx, &before).await?;
                sqlx::query_as::<_, ReviewPolicy>(
                    r#"
                    UPDATE review_policies
                    SET set_by_user_id = $2, policy_text = $3, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(before.id)
                .bind(set_by_user_id)
                .bind(policy_text)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, ReviewPolicy>(
                    r#"
                    INSERT INTO review_policies (exam_id, set_by_user_id, policy_text)
                    VALUES ($1, $2, $3)
                    RETURNING *
                    "#,
                )
                .bind(exam_id)
                .bind(set_by_user_id)
                .bind(policy_text)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        Ok(row)
    }

    async fn delete_review_policy(&self, exam_id: i64) -> Result<ReviewPolicyHistory> {
        let mut tx = self.pool.begin().await?;
        let before = sqlx::query_as::<_, ReviewPolicy>(
            r#"SELECT * FROM review_policies WHERE exam_id = $1 ORDER BY id DESC LIMIT 1 FOR UPDATE"#,
        )
        .bind(exam_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no review policy for exam {}", exam_id)))?;

        let archived = ledger::archive_review_policy(&mut tx, &before).await?;
        sqlx::query(r#"DELETE FROM review_policies WHERE id = $1"#)
            .bind(before.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(archived)
    }

    async fn review_policy_history(&self, exam_id: i64) -> Result<Vec<ReviewPolicyHistory>> {
        let rows = sqlx::query_as::<_, ReviewPolicyHistory>(
            r#"SELECT * FROM review_policy_history WHERE exam_id = $1 ORDER BY id DESC"#,
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_review(&self, attempt_code: &str) -> Result<Option<Review>> {
        let row = sqlx::query_as::<_, Review>(r#"SELECT * FROM reviews WHERE attempt_code = $1"#)
            .bind(attempt_code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn put_review(
        &self,
        review: NewReview,
        comments: Vec<NewReviewComment>,
        allow_replace: bool,
    ) -> Result<StoredReview> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, Review>(
            r#"SELECT * FROM reviews WHERE attempt_code = $1 FOR UPDATE"#,
        )
        .bind(&review.attempt_code)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() && !allow_replace {
            return Err(Error::ReviewAlreadyExists(review.attempt_code));
        }

        let (row, superseded) = match existing {
            Some(before) => {
                let old_comments = fetch_review_comments(&mut tx, before.id).await?;
                let archived = ledger::archive_review(&mut tx, &before, &old_comments).await?;
                sqlx::query(r#"DELETE FROM review_comments WHERE review_id = $1"#)
                    .bind(before.id)
                    .execute(&mut *tx)
                    .await?;
                let row = sqlx::query_as::<_, Review>(
                    r#"
                    UPDATE reviews
                    SET review_status = $2, raw_payload = $3, reviewed_by = $4, student_id = $5,
                        exam_id = $6, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(before.id)
                .bind(review.review_status.as_str())
                .bind(&review.raw_payload)
                .bind(&review.reviewed_by)
                .bind(review.student_id)
                .bind(review.exam_id)
                .fetch_one(&mut *tx)
                .await?;
                (row, Some(archived))
            }
            None => {
                let inserted = sqlx::query_as::<_, Review>(
                    r#"
                    INSERT INTO reviews (
                        attempt_code, review_status, raw_payload, reviewed_by, student_id, exam_id
                    ) VALUES ($1, $2, $3, $4, $5, $6)
                    RETURNING *
                    "#,
                )
                .bind(&review.attempt_code)
                .bind(review.review_status.as_str())
                .bind(&review.raw_payload)
                .bind(&review.reviewed_by)
                .bind(review.student_id)
                .bind(review.exam_id)
                .fetch_one(&mut *tx)
                .await;
                match inserted {
                    Ok(row) => (row, None),
                    Err(err) if unique_violation(&err).is_some() && !allow_replace => {
                        return Err(Error::ReviewAlreadyExists(review.attempt_code))
                    }
                    Err(err) if unique_violation(&err).is_some() => {
                        return Err(Error::ConcurrentModification(format!(
                            "review for {} was recorded concurrently",
                            review.attempt_code
                        )))
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        let mut stored_comments = Vec::with_capacity(comments.len());
        for comment in comments {
            let stored = sqlx::query_as::<_, ReviewComment>(
                r#"
                INSERT INTO review_comments (
                    review_id, start_time, stop_time, duration, comment_text, status
                ) VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(row.id)
            .bind(comment.start_time)
            .bind(comment.stop_time)
            .bind(comment.duration)
            .bind(&comment.comment_text)
            .bind(&comment.status)
            .fetch_one(&mut *tx)
            .await?;
            stored_comments.push(stored);
        }
        tx.commit().await?;

        Ok(StoredReview {
            review: row,
            comments: stored_comments,
            superseded,
        })
    }

    async fn review_comments(&self, review_id: i64) -> Result<Vec<ReviewComment>> {
        let mut conn = self.pool.acquire().await?;
        fetch_review_comments(&mut conn, review_id).await
    }

    async fn review_history(&self, attempt_code: &str) -> Result<Vec<ReviewHistory>> {
        let rows = sqlx::query_as::<_, ReviewHistory>(
            r#"SELECT * FROM review_history WHERE attempt_code = $1 ORDER BY id DESC"#,
        )
        .bind(attempt_code)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn review_comment_history(
        &self,
        review_history_id: i64,
    ) -> Result<Vec<ReviewCommentHistory>> {
        let rows = sqlx::query_as::<_, ReviewCommentHistory>(
            r#"SELECT * FROM review_comment_history WHERE review_history_id = $1 ORDER BY id ASC"#,
        )
        .bind(review_history_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
