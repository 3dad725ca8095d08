//! Archival ledger: builds and writes the immutable pre-mutation copy of a
//! tracked row. Callers invoke it inside the unit that performs the mutation.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::Result;
use crate::models::allowance::{Allowance, AllowanceHistory};
use crate::models::attempt::{Attempt, AttemptChange, AttemptHistory, ChangeKind};
use crate::models::review::{Review, ReviewComment, ReviewCommentHistory, ReviewHistory};
use crate::models::review_policy::{ReviewPolicy, ReviewPolicyHistory};

/// A status history row is only warranted when the status actually moves.
pub fn change_kind(before: &Attempt, change: &AttemptChange) -> ChangeKind {
    match change.status {
        Some(status) if status != before.status => ChangeKind::StatusChange,
        _ => ChangeKind::Update,
    }
}

pub fn attempt_snapshot(
    id: i64,
    before: &Attempt,
    kind: ChangeKind,
    at: DateTime<Utc>,
) -> AttemptHistory {
    AttemptHistory {
        id,
        attempt_id: before.id,
        user_id: before.user_id,
        exam_id: before.exam_id,
        started_at: before.started_at,
        completed_at: before.completed_at,
        attempt_code: before.attempt_code.clone(),
        external_id: before.external_id.clone(),
        allowed_time_limit_mins: before.allowed_time_limit_mins,
        status: before.status,
        taking_as_proctored: before.taking_as_proctored,
        is_sample_attempt: before.is_sample_attempt,
        student_name: before.student_name.clone(),
        review_policy_id: before.review_policy_id,
        is_status_acknowledged: before.is_status_acknowledged,
        provider_name: before.provider_name.clone(),
        change_kind: kind,
        created_at: at,
    }
}

pub fn allowance_snapshot(id: i64, before: &Allowance, at: DateTime<Utc>) -> AllowanceHistory {
    AllowanceHistory {
        id,
        allowance_id: before.id,
        user_id: before.user_id,
        exam_id: before.exam_id,
        key: before.key,
        value: before.value.clone(),
        created_at: at,
    }
}

pub fn review_policy_snapshot(
    id: i64,
    before: &ReviewPolicy,
    at: DateTime<Utc>,
) -> ReviewPolicyHistory {
    ReviewPolicyHistory {
        id,
        original_id: before.id,
        exam_id: before.exam_id,
        set_by_user_id: before.set_by_user_id,
        policy_text: before.policy_text.clone(),
        created_at: at,
    }
}

pub fn review_snapshot(id: i64, before: &Review, at: DateTime<Utc>) -> ReviewHistory {
    ReviewHistory {
        id,
        review_id: before.id,
        attempt_code: before.attempt_code.clone(),
        review_status: before.review_status,
        raw_payload: before.raw_payload.clone(),
        reviewed_by: before.reviewed_by.clone(),
        student_id: before.student_id,
        exam_id: before.exam_id,
        created_at: at,
    }
}

pub fn review_comment_snapshot(
    id: i64,
    review_history_id: i64,
    before: &ReviewComment,
    at: DateTime<Utc>,
) -> ReviewCommentHistory {
    ReviewCommentHistory {
        id,
        review_history_id,
        start_time: before.start_time,
        stop_time: before.stop_time,
        duration: before.duration,
        comment_text: before.comment_text.clone(),
        status: before.status.clone(),
        created_at: at,
    }
}

pub async fn archive_attempt(
    conn: &mut PgConnection,
    before: &Attempt,
    kind: ChangeKind,
) -> Result<AttemptHistory> {
    let row = sqlx::query_as::<_, AttemptHistory>(
        r#"
        INSERT INTO exam_attempt_history (
            attempt_id, user_id, exam_id, started_at, completed_at, attempt_code, external_id,
            allowed_time_limit_mins, status, taking_as_proctored, is_sample_attempt, student_name,
            review_policy_id, is_status_acknowledged, provider_name, change_kind
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        RETURNING *
        "#,
    )
    .bind(before.id)
    .bind(before.user_id)
    .bind(before.exam_id)
    .bind(before.started_at)
    .bind(before.completed_at)
    .bind(&before.attempt_code)
    .bind(&before.external_id)
    .bind(before.allowed_time_limit_mins)
    .bind(before.status.as_str())
    .bind(before.taking_as_proctored)
    .bind(before.is_sample_attempt)
    .bind(&before.student_name)
    .bind(before.review_policy_id)
    .bind(before.is_status_acknowledged)
    .bind(&before.provider_name)
    .bind(kind.as_str())
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(
        attempt_id = before.id,
        history_id = row.id,
        change_kind = kind.as_str(),
        "attempt archived"
    );
    Ok(row)
}

pub async fn archive_allowance(
    conn: &mut PgConnection,
    before: &Allowance,
) -> Result<AllowanceHistory> {
    let row = sqlx::query_as::<_, AllowanceHistory>(
        r#"
        INSERT INTO allowance_history (allowance_id, user_id, exam_id, key, value)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(before.id)
    .bind(before.user_id)
    .bind(before.exam_id)
    .bind(before.key.as_str())
    .bind(&before.value)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn archive_review_policy(
    conn: &mut PgConnection,
    before: &ReviewPolicy,
) -> Result<ReviewPolicyHistory> {
    let row = sqlx::query_as::<_, ReviewPolicyHistory>(
        r#"
        INSERT INTO review_policy_history (original_id, exam_id, set_by_user_id, policy_text)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(before.id)
    .bind(before.exam_id)
    .bind(before.set_by_user_id)
    .bind(&before.policy_text)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn archive_review(
    conn: &mut PgConnection,
    before: &Review,
    comments: &[ReviewComment],
) -> Result<ReviewHistory> {
    let row = sqlx::query_as::<_, ReviewHistory>(
        r#"
        INSERT INTO review_history (
            review_id, attempt_code, review_status, raw_payload, reviewed_by, student_id, exam_id
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(before.id)
    .bind(&before.attempt_code)
    .bind(before.review_status.as_str())
    .bind(&before.raw_payload)
    .bind(&before.reviewed_by)
    .bind(before.student_id)
    .bind(before.exam_id)
    .fetch_one(&mut *conn)
    .await?;

    for comment in comments {
        sqlx::query(
            r#"
            INSERT INTO review_comment_history (
                review_history_id, start_time, stop_time, duration, comment_text, status
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(comment.start_time)
        .bind(comment.stop_time)
        .bind(comment.duration)
        .bind(&comment.comment_text)
        .bind(&comment.status)
        .execute(&mut *conn)
        .await?;
    }

    Ok(row)
}
