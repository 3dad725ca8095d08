use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ReviewPolicy {
    pub id: i64,
    pub exam_id: i64,
    pub set_by_user_id: i64,
    pub policy_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Archived policy version. Rows are permanent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ReviewPolicyHistory {
    pub id: i64,
    pub original_id: i64,
    pub exam_id: i64,
    pub set_by_user_id: i64,
    pub policy_text: String,
    pub created_at: DateTime<Utc>,
}
