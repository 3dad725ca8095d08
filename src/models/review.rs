use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use std::str::FromStr;

use super::attempt::AttemptStatus;
use super::UnknownVariant;

/// Normalised verdict returned by a provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Verified,
    Rejected,
    SecondReviewRequired,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewVerdict::Verified => "verified",
            ReviewVerdict::Rejected => "rejected",
            ReviewVerdict::SecondReviewRequired => "second_review_required",
        }
    }

    pub fn attempt_status(&self) -> AttemptStatus {
        match self {
            ReviewVerdict::Verified => AttemptStatus::Verified,
            ReviewVerdict::Rejected => AttemptStatus::Rejected,
            ReviewVerdict::SecondReviewRequired => AttemptStatus::SecondReviewRequired,
        }
    }
}

impl FromStr for ReviewVerdict {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(ReviewVerdict::Verified),
            "rejected" => Ok(ReviewVerdict::Rejected),
            "second_review_required" => Ok(ReviewVerdict::SecondReviewRequired),
            other => Err(UnknownVariant {
                kind: "review verdict",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ReviewVerdict {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Review {
    pub id: i64,
    pub attempt_code: String,
    #[sqlx(try_from = "String")]
    pub review_status: ReviewVerdict,
    pub raw_payload: JsonValue,
    pub reviewed_by: Option<String>,
    pub student_id: Option<i64>,
    pub exam_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ReviewHistory {
    pub id: i64,
    pub review_id: i64,
    pub attempt_code: String,
    #[sqlx(try_from = "String")]
    pub review_status: ReviewVerdict,
    pub raw_payload: JsonValue,
    pub reviewed_by: Option<String>,
    pub student_id: Option<i64>,
    pub exam_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ReviewComment {
    pub id: i64,
    pub review_id: i64,
    pub start_time: i32,
    pub stop_time: i32,
    pub duration: i32,
    pub comment_text: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Comment archived alongside a superseded review.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ReviewCommentHistory {
    pub id: i64,
    pub review_history_id: i64,
    pub start_time: i32,
    pub stop_time: i32,
    pub duration: i32,
    pub comment_text: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReview {
    pub attempt_code: String,
    pub review_status: ReviewVerdict,
    pub raw_payload: JsonValue,
    pub reviewed_by: Option<String>,
    pub student_id: Option<i64>,
    pub exam_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReviewComment {
    pub start_time: i32,
    pub stop_time: i32,
    pub duration: i32,
    pub comment_text: String,
    pub status: String,
}
