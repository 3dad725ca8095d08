use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::UnknownVariant;

/// Closed set of per-user exception kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceKey {
    AdditionalTimeGranted,
    ReviewPolicyException,
}

impl AllowanceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowanceKey::AdditionalTimeGranted => "additional_time_granted",
            AllowanceKey::ReviewPolicyException => "review_policy_exception",
        }
    }
}

impl std::fmt::Display for AllowanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllowanceKey {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "additional_time_granted" => Ok(AllowanceKey::AdditionalTimeGranted),
            "review_policy_exception" => Ok(AllowanceKey::ReviewPolicyException),
            other => Err(UnknownVariant {
                kind: "allowance key",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for AllowanceKey {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Allowance {
    pub id: i64,
    pub user_id: i64,
    pub exam_id: i64,
    #[sqlx(try_from = "String")]
    pub key: AllowanceKey,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct AllowanceHistory {
    pub id: i64,
    pub allowance_id: i64,
    pub user_id: i64,
    pub exam_id: i64,
    #[sqlx(try_from = "String")]
    pub key: AllowanceKey,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceAction {
    Created,
    Updated,
}
