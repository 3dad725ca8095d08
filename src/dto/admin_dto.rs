use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::allowance::{Allowance, AllowanceAction, AllowanceKey};
use crate::models::attempt::AttemptStatus;
use crate::models::exam::NewExam;
use crate::models::review::{Review, ReviewComment, ReviewHistory};
use crate::models::user::NewUser;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 150))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    pub full_name: Option<String>,
}

impl From<CreateUserRequest> for NewUser {
    fn from(req: CreateUserRequest) -> Self {
        NewUser {
            username: req.username,
            email: req.email,
            full_name: req.full_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateExamRequest {
    #[validate(length(min = 1, max = 255))]
    pub course_id: String,
    #[validate(length(min = 1, max = 255))]
    pub content_id: String,
    pub external_id: Option<String>,
    #[validate(length(min = 1))]
    pub exam_name: String,
    #[validate(range(min = 0))]
    pub time_limit_mins: i32,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_proctored: bool,
    #[serde(default)]
    pub is_practice_exam: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub hide_after_due: bool,
}

fn default_true() -> bool {
    true
}

impl From<CreateExamRequest> for NewExam {
    fn from(req: CreateExamRequest) -> Self {
        NewExam {
            course_id: req.course_id,
            content_id: req.content_id,
            external_id: req.external_id,
            exam_name: req.exam_name,
            time_limit_mins: req.time_limit_mins,
            due_date: req.due_date,
            is_proctored: req.is_proctored,
            is_practice_exam: req.is_practice_exam,
            is_active: req.is_active,
            hide_after_due: req.hide_after_due,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAttemptRequest {
    pub exam_id: i64,
    pub user_id: i64,
    #[validate(length(min = 1, max = 255))]
    pub student_name: String,
    /// Defaults to the exam limit plus any additional-time allowance.
    #[validate(range(min = 0))]
    pub allowed_time_limit_mins: Option<i32>,
    /// Generated when absent.
    #[validate(length(min = 1, max = 255))]
    pub attempt_code: Option<String>,
    #[serde(default = "default_true")]
    pub taking_as_proctored: bool,
    #[serde(default)]
    pub is_sample_attempt: bool,
    pub external_id: Option<String>,
    pub provider_name: Option<String>,
    pub review_policy_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AllowanceRequest {
    /// Numeric id, username or email.
    #[validate(length(min = 1))]
    pub user: String,
    pub key: AllowanceKey,
    #[validate(length(max = 255))]
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowanceResponse {
    pub allowance: Allowance,
    pub action: AllowanceAction,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CourseAllowancesQuery {
    #[serde(default)]
    pub timed_only: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReviewPolicyRequest {
    pub set_by_user_id: i64,
    #[validate(length(min = 1))]
    pub policy_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewDetailResponse {
    pub review: Review,
    pub comments: Vec<ReviewComment>,
    pub history: Vec<ReviewHistory>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exam_request_defaults_to_active() {
        let req: CreateExamRequest = serde_json::from_value(json!({
            "course_id": "c", "content_id": "x", "exam_name": "Final", "time_limit_mins": 30
        }))
        .unwrap();
        assert!(req.is_active);
        assert!(!req.is_proctored);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn invalid_user_payload_fails_validation() {
        let req = CreateUserRequest {
            username: String::new(),
            email: "not-an-email".into(),
            full_name: None,
        };
        let errors = req.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("username"));
        assert!(fields.contains_key("email"));
    }
}
