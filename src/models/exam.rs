use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Exam {
    pub id: i64,
    pub course_id: String,
    pub content_id: String,
    pub external_id: Option<String>,
    pub exam_name: String,
    pub time_limit_mins: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub is_proctored: bool,
    pub is_practice_exam: bool,
    pub is_active: bool,
    pub hide_after_due: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExam {
    pub course_id: String,
    pub content_id: String,
    pub external_id: Option<String>,
    pub exam_name: String,
    pub time_limit_mins: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub is_proctored: bool,
    pub is_practice_exam: bool,
    pub is_active: bool,
    pub hide_after_due: bool,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExamUpdate {
    pub external_id: Option<String>,
    pub exam_name: Option<String>,
    pub time_limit_mins: Option<i32>,
    pub due_date: Option<DateTime<Utc>>,
    pub is_proctored: Option<bool>,
    pub is_practice_exam: Option<bool>,
    pub is_active: Option<bool>,
    pub hide_after_due: Option<bool>,
}

impl ExamUpdate {
    pub fn apply(&self, exam: &mut Exam) {
        if let Some(v) = &self.external_id {
            exam.external_id = Some(v.clone());
        }
        if let Some(v) = &self.exam_name {
            exam.exam_name = v.clone();
        }
        if let Some(v) = self.time_limit_mins {
            exam.time_limit_mins = v;
        }
        if let Some(v) = self.due_date {
            exam.due_date = Some(v);
        }
        if let Some(v) = self.is_proctored {
            exam.is_proctored = v;
        }
        if let Some(v) = self.is_practice_exam {
            exam.is_practice_exam = v;
        }
        if let Some(v) = self.is_active {
            exam.is_active = v;
        }
        if let Some(v) = self.hide_after_due {
            exam.hide_after_due = v;
        }
    }
}

/// One-to-one side record holding vendor scheduling options; created lazily.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ExamParams {
    pub exam_id: i64,
    pub service: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub visible_to_staff_only: bool,
    pub review_checkbox_config: JsonValue,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExamParamsInput {
    pub service: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visible_to_staff_only: bool,
    pub review_checkbox_config: Option<JsonValue>,
}
