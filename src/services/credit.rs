use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::exam::Exam;
use crate::store::EntityStore;

/// Credit-requirement collaborator consulted by the declined cascade.
#[async_trait]
pub trait CreditRequirements: Send + Sync {
    async fn requires_credit(&self, exam: &Exam) -> Result<bool>;
    async fn not_yet_attempted(&self, exam: &Exam, user_id: i64) -> Result<bool>;
}

/// Proctored, non-practice, active exams count toward credit. An exam is
/// untouched while the learner has no attempt or only a pre-start one.
#[derive(Clone)]
pub struct StoreCreditRequirements {
    store: Arc<dyn EntityStore>,
}

impl StoreCreditRequirements {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CreditRequirements for StoreCreditRequirements {
    async fn requires_credit(&self, exam: &Exam) -> Result<bool> {
        Ok(exam.is_proctored && !exam.is_practice_exam && exam.is_active)
    }

    async fn not_yet_attempted(&self, exam: &Exam, user_id: i64) -> Result<bool> {
        let attempt = self.store.find_attempt_for(exam.id, user_id).await?;
        Ok(attempt.map_or(true, |a| a.status.is_pre_start()))
    }
}
