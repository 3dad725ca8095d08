use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::review_policy::{ReviewPolicy, ReviewPolicyHistory};
use crate::store::EntityStore;

#[derive(Clone)]
pub struct ReviewPolicyService {
    store: Arc<dyn EntityStore>,
    default_policy: String,
}

impl ReviewPolicyService {
    pub fn new(store: Arc<dyn EntityStore>, default_policy: String) -> Self {
        Self {
            store,
            default_policy,
        }
    }

    /// Replaces the exam's policy, archiving the previous version first.
    pub async fn set(&self, exam_id: i64, set_by_user_id: i64, policy_text: &str) -> Result<ReviewPolicy> {
        self.store
            .find_exam(exam_id)
            .await?
            .ok_or(Error::ExamNotFound(exam_id))?;
        let policy = self
            .store
            .put_review_policy(exam_id, set_by_user_id, policy_text)
            .await?;
        tracing::info!(exam_id, set_by_user_id, policy_id = policy.id, "review policy set");
        Ok(policy)
    }

    pub async fn get(&self, exam_id: i64) -> Result<Option<ReviewPolicy>> {
        self.store.find_review_policy(exam_id).await
    }

    /// The exam's policy text, or the platform default when none is set.
    pub async fn policy_text(&self, exam_id: i64) -> Result<String> {
        Ok(self
            .get(exam_id)
            .await?
            .map(|p| p.policy_text)
            .unwrap_or_else(|| self.default_policy.clone()))
    }

    pub async fn remove(&self, exam_id: i64) -> Result<ReviewPolicyHistory> {
        let archived = self.store.delete_review_policy(exam_id).await?;
        tracing::info!(exam_id, original_id = archived.original_id, "review policy removed");
        Ok(archived)
    }

    pub async fn history(&self, exam_id: i64) -> Result<Vec<ReviewPolicyHistory>> {
        self.store.review_policy_history(exam_id).await
    }

    pub async fn delete_history(&self, history_id: i64) -> Result<()> {
        self.store.delete_review_policy_history(history_id).await
    }
}
