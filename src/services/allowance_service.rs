use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::allowance::{Allowance, AllowanceAction, AllowanceHistory, AllowanceKey};
use crate::models::user::UserRef;
use crate::store::EntityStore;

#[derive(Clone)]
pub struct AllowanceService {
    store: Arc<dyn EntityStore>,
}

impl AllowanceService {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Creates or overwrites the (exam, user, key) allowance. All validation
    /// happens before the store is touched, so rejected writes leave no history.
    pub async fn add_or_update(
        &self,
        exam_id: i64,
        user_ref: &UserRef,
        key: AllowanceKey,
        value: &str,
    ) -> Result<(Allowance, AllowanceAction)> {
        let user = self
            .store
            .find_user(user_ref)
            .await?
            .ok_or_else(|| Error::UserNotFound(user_ref.to_string()))?;
        let exam = self
            .store
            .find_exam(exam_id)
            .await?
            .ok_or(Error::ExamNotFound(exam_id))?;
        if !exam.is_active {
            return Err(Error::ExamNotActive(exam_id));
        }
        validate_value(key, value)?;

        let current = self.store.find_allowance(exam_id, user.id, key).await?;
        let write = self
            .store
            .put_allowance(
                exam_id,
                user.id,
                key,
                value,
                current.as_ref().map(|a| a.value.as_str()),
            )
            .await?;

        let action = if write.created {
            AllowanceAction::Created
        } else {
            AllowanceAction::Updated
        };
        tracing::info!(exam_id, user_id = user.id, key = %key, ?action, "allowance written");
        Ok((write.allowance, action))
    }

    pub async fn get(&self, exam_id: i64, user_id: i64, key: AllowanceKey) -> Result<Option<Allowance>> {
        self.store.find_allowance(exam_id, user_id, key).await
    }

    pub async fn get_all(&self, exam_id: i64, user_id: i64) -> Result<Vec<Allowance>> {
        self.store.list_allowances(exam_id, user_id).await
    }

    /// Allowances across a course. With `timed_only`, restricted to exams that
    /// are timed but not proctored.
    pub async fn get_for_course(&self, course_id: &str, timed_only: bool) -> Result<Vec<Allowance>> {
        let allowances = self.store.list_course_allowances(course_id).await?;
        if !timed_only {
            return Ok(allowances);
        }
        let exams: HashMap<i64, bool> = self
            .store
            .list_course_exams(course_id)
            .await?
            .into_iter()
            .map(|e| (e.id, e.is_proctored))
            .collect();
        Ok(allowances
            .into_iter()
            .filter(|a| exams.get(&a.exam_id) == Some(&false))
            .collect())
    }

    pub async fn history(&self, exam_id: i64, user_id: i64) -> Result<Vec<AllowanceHistory>> {
        self.store.allowance_history(exam_id, user_id).await
    }

    pub async fn additional_time_minutes(&self, exam_id: i64, user_id: i64) -> Result<Option<i32>> {
        Ok(self
            .get(exam_id, user_id, AllowanceKey::AdditionalTimeGranted)
            .await?
            .and_then(|a| a.value.parse().ok()))
    }

    pub async fn review_policy_exception(&self, exam_id: i64, user_id: i64) -> Result<Option<String>> {
        Ok(self
            .get(exam_id, user_id, AllowanceKey::ReviewPolicyException)
            .await?
            .map(|a| a.value))
    }

    pub async fn remove(&self, exam_id: i64, user_id: i64, key: AllowanceKey) -> Result<AllowanceHistory> {
        let archived = self.store.delete_allowance(exam_id, user_id, key).await?;
        tracing::info!(exam_id, user_id, key = %key, "allowance removed");
        Ok(archived)
    }
}

fn validate_value(key: AllowanceKey, value: &str) -> Result<()> {
    match key {
        AllowanceKey::AdditionalTimeGranted => {
            let digits_only = !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit());
            if digits_only && value.parse::<i32>().is_ok() {
                Ok(())
            } else {
                Err(Error::InvalidAllowanceValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
        }
        AllowanceKey::ReviewPolicyException => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam::{ExamUpdate, NewExam};
    use crate::models::user::NewUser;
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, AllowanceService, i64, i64) {
        let store = Arc::new(MemoryStore::new());
        let user = store
            .insert_user(NewUser {
                username: "ada".into(),
                email: "ada@example.com".into(),
                full_name: None,
            })
            .await
            .unwrap();
        let exam = store
            .insert_exam(NewExam {
                course_id: "course-1".into(),
                content_id: "final".into(),
                external_id: None,
                exam_name: "Final".into(),
                time_limit_mins: 90,
                due_date: None,
                is_proctored: true,
                is_practice_exam: false,
                is_active: true,
                hide_after_due: false,
            })
            .await
            .unwrap();
        let service = AllowanceService::new(store.clone());
        (store, service, exam.id, user.id)
    }

    #[test]
    fn additional_time_must_be_non_negative_integer() {
        let key = AllowanceKey::AdditionalTimeGranted;
        assert!(validate_value(key, "30").is_ok());
        assert!(validate_value(key, "0").is_ok());
        for bad in ["-1", "abc", "", "+5", "1.5", "99999999999"] {
            assert!(
                matches!(validate_value(key, bad), Err(Error::InvalidAllowanceValue { .. })),
                "{} should be rejected",
                bad
            );
        }
        assert!(validate_value(AllowanceKey::ReviewPolicyException, "open notes").is_ok());
    }

    #[tokio::test]
    async fn create_then_update_archives_prior_value() {
        let (_store, service, exam_id, user_id) = setup().await;
        let user = UserRef::Id(user_id);

        let (_, action) = service
            .add_or_update(exam_id, &user, AllowanceKey::AdditionalTimeGranted, "10")
            .await
            .unwrap();
        assert_eq!(action, AllowanceAction::Created);
        assert!(service.history(exam_id, user_id).await.unwrap().is_empty());

        let (allowance, action) = service
            .add_or_update(exam_id, &user, AllowanceKey::AdditionalTimeGranted, "20")
            .await
            .unwrap();
        assert_eq!(action, AllowanceAction::Updated);
        assert_eq!(allowance.value, "20");

        let history = service.history(exam_id, user_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, "10");
        assert_eq!(history[0].allowance_id, allowance.id);
        assert_eq!(
            service.additional_time_minutes(exam_id, user_id).await.unwrap(),
            Some(20)
        );
    }

    #[tokio::test]
    async fn invalid_values_write_nothing() {
        let (_store, service, exam_id, user_id) = setup().await;
        let user = UserRef::Id(user_id);
        service
            .add_or_update(exam_id, &user, AllowanceKey::AdditionalTimeGranted, "10")
            .await
            .unwrap();

        for bad in ["-1", "abc"] {
            let err = service
                .add_or_update(exam_id, &user, AllowanceKey::AdditionalTimeGranted, bad)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidAllowanceValue { .. }));
        }
        assert!(service.history(exam_id, user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolves_users_by_username_or_email() {
        let (_store, service, exam_id, user_id) = setup().await;
        let (allowance, _) = service
            .add_or_update(
                exam_id,
                &UserRef::parse("ada@example.com"),
                AllowanceKey::ReviewPolicyException,
                "calculator allowed",
            )
            .await
            .unwrap();
        assert_eq!(allowance.user_id, user_id);
        assert_eq!(
            service.review_policy_exception(exam_id, user_id).await.unwrap(),
            Some("calculator allowed".to_string())
        );

        let err = service
            .add_or_update(
                exam_id,
                &UserRef::parse("nobody"),
                AllowanceKey::AdditionalTimeGranted,
                "5",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UserNotFound(_)));
    }

    #[tokio::test]
    async fn inactive_exam_rejected() {
        let (store, service, exam_id, user_id) = setup().await;
        store
            .update_exam(
                exam_id,
                ExamUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = service
            .add_or_update(
                exam_id,
                &UserRef::Id(user_id),
                AllowanceKey::AdditionalTimeGranted,
                "5",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExamNotActive(_)));
    }

    #[tokio::test]
    async fn timed_only_filters_out_proctored_exams() {
        let (_store, service, exam_id, user_id) = setup().await;
        service
            .add_or_update(
                exam_id,
                &UserRef::Id(user_id),
                AllowanceKey::AdditionalTimeGranted,
                "5",
            )
            .await
            .unwrap();
        assert_eq!(service.get_for_course("course-1", false).await.unwrap().len(), 1);
        assert!(service.get_for_course("course-1", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_archives_the_row() {
        let (_store, service, exam_id, user_id) = setup().await;
        service
            .add_or_update(
                exam_id,
                &UserRef::Id(user_id),
                AllowanceKey::AdditionalTimeGranted,
                "5",
            )
            .await
            .unwrap();
        let archived = service
            .remove(exam_id, user_id, AllowanceKey::AdditionalTimeGranted)
            .await
            .unwrap();
        assert_eq!(archived.value, "5");
        assert!(service.get_all(exam_id, user_id).await.unwrap().is_empty());
    }
}
