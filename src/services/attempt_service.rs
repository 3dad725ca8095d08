use chrono::{Duration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::allowance::AllowanceKey;
use crate::models::attempt::{Attempt, AttemptChange, AttemptHistory, AttemptStatus, NewAttempt};
use crate::models::exam::Exam;
use crate::services::credit::CreditRequirements;
use crate::services::notification_service::NotificationService;
use crate::store::EntityStore;
use crate::utils::token::generate_attempt_code;

/// Attempt status state machine. Every write goes through the store's
/// archival-aware update path; notifications run only after the write commits.
#[derive(Clone)]
pub struct AttemptService {
    store: Arc<dyn EntityStore>,
    credit: Arc<dyn CreditRequirements>,
    notifications: NotificationService,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        credit: Arc<dyn CreditRequirements>,
        notifications: NotificationService,
    ) -> Self {
        Self {
            store,
            credit,
            notifications,
        }
    }

    pub async fn create(&self, attempt: NewAttempt) -> Result<Attempt> {
        self.store
            .find_exam(attempt.exam_id)
            .await?
            .ok_or(Error::ExamNotFound(attempt.exam_id))?;

        let created = self.store.insert_attempt(attempt).await?;
        tracing::info!(
            attempt_id = created.id,
            exam_id = created.exam_id,
            user_id = created.user_id,
            "attempt created"
        );
        Ok(created)
    }

    pub async fn get(&self, attempt_id: i64) -> Result<Attempt> {
        self.store
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| Error::AttemptNotFound(attempt_id.to_string()))
    }

    pub async fn get_by_code(&self, attempt_code: &str) -> Result<Attempt> {
        self.store
            .find_attempt_by_code(attempt_code)
            .await?
            .ok_or_else(|| Error::AttemptNotFound(attempt_code.to_string()))
    }

    pub async fn history(&self, attempt_id: i64) -> Result<Vec<AttemptHistory>> {
        self.store.attempt_history(attempt_id).await
    }

    pub async fn transition(&self, attempt_id: i64, to_status: AttemptStatus) -> Result<Attempt> {
        let updated = self.apply_transition(attempt_id, to_status).await?;
        if to_status == AttemptStatus::Declined {
            self.cascade_decline(&updated).await;
        }
        Ok(updated)
    }

    async fn apply_transition(&self, attempt_id: i64, to_status: AttemptStatus) -> Result<Attempt> {
        let current = self.get(attempt_id).await?;
        if current.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: to_status.to_string(),
            });
        }

        let now = Utc::now();
        let mut change = AttemptChange::status(to_status);
        if to_status == AttemptStatus::Started && current.started_at.is_none() {
            change.started_at = Some(now);
        }
        if to_status.is_terminal() && current.completed_at.is_none() {
            change.completed_at = Some(now);
        }

        let updated = self
            .store
            .update_attempt(attempt_id, current.status, change)
            .await?;
        tracing::info!(
            attempt_id,
            from = %current.status,
            to = %to_status,
            "attempt status changed"
        );

        if to_status.affects_credit() {
            self.notify_credit_status(&updated).await;
        }
        Ok(updated)
    }

    /// Applies a reviewer's verdict. Unlike `transition` this may move an
    /// attempt that is already completed, but only among the review statuses.
    pub async fn apply_review_verdict(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
    ) -> Result<Attempt> {
        let current = self.get(attempt_id).await?;
        if !current.status.awaits_review() || !status.awaits_review() {
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        if current.status == status {
            return Ok(current);
        }

        let updated = self
            .store
            .update_attempt(attempt_id, current.status, AttemptChange::status(status))
            .await?;
        tracing::info!(
            attempt_id,
            from = %current.status,
            to = %status,
            "review verdict applied"
        );
        if status.affects_credit() {
            self.notify_credit_status(&updated).await;
        }
        Ok(updated)
    }

    /// Marks the attempt ready once the vendor software has finished setup.
    /// Returns the resulting status; attempts past setup are left untouched.
    pub async fn mark_ready(&self, attempt_code: &str) -> Result<AttemptStatus> {
        let attempt = self.get_by_code(attempt_code).await?;
        match attempt.status {
            AttemptStatus::Created | AttemptStatus::DownloadSoftwareClicked => {
                let updated = self
                    .apply_transition(attempt.id, AttemptStatus::ReadyToStart)
                    .await?;
                Ok(updated.status)
            }
            status => Ok(status),
        }
    }

    /// Sets the acknowledgement flag. Archived as a plain update.
    pub async fn acknowledge_status(&self, attempt_id: i64) -> Result<Attempt> {
        let current = self.get(attempt_id).await?;
        if current.is_status_acknowledged {
            return Ok(current);
        }
        let change = AttemptChange {
            is_status_acknowledged: Some(true),
            ..Default::default()
        };
        self.store
            .update_attempt(attempt_id, current.status, change)
            .await
    }

    pub async fn delete(&self, attempt_id: i64) -> Result<AttemptHistory> {
        let current = self.get(attempt_id).await?;
        let archived = self
            .store
            .delete_attempt(attempt_id, current.status)
            .await?;
        tracing::info!(
            attempt_id,
            attempt_code = %archived.attempt_code,
            "attempt deleted"
        );
        Ok(archived)
    }

    /// Exam time limit plus any additional-time allowance.
    pub async fn allowed_time_limit(&self, exam: &Exam, user_id: i64) -> Result<i32> {
        let extra = self
            .store
            .find_allowance(exam.id, user_id, AllowanceKey::AdditionalTimeGranted)
            .await?
            .and_then(|a| a.value.parse::<i32>().ok())
            .unwrap_or(0);
        Ok(exam.time_limit_mins.saturating_add(extra))
    }

    /// Deletes attempts stuck in `created` for longer than `max_age`.
    pub async fn delete_stale_created(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let stale = self
            .store
            .list_stale_attempts(AttemptStatus::Created, cutoff)
            .await?;

        let mut deleted = 0;
        for attempt in stale {
            match self
                .store
                .delete_attempt(attempt.id, AttemptStatus::Created)
                .await
            {
                Ok(_) => deleted += 1,
                Err(e) => tracing::warn!(attempt_id = attempt.id, error = %e, "stale attempt not deleted"),
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "stale created attempts removed");
        }
        Ok(deleted)
    }

    /// Declines the learner's pending credit exams in the same course. Each
    /// step is its own archived transition; a failing step is logged and the
    /// remaining siblings are still processed.
    async fn cascade_decline(&self, declined: &Attempt) {
        if let Err(e) = self.try_cascade_decline(declined).await {
            tracing::warn!(attempt_id = declined.id, error = %e, "declined cascade aborted");
        }
    }

    async fn try_cascade_decline(&self, declined: &Attempt) -> Result<()> {
        let Some(exam) = self.store.find_exam(declined.exam_id).await? else {
            return Ok(());
        };
        let siblings = self.store.list_course_exams(&exam.course_id).await?;

        for sibling in siblings.iter().filter(|e| e.id != exam.id) {
            if !self.credit.requires_credit(sibling).await?
                || !self.credit.not_yet_attempted(sibling, declined.user_id).await?
            {
                continue;
            }
            if let Err(e) = self.decline_sibling(sibling, declined).await {
                tracing::warn!(
                    exam_id = sibling.id,
                    user_id = declined.user_id,
                    error = %e,
                    "cascade decline step failed"
                );
            }
        }
        Ok(())
    }

    async fn decline_sibling(&self, exam: &Exam, source: &Attempt) -> Result<()> {
        let attempt = match self.store.find_attempt_for(exam.id, source.user_id).await? {
            Some(existing) if existing.status.is_terminal() => return Ok(()),
            Some(existing) => existing,
            None => {
                let allowed_time_limit_mins = self.allowed_time_limit(exam, source.user_id).await?;
                self.store
                    .insert_attempt(NewAttempt {
                        exam_id: exam.id,
                        user_id: source.user_id,
                        student_name: source.student_name.clone(),
                        allowed_time_limit_mins,
                        attempt_code: generate_attempt_code(),
                        taking_as_proctored: true,
                        is_sample_attempt: false,
                        external_id: None,
                        provider_name: source.provider_name.clone(),
                        review_policy_id: None,
                    })
                    .await?
            }
        };

        self.apply_transition(attempt.id, AttemptStatus::Declined)
            .await?;
        tracing::info!(
            attempt_id = attempt.id,
            source_attempt_id = source.id,
            "attempt declined by cascade"
        );
        Ok(())
    }

    async fn notify_credit_status(&self, attempt: &Attempt) {
        let mut event = Map::new();
        event.insert("event_type".into(), json!("credit_status_update"));
        event.insert("attempt_id".into(), json!(attempt.id));
        event.insert("attempt_code".into(), json!(attempt.attempt_code));
        event.insert("exam_id".into(), json!(attempt.exam_id));
        event.insert("user_id".into(), json!(attempt.user_id));
        event.insert("status".into(), json!(attempt.status));
        event.insert(
            "provider".into(),
            attempt
                .provider_name
                .clone()
                .map_or(JsonValue::Null, JsonValue::String),
        );

        if let Err(e) = self
            .notifications
            .publish(event, attempt.provider_name.as_deref())
            .await
        {
            tracing::warn!(attempt_id = attempt.id, error = %e, "credit status notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::exam::NewExam;
    use crate::services::credit::StoreCreditRequirements;
    use crate::models::attempt::ChangeKind;
    use crate::services::notification_service::{
        BroadcastPublisher, MockEventPublisher, RetryPolicy,
    };
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    struct Fixture {
        store: Arc<MemoryStore>,
        service: AttemptService,
        events: tokio::sync::broadcast::Receiver<JsonValue>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let publisher = BroadcastPublisher::new(32);
        let events = publisher.subscribe();
        let notifications =
            NotificationService::new(Arc::new(publisher), HashSet::from(["null".to_string()]))
                .with_retry(RetryPolicy::immediate(1));
        let service = AttemptService::new(
            store.clone(),
            Arc::new(StoreCreditRequirements::new(store.clone())),
            notifications,
        );
        Fixture {
            store,
            service,
            events,
        }
    }

    fn new_exam(content_id: &str) -> NewExam {
        NewExam {
            course_id: "course-v1:Org+CS101+2024".into(),
            content_id: content_id.into(),
            external_id: None,
            exam_name: format!("Exam {}", content_id),
            time_limit_mins: 60,
            due_date: None,
            is_proctored: true,
            is_practice_exam: false,
            is_active: true,
            hide_after_due: false,
        }
    }

    fn new_attempt(exam_id: i64, user_id: i64, code: &str) -> NewAttempt {
        NewAttempt {
            exam_id,
            user_id,
            student_name: "Ada".into(),
            allowed_time_limit_mins: 60,
            attempt_code: code.into(),
            taking_as_proctored: true,
            is_sample_attempt: false,
            external_id: None,
            provider_name: Some("null".into()),
            review_policy_id: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_archives_pre_transition_rows() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 42, "code-1")).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Created);
        assert!(f.service.history(attempt.id).await.unwrap().is_empty());

        let started = f
            .service
            .transition(attempt.id, AttemptStatus::Started)
            .await
            .unwrap();
        assert_eq!(started.status, AttemptStatus::Started);
        assert!(started.started_at.is_some());
        let history = f.service.history(attempt.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttemptStatus::Created);

        let declined = f
            .service
            .transition(attempt.id, AttemptStatus::Declined)
            .await
            .unwrap();
        assert_eq!(declined.status, AttemptStatus::Declined);
        let history = f.service.history(attempt.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AttemptStatus::Started);

        let err = f
            .service
            .transition(attempt.id, AttemptStatus::Started)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(f.service.history(attempt.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminal_statuses_reject_every_transition() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let terminal: Vec<_> = AttemptStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();

        for (user_id, status) in terminal.iter().enumerate() {
            let attempt = f
                .service
                .create(new_attempt(exam.id, user_id as i64, &format!("t-{}", user_id)))
                .await
                .unwrap();
            f.service.transition(attempt.id, *status).await.unwrap();
            for target in AttemptStatus::ALL {
                let err = f.service.transition(attempt.id, target).await.unwrap_err();
                assert!(matches!(err, Error::InvalidTransition { .. }));
            }
        }
    }

    #[tokio::test]
    async fn duplicate_attempt_rejected() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        f.service.create(new_attempt(exam.id, 42, "a")).await.unwrap();
        let err = f
            .service
            .create(new_attempt(exam.id, 42, "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAttempt { .. }));
    }

    #[tokio::test]
    async fn decline_cascades_to_pending_siblings() {
        let f = fixture();
        let first = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let second = f.store.insert_exam(new_exam("block-2")).await.unwrap();
        let untouched = f.store.insert_exam(new_exam("block-3")).await.unwrap();
        let mut practice = new_exam("block-4");
        practice.is_practice_exam = true;
        let practice = f.store.insert_exam(practice).await.unwrap();

        let a1 = f.service.create(new_attempt(first.id, 42, "c1")).await.unwrap();
        let a2 = f.service.create(new_attempt(second.id, 42, "c2")).await.unwrap();
        f.service
            .transition(a1.id, AttemptStatus::Eligible)
            .await
            .unwrap();
        f.service
            .transition(a2.id, AttemptStatus::Eligible)
            .await
            .unwrap();

        f.service
            .transition(a1.id, AttemptStatus::Declined)
            .await
            .unwrap();

        let sibling = f.service.get(a2.id).await.unwrap();
        assert_eq!(sibling.status, AttemptStatus::Declined);
        let history = f.service.history(a2.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AttemptStatus::Eligible);
        assert_eq!(history[1].status, AttemptStatus::Created);

        let created = f
            .store
            .find_attempt_for(untouched.id, 42)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.status, AttemptStatus::Declined);
        assert!(f
            .store
            .find_attempt_for(practice.id, 42)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn started_sibling_is_not_declined() {
        let f = fixture();
        let first = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let second = f.store.insert_exam(new_exam("block-2")).await.unwrap();
        let a1 = f.service.create(new_attempt(first.id, 7, "s1")).await.unwrap();
        let a2 = f.service.create(new_attempt(second.id, 7, "s2")).await.unwrap();
        f.service
            .transition(a2.id, AttemptStatus::Started)
            .await
            .unwrap();

        f.service
            .transition(a1.id, AttemptStatus::Declined)
            .await
            .unwrap();
        assert_eq!(
            f.service.get(a2.id).await.unwrap().status,
            AttemptStatus::Started
        );
    }

    #[tokio::test]
    async fn credit_statuses_emit_notifications() {
        let mut f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "n1")).await.unwrap();

        f.service
            .transition(attempt.id, AttemptStatus::Started)
            .await
            .unwrap();
        assert!(f.events.try_recv().is_err());

        f.service
            .transition(attempt.id, AttemptStatus::Submitted)
            .await
            .unwrap();
        let event = f.events.try_recv().unwrap();
        assert_eq!(event["event_type"], "credit_status_update");
        assert_eq!(event["status"], "submitted");
        assert_eq!(event["attempt_code"], "n1");
    }

    #[tokio::test]
    async fn review_verdict_moves_between_review_statuses_only() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "r1")).await.unwrap();

        let err = f
            .service
            .apply_review_verdict(attempt.id, AttemptStatus::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        f.service
            .transition(attempt.id, AttemptStatus::Submitted)
            .await
            .unwrap();
        let verified = f
            .service
            .apply_review_verdict(attempt.id, AttemptStatus::Verified)
            .await
            .unwrap();
        assert_eq!(verified.status, AttemptStatus::Verified);
        assert_eq!(f.service.history(attempt.id).await.unwrap().len(), 2);

        let again = f
            .service
            .apply_review_verdict(attempt.id, AttemptStatus::Verified)
            .await
            .unwrap();
        assert_eq!(again.status, AttemptStatus::Verified);
        assert_eq!(f.service.history(attempt.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn acknowledge_is_archived_as_update() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "k1")).await.unwrap();

        let acked = f.service.acknowledge_status(attempt.id).await.unwrap();
        assert!(acked.is_status_acknowledged);
        assert_eq!(acked.status, AttemptStatus::Created);

        let history = f.service.history(attempt.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].change_kind,
            crate::models::attempt::ChangeKind::Update
        );
        assert!(!history[0].is_status_acknowledged);
    }

    #[tokio::test]
    async fn mark_ready_only_moves_setup_statuses() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "m1")).await.unwrap();

        assert_eq!(
            f.service.mark_ready("m1").await.unwrap(),
            AttemptStatus::ReadyToStart
        );
        f.service
            .transition(attempt.id, AttemptStatus::Started)
            .await
            .unwrap();
        assert_eq!(
            f.service.mark_ready("m1").await.unwrap(),
            AttemptStatus::Started
        );
        assert!(matches!(
            f.service.mark_ready("missing").await,
            Err(Error::AttemptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_keeps_code_resolvable_through_history() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "d1")).await.unwrap();

        let archived = f.service.delete(attempt.id).await.unwrap();
        assert_eq!(archived.attempt_id, attempt.id);
        assert!(f.store.find_attempt(attempt.id).await.unwrap().is_none());
        let by_code = f.store.attempt_history_by_code("d1").await.unwrap();
        assert_eq!(by_code.len(), 1);
        assert_eq!(by_code[0].status, AttemptStatus::Created);
    }

    #[tokio::test]
    async fn stale_sweep_only_removes_old_created_attempts() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        f.service.create(new_attempt(exam.id, 1, "old")).await.unwrap();

        assert_eq!(
            f.service
                .delete_stale_created(Duration::hours(12))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            f.service
                .delete_stale_created(Duration::seconds(-1))
                .await
                .unwrap(),
            1
        );
        assert!(f.store.find_attempt_by_code("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_delete_refuses_attempt_started_after_listing() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = f.service.create(new_attempt(exam.id, 1, "late")).await.unwrap();

        let stale = f
            .store
            .list_stale_attempts(AttemptStatus::Created, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        f.service
            .transition(attempt.id, AttemptStatus::Started)
            .await
            .unwrap();

        let err = f
            .store
            .delete_attempt(attempt.id, AttemptStatus::Created)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(_)));

        let live = f.service.get(attempt.id).await.unwrap();
        assert_eq!(live.status, AttemptStatus::Started);
        let history = f.service.history(attempt.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_kind, ChangeKind::StatusChange);
    }

    #[tokio::test]
    async fn failed_notification_keeps_transition_committed() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .times(2)
            .returning(|_| Err(Error::Internal("broker unavailable".into())));
        let notifications =
            NotificationService::new(Arc::new(publisher), HashSet::from(["null".to_string()]))
                .with_retry(RetryPolicy::immediate(2));
        let service = AttemptService::new(
            store.clone(),
            Arc::new(StoreCreditRequirements::new(store.clone())),
            notifications,
        );
        let exam = store.insert_exam(new_exam("block-1")).await.unwrap();
        let attempt = service.create(new_attempt(exam.id, 7, "n1")).await.unwrap();

        let submitted = service
            .transition(attempt.id, AttemptStatus::Submitted)
            .await
            .unwrap();
        assert_eq!(submitted.status, AttemptStatus::Submitted);
        assert_eq!(
            store.find_attempt(attempt.id).await.unwrap().unwrap().status,
            AttemptStatus::Submitted
        );
        assert_eq!(service.history(attempt.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn allowed_time_includes_additional_time() {
        let f = fixture();
        let exam = f.store.insert_exam(new_exam("block-1")).await.unwrap();
        assert_eq!(f.service.allowed_time_limit(&exam, 5).await.unwrap(), 60);

        f.store
            .put_allowance(exam.id, 5, AllowanceKey::AdditionalTimeGranted, "15", None)
            .await
            .unwrap();
        assert_eq!(f.service.allowed_time_limit(&exam, 5).await.unwrap(), 75);
    }
}
