use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::config::ProctoringSettings;
use crate::error::{Error, Result};
use crate::models::attempt::AttemptStatus;
use crate::models::review::{NewReview, Review, ReviewComment, ReviewHistory, ReviewVerdict};
use crate::providers::ProviderRegistry;
use crate::services::attempt_service::AttemptService;
use crate::store::EntityStore;

/// Where an attempt code currently resolves.
struct ResolvedAttempt {
    live_id: Option<i64>,
    status: AttemptStatus,
    user_id: i64,
    exam_id: i64,
    external_id: Option<String>,
    provider_name: Option<String>,
}

/// Records third-party review verdicts and applies them to attempts.
#[derive(Clone)]
pub struct ReviewService {
    store: Arc<dyn EntityStore>,
    attempts: AttemptService,
    providers: Arc<ProviderRegistry>,
    settings: Arc<ProctoringSettings>,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        attempts: AttemptService,
        providers: Arc<ProviderRegistry>,
        settings: Arc<ProctoringSettings>,
    ) -> Self {
        Self {
            store,
            attempts,
            providers,
            settings,
        }
    }

    /// Bare status for an attempt code, falling back to the last archived
    /// state when the attempt has been deleted.
    pub async fn status_of(&self, attempt_code: &str) -> Result<AttemptStatus> {
        Ok(self.resolve(attempt_code).await?.status)
    }

    pub async fn ingest(&self, attempt_code: &str, raw_payload: JsonValue) -> Result<Review> {
        let attempt = self.resolve(attempt_code).await?;
        let provider = self
            .providers
            .get(attempt.provider_name.as_deref(), false)?;

        provider.on_review_callback(attempt.external_id.as_deref(), &raw_payload)?;
        let interpreted = provider.interpret_review(&raw_payload)?;

        let allow_replace = self.settings.allow_review_updates_for(provider.name());
        let stored = self
            .store
            .put_review(
                NewReview {
                    attempt_code: attempt_code.to_string(),
                    review_status: interpreted.verdict,
                    raw_payload,
                    reviewed_by: interpreted.reviewed_by,
                    student_id: Some(attempt.user_id),
                    exam_id: Some(attempt.exam_id),
                },
                interpreted.comments,
                allow_replace,
            )
            .await?;
        tracing::info!(
            attempt_code,
            provider = provider.name(),
            verdict = interpreted.verdict.as_str(),
            superseded = stored.superseded.is_some(),
            "review recorded"
        );

        match attempt.live_id {
            Some(attempt_id) => {
                let status = self.effective_status(interpreted.verdict);
                self.apply_status(attempt_id, attempt.status, status).await?;
            }
            None => {
                tracing::warn!(attempt_code, "review recorded for a deleted attempt; status not applied");
            }
        }
        Ok(stored.review)
    }

    pub async fn get(&self, attempt_code: &str) -> Result<Option<Review>> {
        self.store.find_review(attempt_code).await
    }

    pub async fn comments(&self, review_id: i64) -> Result<Vec<ReviewComment>> {
        self.store.review_comments(review_id).await
    }

    pub async fn history(&self, attempt_code: &str) -> Result<Vec<ReviewHistory>> {
        self.store.review_history(attempt_code).await
    }

    fn effective_status(&self, verdict: ReviewVerdict) -> AttemptStatus {
        if verdict == ReviewVerdict::Rejected && self.settings.require_failure_second_reviews {
            AttemptStatus::SecondReviewRequired
        } else {
            verdict.attempt_status()
        }
    }

    async fn apply_status(
        &self,
        attempt_id: i64,
        current: AttemptStatus,
        status: AttemptStatus,
    ) -> Result<()> {
        if current.awaits_review() {
            self.attempts.apply_review_verdict(attempt_id, status).await?;
        } else if !current.is_terminal() {
            self.attempts.transition(attempt_id, status).await?;
        } else {
            tracing::warn!(attempt_id, %current, "attempt is closed; review verdict not applied");
        }
        Ok(())
    }

    async fn resolve(&self, attempt_code: &str) -> Result<ResolvedAttempt> {
        if let Some(a) = self.store.find_attempt_by_code(attempt_code).await? {
            return Ok(ResolvedAttempt {
                live_id: Some(a.id),
                status: a.status,
                user_id: a.user_id,
                exam_id: a.exam_id,
                external_id: a.external_id,
                provider_name: a.provider_name,
            });
        }
        let last = self
            .store
            .attempt_history_by_code(attempt_code)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AttemptNotFound(attempt_code.to_string()))?;
        Ok(ResolvedAttempt {
            live_id: None,
            status: last.status,
            user_id: last.user_id,
            exam_id: last.exam_id,
            external_id: last.external_id,
            provider_name: last.provider_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::NewAttempt;
    use crate::models::exam::NewExam;
    use crate::services::credit::StoreCreditRequirements;
    use crate::services::notification_service::{BroadcastPublisher, NotificationService};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;

    struct Fixture {
        store: Arc<MemoryStore>,
        attempts: AttemptService,
        reviews: ReviewService,
    }

    fn fixture(settings: ProctoringSettings) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifications =
            NotificationService::new(Arc::new(BroadcastPublisher::new(8)), HashSet::new());
        let attempts = AttemptService::new(
            store.clone(),
            Arc::new(StoreCreditRequirements::new(store.clone())),
            notifications,
        );
        let providers = Arc::new(ProviderRegistry::new(&settings));
        let reviews = ReviewService::new(
            store.clone(),
            attempts.clone(),
            providers,
            Arc::new(settings),
        );
        Fixture {
            store,
            attempts,
            reviews,
        }
    }

    async fn submitted_attempt(f: &Fixture, code: &str) -> i64 {
        let exam = f
            .store
            .insert_exam(NewExam {
                course_id: "course-1".into(),
                content_id: format!("exam-{}", code),
                external_id: None,
                exam_name: "Final".into(),
                time_limit_mins: 60,
                due_date: None,
                is_proctored: true,
                is_practice_exam: false,
                is_active: true,
                hide_after_due: false,
            })
            .await
            .unwrap();
        let attempt = f
            .attempts
            .create(NewAttempt {
                exam_id: exam.id,
                user_id: 42,
                student_name: "Ada".into(),
                allowed_time_limit_mins: 60,
                attempt_code: code.into(),
                taking_as_proctored: true,
                is_sample_attempt: false,
                external_id: None,
                provider_name: Some("null".into()),
                review_policy_id: None,
            })
            .await
            .unwrap();
        f.attempts
            .transition(attempt.id, AttemptStatus::Submitted)
            .await
            .unwrap();
        attempt.id
    }

    fn payload(status: &str) -> JsonValue {
        json!({
            "attempt_code": "abc",
            "review_status": status,
            "comments": [{
                "start_time": 0, "stop_time": 10, "duration": 10,
                "comment_text": status, "status": "info"
            }]
        })
    }

    #[tokio::test]
    async fn re_ingestion_supersedes_previous_review() {
        let f = fixture(ProctoringSettings::default());
        let attempt_id = submitted_attempt(&f, "abc").await;

        let first = f.reviews.ingest("abc", payload("verified")).await.unwrap();
        assert_eq!(first.review_status, ReviewVerdict::Verified);
        assert_eq!(
            f.attempts.get(attempt_id).await.unwrap().status,
            AttemptStatus::Verified
        );

        let second = f
            .reviews
            .ingest("abc", payload("second_review_required"))
            .await
            .unwrap();
        assert_eq!(second.review_status, ReviewVerdict::SecondReviewRequired);

        let live = f.reviews.get("abc").await.unwrap().unwrap();
        assert_eq!(live.review_status, ReviewVerdict::SecondReviewRequired);
        let history = f.reviews.history("abc").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].review_status, ReviewVerdict::Verified);
        assert_eq!(
            f.reviews.comments(live.id).await.unwrap()[0].comment_text,
            "second_review_required"
        );
        assert_eq!(
            f.attempts.get(attempt_id).await.unwrap().status,
            AttemptStatus::SecondReviewRequired
        );
    }

    #[tokio::test]
    async fn rejection_escalates_to_second_review_when_required() {
        let f = fixture(ProctoringSettings::default());
        let attempt_id = submitted_attempt(&f, "abc").await;
        f.reviews.ingest("abc", payload("rejected")).await.unwrap();
        assert_eq!(
            f.attempts.get(attempt_id).await.unwrap().status,
            AttemptStatus::SecondReviewRequired
        );

        let settings = ProctoringSettings {
            require_failure_second_reviews: false,
            ..Default::default()
        };
        let f = fixture(settings);
        let attempt_id = submitted_attempt(&f, "abc").await;
        f.reviews.ingest("abc", payload("rejected")).await.unwrap();
        assert_eq!(
            f.attempts.get(attempt_id).await.unwrap().status,
            AttemptStatus::Rejected
        );
    }

    #[tokio::test]
    async fn unknown_code_creates_nothing() {
        let f = fixture(ProctoringSettings::default());
        let err = f
            .reviews
            .ingest("unknown-code", payload("verified"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttemptNotFound(_)));
        assert!(f.reviews.get("unknown-code").await.unwrap().is_none());
        assert!(matches!(
            f.reviews.status_of("unknown-code").await,
            Err(Error::AttemptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn updates_refused_when_disallowed() {
        let settings = ProctoringSettings {
            allow_review_updates: false,
            ..Default::default()
        };
        let f = fixture(settings);
        submitted_attempt(&f, "abc").await;
        f.reviews.ingest("abc", payload("verified")).await.unwrap();
        let err = f
            .reviews
            .ingest("abc", payload("rejected"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReviewAlreadyExists(_)));
        assert!(f.reviews.history("abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_reviews_record_only_one_when_updates_disallowed() {
        let settings = ProctoringSettings {
            allow_review_updates: false,
            ..Default::default()
        };
        let f = fixture(settings);
        submitted_attempt(&f, "abc").await;

        let handles: Vec<_> = ["verified", "rejected"]
            .into_iter()
            .map(|status| {
                let reviews = f.reviews.clone();
                tokio::spawn(async move { reviews.ingest("abc", payload(status)).await })
            })
            .collect();
        let mut recorded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => recorded += 1,
                Err(err) => assert!(matches!(err, Error::ReviewAlreadyExists(_))),
            }
        }
        assert_eq!(recorded, 1);
        assert!(f.reviews.history("abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_attempt_still_reports_and_records() {
        let f = fixture(ProctoringSettings::default());
        let attempt_id = submitted_attempt(&f, "abc").await;
        f.attempts.delete(attempt_id).await.unwrap();

        assert_eq!(
            f.reviews.status_of("abc").await.unwrap(),
            AttemptStatus::Submitted
        );
        let review = f.reviews.ingest("abc", payload("verified")).await.unwrap();
        assert_eq!(review.student_id, Some(42));
        assert!(f.store.find_attempt(attempt_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_provider_error() {
        let f = fixture(ProctoringSettings::default());
        submitted_attempt(&f, "abc").await;
        let err = f
            .reviews
            .ingest("abc", json!({"review_status": 7}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderError(_)));
        assert!(f.reviews.get("abc").await.unwrap().is_none());
    }
}
