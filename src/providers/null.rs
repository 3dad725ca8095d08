use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{BackendProvider, InterpretedReview};
use crate::error::{Error, Result};
use crate::models::review::{NewReviewComment, ReviewVerdict};

/// Adapter for payloads that already carry a normalised verdict. Used when no
/// external vendor is attached, and in development.
pub struct NullProvider {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NormalisedPayload {
    review_status: ReviewVerdict,
    #[serde(default)]
    reviewed_by: Option<String>,
    #[serde(default)]
    comments: Vec<NewReviewComment>,
}

impl NullProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl BackendProvider for NullProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn interpret_review(&self, raw_payload: &JsonValue) -> Result<InterpretedReview> {
        let parsed: NormalisedPayload = serde_json::from_value(raw_payload.clone())
            .map_err(|e| Error::ProviderError(format!("malformed review payload: {}", e)))?;
        Ok(InterpretedReview {
            verdict: parsed.review_status,
            reviewed_by: parsed.reviewed_by,
            comments: parsed.comments,
        })
    }

    fn on_review_callback(&self, _: Option<&str>, _: &JsonValue) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_normalised_payload() {
        let review = NullProvider::new("null")
            .interpret_review(&json!({
                "attempt_code": "C1",
                "review_status": "second_review_required",
                "reviewed_by": "proctor@example.com",
                "comments": [{
                    "start_time": 1, "stop_time": 4, "duration": 3,
                    "comment_text": "looked away", "status": "Suspicious"
                }]
            }))
            .unwrap();
        assert_eq!(review.verdict, ReviewVerdict::SecondReviewRequired);
        assert_eq!(review.reviewed_by.as_deref(), Some("proctor@example.com"));
        assert_eq!(review.comments.len(), 1);
    }

    #[test]
    fn unknown_verdict_is_provider_error() {
        let err = NullProvider::new("null")
            .interpret_review(&json!({"review_status": "passed"}))
            .unwrap_err();
        assert!(matches!(err, Error::ProviderError(_)));
    }
}
