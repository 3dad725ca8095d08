use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{BackendProvider, InterpretedReview};
use crate::error::{Error, Result};
use crate::models::review::{NewReviewComment, ReviewVerdict};

const PASSING_STATUSES: [&str; 2] = ["Clean", "Rules Violation"];
const FAILING_STATUSES: [&str; 2] = ["Suspicious", "Not Reviewed"];

#[derive(Debug, Clone, Deserialize)]
struct Options {
    #[serde(default = "default_true")]
    verify_record_locator: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorComment {
    #[serde(default)]
    comments: String,
    #[serde(default)]
    duration: i32,
    #[serde(default)]
    event_start: i32,
    #[serde(default)]
    event_finish: i32,
    #[serde(default)]
    event_status: String,
}

impl From<VendorComment> for NewReviewComment {
    fn from(c: VendorComment) -> Self {
        NewReviewComment {
            start_time: c.event_start,
            stop_time: c.event_finish,
            duration: c.duration,
            comment_text: c.comments,
            status: c.event_status,
        }
    }
}

pub struct SoftwareSecureProvider {
    name: String,
    verify_record_locator: bool,
}

impl SoftwareSecureProvider {
    pub fn from_options(name: &str, options: &JsonValue) -> Result<Self> {
        let options: Options = if options.is_null() {
            Options {
                verify_record_locator: true,
            }
        } else {
            serde_json::from_value(options.clone()).map_err(|e| {
                Error::Config(format!("invalid options for provider '{}': {}", name, e))
            })?
        };
        Ok(Self {
            name: name.to_string(),
            verify_record_locator: options.verify_record_locator,
        })
    }

    fn comments(raw_payload: &JsonValue, field: &str) -> Result<Vec<NewReviewComment>> {
        match raw_payload.get(field) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(value) => {
                let parsed: Vec<VendorComment> = serde_json::from_value(value.clone())
                    .map_err(|e| Error::ProviderError(format!("malformed {}: {}", field, e)))?;
                Ok(parsed.into_iter().map(Into::into).collect())
            }
        }
    }
}

impl BackendProvider for SoftwareSecureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn interpret_review(&self, raw_payload: &JsonValue) -> Result<InterpretedReview> {
        let status = raw_payload
            .get("reviewStatus")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ProviderError("missing reviewStatus".into()))?;

        let verdict = if PASSING_STATUSES.contains(&status) {
            ReviewVerdict::Verified
        } else if FAILING_STATUSES.contains(&status) {
            ReviewVerdict::Rejected
        } else {
            return Err(Error::ProviderError(format!(
                "unrecognised reviewStatus '{}'",
                status
            )));
        };

        let mut comments = Self::comments(raw_payload, "webCamComments")?;
        comments.extend(Self::comments(raw_payload, "desktopComments")?);

        Ok(InterpretedReview {
            verdict,
            reviewed_by: None,
            comments,
        })
    }

    fn on_review_callback(
        &self,
        attempt_external_id: Option<&str>,
        raw_payload: &JsonValue,
    ) -> Result<()> {
        if !self.verify_record_locator {
            return Ok(());
        }
        let Some(expected) = attempt_external_id else {
            return Ok(());
        };
        let locator = raw_payload
            .pointer("/examMetaData/ssiRecordLocator")
            .and_then(|v| v.as_str());
        if locator != Some(expected) {
            tracing::warn!(provider = %self.name, "review record locator does not match attempt");
            return Err(Error::ProviderError(
                "record locator does not match attempt".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> SoftwareSecureProvider {
        SoftwareSecureProvider::from_options("software_secure", &JsonValue::Null).unwrap()
    }

    fn payload(status: &str) -> JsonValue {
        json!({
            "examDate": "Jun 17 2024 10:00AM",
            "examProcessingStatus": "Review Completed",
            "examMetaData": {
                "examCode": "4d07a01a-1502-422e-b943-93ac04dc6ced",
                "ssiRecordLocator": "rec-991",
                "reviewedExam": true
            },
            "reviewStatus": status,
            "videoReviewLink": "http://video.example/1",
            "desktopComments": [
                {
                    "comments": "Browsing other sites",
                    "duration": 88,
                    "eventFinish": 88,
                    "eventStart": 12,
                    "eventStatus": "Suspicious"
                }
            ],
            "webCamComments": [
                {
                    "comments": "Second person in frame",
                    "duration": 5,
                    "eventFinish": 125,
                    "eventStart": 120,
                    "eventStatus": "Suspicious"
                }
            ]
        })
    }

    #[test]
    fn maps_vendor_statuses_to_verdicts() {
        let p = provider();
        assert_eq!(
            p.interpret_review(&payload("Clean")).unwrap().verdict,
            ReviewVerdict::Verified
        );
        assert_eq!(
            p.interpret_review(&payload("Rules Violation")).unwrap().verdict,
            ReviewVerdict::Verified
        );
        assert_eq!(
            p.interpret_review(&payload("Suspicious")).unwrap().verdict,
            ReviewVerdict::Rejected
        );
        assert_eq!(
            p.interpret_review(&payload("Not Reviewed")).unwrap().verdict,
            ReviewVerdict::Rejected
        );
    }

    #[test]
    fn collects_webcam_then_desktop_comments() {
        let review = provider().interpret_review(&payload("Suspicious")).unwrap();
        assert_eq!(review.comments.len(), 2);
        assert_eq!(review.comments[0].comment_text, "Second person in frame");
        assert_eq!(review.comments[1].start_time, 12);
        assert_eq!(review.comments[1].stop_time, 88);
    }

    #[test]
    fn rejects_unknown_or_missing_status() {
        let p = provider();
        assert!(matches!(
            p.interpret_review(&payload("Maybe")),
            Err(Error::ProviderError(_))
        ));
        assert!(matches!(
            p.interpret_review(&json!({"examMetaData": {}})),
            Err(Error::ProviderError(_))
        ));
    }

    #[test]
    fn record_locator_must_match_external_id() {
        let p = provider();
        assert!(p.on_review_callback(Some("rec-991"), &payload("Clean")).is_ok());
        assert!(p.on_review_callback(None, &payload("Clean")).is_ok());
        assert!(matches!(
            p.on_review_callback(Some("rec-000"), &payload("Clean")),
            Err(Error::ProviderError(_))
        ));

        let lenient = SoftwareSecureProvider::from_options(
            "software_secure",
            &json!({"verify_record_locator": false}),
        )
        .unwrap();
        assert!(lenient
            .on_review_callback(Some("rec-000"), &payload("Clean"))
            .is_ok());
    }
}
