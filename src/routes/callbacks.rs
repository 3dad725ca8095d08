//! Unauthenticated vendor-facing endpoints. Failures carry only a stable
//! `reason` string; details go to the log.

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
};

use crate::dto::callback_dto::{RejectionResponse, ReviewReceivedResponse, StatusResponse};
use crate::error::Error;
use crate::providers::attempt_code_in;
use crate::AppState;

#[derive(Debug)]
pub struct CallbackRejection(Error);

impl From<Error> for CallbackRejection {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for CallbackRejection {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, reason = self.0.reason(), "callback rejected");
        let body = RejectionResponse {
            reason: self.0.reason().to_string(),
        };
        (self.0.status_code(), Json(body)).into_response()
    }
}

type CallbackResult<T> = std::result::Result<T, CallbackRejection>;

#[axum::debug_handler]
pub async fn attempt_status(
    State(state): State<AppState>,
    Path(attempt_code): Path<String>,
) -> CallbackResult<Json<StatusResponse>> {
    let status = state.review_service.status_of(&attempt_code).await?;
    Ok(Json(StatusResponse { status }))
}

#[axum::debug_handler]
pub async fn attempt_ready(
    State(state): State<AppState>,
    Path(attempt_code): Path<String>,
) -> CallbackResult<Json<StatusResponse>> {
    let status = state.attempt_service.mark_ready(&attempt_code).await?;
    Ok(Json(StatusResponse { status }))
}

#[axum::debug_handler]
pub async fn review_callback(
    State(state): State<AppState>,
    body: Bytes,
) -> CallbackResult<Json<ReviewReceivedResponse>> {
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(Error::from)?;
    let attempt_code = attempt_code_in(&payload)
        .ok_or_else(|| Error::BadRequest("attempt code missing from payload".into()))?;

    state.review_service.ingest(&attempt_code, payload).await?;
    Ok(Json(ReviewReceivedResponse { received: true }))
}
