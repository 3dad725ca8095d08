use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::AppState;

pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Admin routes share the platform webhook secret.
pub async fn require_secret(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Err(e) = verify_secret(req.headers(), &state.webhook_secret) {
        return e.into_response();
    }
    next.run(req).await
}

pub fn verify_secret(headers: &HeaderMap, expected: &str) -> Result<()> {
    let Some(header) = headers.get(SECRET_HEADER) else {
        return Err(Error::Unauthorized("missing_webhook_secret".into()));
    };
    let provided = header
        .to_str()
        .map_err(|_| Error::Unauthorized("invalid_secret_header".into()))?;
    if ConstantTimeEq::ct_eq(provided.as_bytes(), expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(Error::Unauthorized("invalid_webhook_secret".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(verify_secret(&headers, "s3cret").is_err());

        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cre"));
        assert!(verify_secret(&headers, "s3cret").is_err());

        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(verify_secret(&headers, "s3cret").is_ok());
    }
}
