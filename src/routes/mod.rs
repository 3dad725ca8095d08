pub mod admin;
pub mod callbacks;
pub mod health;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::AppState;

/// Vendor-facing endpoints. No authentication; rate limited by the caller.
pub fn callback_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/proctoring/attempts/:code/status",
            get(callbacks::attempt_status),
        )
        .route(
            "/api/proctoring/attempts/:code/ready",
            post(callbacks::attempt_ready),
        )
        .route("/api/proctoring/reviews", post(callbacks::review_callback))
}

/// Administrative endpoints. Callers wrap these in the secret check.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/api/admin/users", post(admin::create_user))
        .route("/api/admin/exams", post(admin::create_exam))
        .route(
            "/api/admin/exams/:id",
            get(admin::get_exam).patch(admin::update_exam),
        )
        .route(
            "/api/admin/exams/:id/params",
            get(admin::get_exam_params).put(admin::put_exam_params),
        )
        .route("/api/admin/exams/:id/allowances", put(admin::put_allowance))
        .route(
            "/api/admin/exams/:id/allowances/:user_id",
            get(admin::list_allowances),
        )
        .route(
            "/api/admin/exams/:id/allowance-history/:user_id",
            get(admin::allowance_history),
        )
        .route(
            "/api/admin/exams/:id/allowances/:user_id/:key",
            axum::routing::delete(admin::delete_allowance),
        )
        .route(
            "/api/admin/courses/:course_id/allowances",
            get(admin::course_allowances),
        )
        .route(
            "/api/admin/exams/:id/review-policy",
            get(admin::get_review_policy)
                .put(admin::set_review_policy)
                .delete(admin::delete_review_policy),
        )
        .route(
            "/api/admin/exams/:id/review-policy/history",
            get(admin::review_policy_history),
        )
        .route(
            "/api/admin/review-policy-history/:id",
            axum::routing::delete(admin::delete_review_policy_history),
        )
        .route("/api/admin/attempts", post(admin::create_attempt))
        .route(
            "/api/admin/attempts/:id",
            get(admin::get_attempt).delete(admin::delete_attempt),
        )
        .route(
            "/api/admin/attempts/:id/transition",
            post(admin::transition_attempt),
        )
        .route(
            "/api/admin/attempts/:id/acknowledge",
            post(admin::acknowledge_attempt),
        )
        .route(
            "/api/admin/attempts/:id/history",
            get(admin::attempt_history),
        )
        .route("/api/admin/reviews/:code", get(admin::get_review))
}
