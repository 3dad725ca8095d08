use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use validator::Validate;

use crate::dto::admin_dto::{
    AllowanceRequest, AllowanceResponse, CourseAllowancesQuery, CreateAttemptRequest,
    CreateExamRequest, CreateUserRequest, ReviewDetailResponse, ReviewPolicyRequest,
    TransitionRequest,
};
use crate::error::{Error, Result};
use crate::models::allowance::{Allowance, AllowanceHistory, AllowanceKey};
use crate::models::attempt::{Attempt, AttemptHistory, NewAttempt};
use crate::models::exam::{Exam, ExamParams, ExamParamsInput, ExamUpdate};
use crate::models::review_policy::{ReviewPolicy, ReviewPolicyHistory};
use crate::models::user::{User, UserRef};
use crate::utils::token::generate_attempt_code;
use crate::AppState;

// Users

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>)> {
    req.validate()?;
    let user = state.store.insert_user(req.into()).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

// Exams

pub async fn create_exam(
    State(state): State<AppState>,
    Json(req): Json<CreateExamRequest>,
) -> Result<(StatusCode, Json<Exam>)> {
    req.validate()?;
    let exam = state.store.insert_exam(req.into()).await?;
    tracing::info!(exam_id = exam.id, course_id = %exam.course_id, "exam created");
    Ok((StatusCode::CREATED, Json(exam)))
}

pub async fn get_exam(State(state): State<AppState>, Path(exam_id): Path<i64>) -> Result<Json<Exam>> {
    let exam = state
        .store
        .find_exam(exam_id)
        .await?
        .ok_or(Error::ExamNotFound(exam_id))?;
    Ok(Json(exam))
}

pub async fn update_exam(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
    Json(update): Json<ExamUpdate>,
) -> Result<Json<Exam>> {
    if matches!(update.time_limit_mins, Some(mins) if mins < 0) {
        return Err(Error::BadRequest("time_limit_mins must not be negative".into()));
    }
    let exam = state.store.update_exam(exam_id, update).await?;
    Ok(Json(exam))
}

pub async fn get_exam_params(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
) -> Result<Json<ExamParams>> {
    let params = state
        .store
        .find_exam_params(exam_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no proctoring params for exam {}", exam_id)))?;
    Ok(Json(params))
}

pub async fn put_exam_params(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
    Json(input): Json<ExamParamsInput>,
) -> Result<Json<ExamParams>> {
    let params = state.store.put_exam_params(exam_id, input).await?;
    Ok(Json(params))
}

// Attempts

pub async fn create_attempt(
    State(state): State<AppState>,
    Json(req): Json<CreateAttemptRequest>,
) -> Result<(StatusCode, Json<Attempt>)> {
    req.validate()?;
    let exam = state
        .store
        .find_exam(req.exam_id)
        .await?
        .ok_or(Error::ExamNotFound(req.exam_id))?;

    let allowed_time_limit_mins = match req.allowed_time_limit_mins {
        Some(mins) => mins,
        None => {
            state
                .attempt_service
                .allowed_time_limit(&exam, req.user_id)
                .await?
        }
    };
    let provider_name = match req.provider_name {
        Some(name) => Some(name),
        None => state
            .store
            .find_exam_params(exam.id)
            .await?
            .and_then(|p| p.service)
            .or_else(|| Some(state.providers.default_provider().to_string())),
    };
    let review_policy_id = match req.review_policy_id {
        Some(id) => Some(id),
        None => state
            .review_policy_service
            .get(exam.id)
            .await?
            .map(|p| p.id),
    };

    let attempt = state
        .attempt_service
        .create(NewAttempt {
            exam_id: exam.id,
            user_id: req.user_id,
            student_name: req.student_name,
            allowed_time_limit_mins,
            attempt_code: req.attempt_code.unwrap_or_else(generate_attempt_code),
            taking_as_proctored: req.taking_as_proctored,
            is_sample_attempt: req.is_sample_attempt,
            external_id: req.external_id,
            provider_name,
            review_policy_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

pub async fn get_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<i64>,
) -> Result<Json<Attempt>> {
    Ok(Json(state.attempt_service.get(attempt_id).await?))
}

pub async fn transition_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<i64>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Attempt>> {
    let attempt = state
        .attempt_service
        .transition(attempt_id, req.status)
        .await?;
    Ok(Json(attempt))
}

pub async fn acknowledge_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<i64>,
) -> Result<Json<Attempt>> {
    Ok(Json(
        state.attempt_service.acknowledge_status(attempt_id).await?,
    ))
}

pub async fn delete_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<i64>,
) -> Result<Json<AttemptHistory>> {
    Ok(Json(state.attempt_service.delete(attempt_id).await?))
}

pub async fn attempt_history(
    State(state): State<AppState>,
    Path(attempt_id): Path<i64>,
) -> Result<Json<Vec<AttemptHistory>>> {
    Ok(Json(state.attempt_service.history(attempt_id).await?))
}

// Allowances

pub async fn put_allowance(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
    Json(req): Json<AllowanceRequest>,
) -> Result<Json<AllowanceResponse>> {
    req.validate()?;
    let (allowance, action) = state
        .allowance_service
        .add_or_update(exam_id, &UserRef::parse(&req.user), req.key, &req.value)
        .await?;
    Ok(Json(AllowanceResponse { allowance, action }))
}

pub async fn list_allowances(
    State(state): State<AppState>,
    Path((exam_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<Allowance>>> {
    Ok(Json(
        state.allowance_service.get_all(exam_id, user_id).await?,
    ))
}

pub async fn delete_allowance(
    State(state): State<AppState>,
    Path((exam_id, user_id, key)): Path<(i64, i64, String)>,
) -> Result<Json<AllowanceHistory>> {
    let key = key
        .parse::<AllowanceKey>()
        .map_err(|e| Error::BadRequest(e.to_string()))?;
    Ok(Json(
        state
            .allowance_service
            .remove(exam_id, user_id, key)
            .await?,
    ))
}

pub async fn allowance_history(
    State(state): State<AppState>,
    Path((exam_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<AllowanceHistory>>> {
    Ok(Json(
        state.allowance_service.history(exam_id, user_id).await?,
    ))
}

pub async fn course_allowances(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    Query(query): Query<CourseAllowancesQuery>,
) -> Result<Json<Vec<Allowance>>> {
    Ok(Json(
        state
            .allowance_service
            .get_for_course(&course_id, query.timed_only)
            .await?,
    ))
}

// Review policies

pub async fn set_review_policy(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
    Json(req): Json<ReviewPolicyRequest>,
) -> Result<Json<ReviewPolicy>> {
    req.validate()?;
    let policy = state
        .review_policy_service
        .set(exam_id, req.set_by_user_id, &req.policy_text)
        .await?;
    Ok(Json(policy))
}

pub async fn get_review_policy(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
) -> Result<Json<ReviewPolicy>> {
    let policy = state
        .review_policy_service
        .get(exam_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no review policy for exam {}", exam_id)))?;
    Ok(Json(policy))
}

pub async fn delete_review_policy(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
) -> Result<Json<ReviewPolicyHistory>> {
    Ok(Json(state.review_policy_service.remove(exam_id).await?))
}

pub async fn review_policy_history(
    State(state): State<AppState>,
    Path(exam_id): Path<i64>,
) -> Result<Json<Vec<ReviewPolicyHistory>>> {
    Ok(Json(state.review_policy_service.history(exam_id).await?))
}

pub async fn delete_review_policy_history(
    State(state): State<AppState>,
    Path(history_id): Path<i64>,
) -> Result<StatusCode> {
    state
        .review_policy_service
        .delete_history(history_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// Reviews

pub async fn get_review(
    State(state): State<AppState>,
    Path(attempt_code): Path<String>,
) -> Result<Json<ReviewDetailResponse>> {
    let review = state
        .review_service
        .get(&attempt_code)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no review for attempt {}", attempt_code)))?;
    let comments = state.review_service.comments(review.id).await?;
    let history = state.review_service.history(&attempt_code).await?;
    Ok(Json(ReviewDetailResponse {
        review,
        comments,
        history,
    }))
}
