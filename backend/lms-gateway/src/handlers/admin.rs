use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Serialize;
use std::sync::Arc;
use validator::Validate;

use crate::error::ApiResult;
use crate::extractors::AppJson;
use crate::middlewares::auth::AuthContext;
use crate::models::progress::{LevelAssignment, SetLevelRequest};
use crate::models::quiz::{CreateQuizRequest, ExtraAttemptRequest, ExtraRequestStatus, Quiz};
use crate::models::Envelope;
use crate::services::status_cache::StatusSignal;
use crate::services::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub request: ExtraAttemptRequest,
    /// Open status boards that received the update.
    pub notified_boards: usize,
}

/// PATCH /api/admin/progress/level
pub async fn set_level(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    AppJson(req): AppJson<SetLevelRequest>,
) -> ApiResult<Json<Envelope<LevelAssignment>>> {
    req.validate()?;

    let assignment = state
        .lms
        .set_level(&auth.token, &req)
        .await
        .inspect_err(|e| tracing::error!("Setting level for {} failed: {}", req.student_id, e))?;

    tracing::info!(
        "Level {} assigned to student {} in course {} by {} (locked: {})",
        assignment.level,
        assignment.student_id,
        assignment.course_id,
        auth.user_id(),
        assignment.locked
    );
    Ok(Json(Envelope::ok(assignment)))
}

/// POST /api/admin/quizzes
pub async fn create_quiz(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    AppJson(req): AppJson<CreateQuizRequest>,
) -> ApiResult<(StatusCode, Json<Envelope<Quiz>>)> {
    req.validate()?;

    let quiz = state
        .lms
        .create_quiz(&auth.token, &req)
        .await
        .inspect_err(|e| tracing::error!("Creating quiz '{}' failed: {}", req.title, e))?;

    tracing::info!(
        "Quiz {} created in course {} with {} questions",
        quiz.id,
        req.course_id,
        req.questions.len()
    );
    Ok((StatusCode::CREATED, Json(Envelope::ok(quiz))))
}

/// POST /api/admin/extra-attempt-requests/{request_id}/approve
pub async fn approve_extra_request(
    state: State<Arc<AppState>>,
    auth: Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<Envelope<ReviewOutcome>>> {
    review(state, auth, request_id, ExtraRequestStatus::Granted).await
}

/// POST /api/admin/extra-attempt-requests/{request_id}/reject
pub async fn reject_extra_request(
    state: State<Arc<AppState>>,
    auth: Extension<AuthContext>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<Envelope<ReviewOutcome>>> {
    review(state, auth, request_id, ExtraRequestStatus::Rejected).await
}

/// The signal goes out only after the LMS confirmed the review.
async fn review(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    request_id: String,
    status: ExtraRequestStatus,
) -> ApiResult<Json<Envelope<ReviewOutcome>>> {
    let request = state
        .lms
        .review_extra_request(&auth.token, &request_id, status)
        .await
        .inspect_err(|e| tracing::error!("Review of request {} failed: {}", request_id, e))?;

    let notified_boards = state.signals.publish(StatusSignal::AttemptExtensionUpdated {
        student_id: request.student_id.clone(),
        quiz_id: request.quiz_id.clone(),
        status,
    });

    tracing::info!(
        "Extra attempt request {} {:?} by {}: student={}, quiz={}, boards={}",
        request_id,
        status,
        auth.user_id(),
        request.student_id,
        request.quiz_id,
        notified_boards
    );

    Ok(Json(Envelope::ok(ReviewOutcome {
        request,
        notified_boards,
    })))
}
