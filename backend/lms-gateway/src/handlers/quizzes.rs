use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Extension, Json,
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::extractors::AppJson;
use crate::handlers::SseConnection;
use crate::middlewares::auth::AuthContext;
use crate::models::quiz::{
    ExtraAttemptInput, ExtraAttemptRequest, ExtraRequestStatus, RequestExtraAttemptBody,
};
use crate::models::Envelope;
use crate::services::quiz_status::QuizStatusView;
use crate::services::status_cache::{
    BoardSnapshot, RefreshTrigger, StatusCache, StatusPoller, StatusSignal,
};
use crate::services::AppState;

/// GET /api/courses/{course_id}/quizzes/status
pub async fn course_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(course_id): Path<String>,
) -> ApiResult<Json<Envelope<BoardSnapshot>>> {
    let quizzes = state.lms.course_quizzes(&auth.token, &course_id).await?;
    tracing::info!(
        "Resolving {} quizzes of course {} for {}",
        quizzes.len(),
        course_id,
        auth.user_id()
    );

    let cache = StatusCache::new(
        state.lms.clone(),
        auth.token.clone(),
        auth.user_id().to_string(),
        quizzes,
    );
    cache.refresh(RefreshTrigger::Manual).await;

    Ok(Json(Envelope::ok(cache.snapshot())))
}

/// GET /api/quizzes/{quiz_id}/status
pub async fn quiz_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(quiz_id): Path<String>,
) -> ApiResult<Json<Envelope<QuizStatusView>>> {
    let quiz = state.lms.quiz(&auth.token, &quiz_id).await?;

    let cache = StatusCache::new(
        state.lms.clone(),
        auth.token.clone(),
        auth.user_id().to_string(),
        vec![quiz],
    );
    let report = cache.refresh(RefreshTrigger::Manual).await;

    // Without server data the resolved state would be a guess
    if let Some(failure) = report.failed.into_iter().next() {
        return Err(ApiError::rejection(502, failure.message));
    }

    cache
        .snapshot()
        .quizzes
        .into_iter()
        .next()
        .map(|view| Json(Envelope::ok(view)))
        .ok_or_else(|| ApiError::NotFound(format!("Quiz {} not found", quiz_id)))
}

/// POST /api/quizzes/{quiz_id}/extra-attempt-requests
pub async fn request_extra_attempt(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(quiz_id): Path<String>,
    AppJson(input): AppJson<ExtraAttemptInput>,
) -> ApiResult<(StatusCode, Json<Envelope<ExtraAttemptRequest>>)> {
    input.validate()?;

    let body = RequestExtraAttemptBody {
        quiz_id: quiz_id.clone(),
        reason: input.reason.filter(|r| !r.trim().is_empty()),
    };
    let request = state
        .lms
        .request_extra_attempt(&auth.token, &body)
        .await
        .inspect_err(|e| tracing::error!("Extra attempt request for {} failed: {}", quiz_id, e))?;

    tracing::info!(
        "Extra attempt requested: student={}, quiz={}",
        auth.user_id(),
        quiz_id
    );
    state.signals.publish(StatusSignal::AttemptExtensionUpdated {
        student_id: auth.user_id().to_string(),
        quiz_id,
        status: ExtraRequestStatus::Pending,
    });

    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok_with_message(
            request,
            "Extra attempt request submitted",
        )),
    ))
}

/// GET /api/courses/{course_id}/quizzes/status/stream
///
/// One poller per connection. It is torn down when the client goes away and
/// the stream state is dropped.
pub async fn status_stream(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(course_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let quizzes = state.lms.course_quizzes(&auth.token, &course_id).await?;
    tracing::info!(
        "Status board opened: course={}, student={}, quizzes={}",
        course_id,
        auth.user_id(),
        quizzes.len()
    );

    let cache = Arc::new(StatusCache::new(
        state.lms.clone(),
        auth.token.clone(),
        auth.user_id().to_string(),
        quizzes,
    ));
    let poller = StatusPoller::spawn(cache, state.poll_interval(), &state.signals);

    Ok(Sse::new(board_stream(poller)).keep_alive(KeepAlive::default()))
}

struct BoardStream {
    poller: StatusPoller,
    updates: watch::Receiver<Option<BoardSnapshot>>,
    _connection: SseConnection,
}

fn board_stream(poller: StatusPoller) -> impl Stream<Item = Result<Event, Infallible>> {
    let updates = poller.updates();
    let board = BoardStream {
        poller,
        updates,
        _connection: SseConnection::open(),
    };

    stream::unfold(board, |mut board| async move {
        loop {
            if board.updates.changed().await.is_err() {
                tracing::debug!("Status board poller ended");
                board.poller.shutdown();
                return None;
            }
            let snapshot = board.updates.borrow_and_update().clone();
            if let Some(snapshot) = snapshot {
                let event = Event::default()
                    .event("quiz-status")
                    .json_data(&snapshot)
                    .unwrap_or_else(|_| Event::default().event("quiz-status").data("{}"));
                return Some((Ok(event), board));
            }
        }
    })
}
