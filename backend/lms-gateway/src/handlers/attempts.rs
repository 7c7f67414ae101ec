use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Extension, Json,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiResult;
use crate::extractors::AppJson;
use crate::handlers::SseConnection;
use crate::middlewares::auth::AuthContext;
use crate::models::quiz::AttemptResult;
use crate::models::timer::{AttemptEvent, AttemptFinished, TimeExpired, TimerTick};
use crate::models::Envelope;
use crate::services::attempt_runner::{
    AttemptRunner, RunnerPhase, RunnerSnapshot, SubmitTrigger, TimerStatus,
};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub struct AnswerInput {
    /// `null` clears the answer.
    #[serde(default)]
    pub answer: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecorded {
    pub index: usize,
    pub answered_count: usize,
}

/// POST /api/quizzes/{quiz_id}/attempts
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(quiz_id): Path<String>,
) -> ApiResult<(StatusCode, Json<Envelope<RunnerSnapshot>>)> {
    let runner = AttemptRunner::new(&quiz_id, auth.user_id(), &auth.token, state.lms.clone());
    runner.load().await?;
    runner.begin()?;
    state.attempts.insert(runner.clone());

    Ok((StatusCode::CREATED, Json(Envelope::ok(runner.snapshot()))))
}

/// GET /api/attempts/{run_id}
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Envelope<RunnerSnapshot>>> {
    let runner = state.attempts.get(&run_id, auth.user_id())?;
    Ok(Json(Envelope::ok(runner.snapshot())))
}

/// PUT /api/attempts/{run_id}/answers/{index}
pub async fn record_answer(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((run_id, index)): Path<(String, usize)>,
    AppJson(input): AppJson<AnswerInput>,
) -> ApiResult<Json<Envelope<AnswerRecorded>>> {
    let runner = state.attempts.get(&run_id, auth.user_id())?;
    let answered_count = runner.record_answer(index, input.answer)?;
    Ok(Json(Envelope::ok(AnswerRecorded {
        index,
        answered_count,
    })))
}

/// POST /api/attempts/{run_id}/submit
pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Envelope<AttemptResult>>> {
    let runner = state.attempts.get(&run_id, auth.user_id())?;
    let result = runner.submit(SubmitTrigger::Manual).await?;
    Ok(Json(Envelope::ok(result)))
}

/// GET /api/attempts/{run_id}/stream
pub async fn attempt_stream(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let runner = state.attempts.get(&run_id, auth.user_id())?;
    let tick = state.tick_interval();
    tracing::info!(
        "Client connected to attempt stream: run={}, tick_interval={:?}",
        run_id,
        tick
    );

    Ok(Sse::new(timer_stream(runner, tick)).keep_alive(KeepAlive::default()))
}

struct TimerStream {
    runner: Arc<AttemptRunner>,
    tick: Duration,
    pending: VecDeque<AttemptEvent>,
    first: bool,
    done: bool,
    _connection: SseConnection,
}

fn to_event(event: &AttemptEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(event.to_sse_data())
}

/// Final events for a run that left `in_progress`. Empty while it is live.
fn closing_events(run_id: &str, status: &TimerStatus) -> Option<Vec<AttemptEvent>> {
    let now = Utc::now();
    match &status.phase {
        RunnerPhase::Loading
        | RunnerPhase::Ready
        | RunnerPhase::InProgress
        | RunnerPhase::Submitting => None,
        RunnerPhase::Result { result } => {
            let mut events = Vec::new();
            if status.submitted_by == Some(SubmitTrigger::TimerExpired) {
                events.push(AttemptEvent::TimeExpired(TimeExpired {
                    run_id: run_id.to_string(),
                    timestamp: now,
                    message: "Time limit reached, answers were submitted automatically"
                        .to_string(),
                }));
            }
            events.push(AttemptEvent::AttemptFinished(AttemptFinished {
                run_id: run_id.to_string(),
                timestamp: now,
                score: Some(result.score),
                passed: Some(result.passed),
            }));
            Some(events)
        }
        RunnerPhase::Ineligible { .. } | RunnerPhase::Error { .. } => {
            Some(vec![AttemptEvent::AttemptFinished(AttemptFinished {
                run_id: run_id.to_string(),
                timestamp: now,
                score: None,
                passed: None,
            })])
        }
    }
}

fn timer_stream(
    runner: Arc<AttemptRunner>,
    tick: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = TimerStream {
        runner,
        tick,
        pending: VecDeque::new(),
        first: true,
        done: false,
        _connection: SseConnection::open(),
    };

    stream::unfold(state, |mut state| async move {
        if let Some(event) = state.pending.pop_front() {
            return Some((Ok(to_event(&event)), state));
        }
        if state.done {
            return None;
        }

        if !std::mem::take(&mut state.first) {
            tokio::time::sleep(state.tick).await;
        }

        let run_id = state.runner.run_id().to_string();
        let status = state.runner.timer_status();

        if let Some(events) = closing_events(&run_id, &status) {
            tracing::info!("Attempt stream closing: run={}", run_id);
            state.pending.extend(events);
            state.done = true;
            let event = state.pending.pop_front()?;
            return Some((Ok(to_event(&event)), state));
        }

        let event = AttemptEvent::TimerTick(TimerTick {
            run_id,
            remaining_seconds: status.remaining.map(|r| r.as_secs()),
            elapsed_seconds: status.elapsed.as_secs(),
            total_seconds: status.total.map(|t| t.as_secs()),
            timestamp: Utc::now(),
        });
        Some((Ok(to_event(&event)), state))
    })
}
