//! Quiz-taking state machine.
//!
//! `loading → (ineligible | ready) → in_progress → submitting → (result | error)`
//!
//! Manual and timer-driven submits share [`AttemptRunner::submit`]. A failed
//! submit puts the runner back into `in_progress` with the timer re-armed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::metrics::{ATTEMPTS_SUBMITTED_TOTAL, ATTEMPT_RUNNERS_ACTIVE};
use crate::models::quiz::{AttemptResult, Quiz, QuizQuestion, SubmitAttemptRequest};
use crate::services::lms_client::LmsApi;

/// Delay before retrying an automatic submit whose deadline already passed.
const AUTO_SUBMIT_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunnerPhase {
    Loading,
    Ineligible { reason: String },
    Ready,
    InProgress,
    Submitting,
    Result { result: AttemptResult },
    Error { message: String },
}

impl RunnerPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerPhase::Ineligible { .. } | RunnerPhase::Result { .. } | RunnerPhase::Error { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            RunnerPhase::Loading => "loading",
            RunnerPhase::Ineligible { .. } => "ineligible",
            RunnerPhase::Ready => "ready",
            RunnerPhase::InProgress => "in_progress",
            RunnerPhase::Submitting => "submitting",
            RunnerPhase::Result { .. } => "result",
            RunnerPhase::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitTrigger {
    Manual,
    TimerExpired,
}

impl SubmitTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            SubmitTrigger::Manual => "manual",
            SubmitTrigger::TimerExpired => "timer_expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSnapshot {
    pub run_id: String,
    pub quiz_id: String,
    pub title: Option<String>,
    #[serde(flatten)]
    pub phase: RunnerPhase,
    pub questions: Vec<QuizQuestion>,
    pub answers: Vec<Option<Value>>,
    pub answered_count: usize,
    pub elapsed_seconds: u64,
    pub remaining_seconds: Option<u64>,
    pub time_limit_seconds: Option<u64>,
    pub submitted_by: Option<SubmitTrigger>,
}

/// Timer view used by the SSE stream.
#[derive(Debug, Clone)]
pub struct TimerStatus {
    pub phase: RunnerPhase,
    pub elapsed: Duration,
    pub remaining: Option<Duration>,
    pub total: Option<Duration>,
    pub submitted_by: Option<SubmitTrigger>,
}

struct RunnerInner {
    phase: RunnerPhase,
    quiz: Option<Quiz>,
    answers: Vec<Option<Value>>,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    finished_at: Option<Instant>,
    submitted_by: Option<SubmitTrigger>,
    last_activity: Instant,
}

pub struct AttemptRunner {
    run_id: String,
    quiz_id: String,
    student_id: String,
    token: String,
    lms: Arc<dyn LmsApi>,
    created_at: DateTime<Utc>,
    inner: Mutex<RunnerInner>,
}

impl AttemptRunner {
    pub fn new(quiz_id: &str, student_id: &str, token: &str, lms: Arc<dyn LmsApi>) -> Arc<Self> {
        Arc::new(Self {
            run_id: Uuid::new_v4().to_string(),
            quiz_id: quiz_id.to_string(),
            student_id: student_id.to_string(),
            token: token.to_string(),
            lms,
            created_at: Utc::now(),
            inner: Mutex::new(RunnerInner {
                phase: RunnerPhase::Loading,
                quiz: None,
                answers: Vec::new(),
                started_at: None,
                deadline: None,
                timer: None,
                finished_at: None,
                submitted_by: None,
                last_activity: Instant::now(),
            }),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock(&self) -> MutexGuard<'_, RunnerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> RunnerPhase {
        self.lock().phase.clone()
    }

    /// Asks the LMS whether an attempt may start. Ends in `ready`,
    /// `ineligible` (returned as `Forbidden`) or `error`.
    pub async fn load(&self) -> ApiResult<()> {
        if !matches!(self.lock().phase, RunnerPhase::Loading) {
            return Err(ApiError::Conflict("Attempt already loaded".to_string()));
        }

        let outcome = self.lms.start_attempt(&self.token, &self.quiz_id).await;

        let mut inner = self.lock();
        match outcome {
            Ok(start) if !start.can_attempt => {
                let reason = start
                    .reason
                    .unwrap_or_else(|| "You cannot attempt this quiz".to_string());
                inner.phase = RunnerPhase::Ineligible {
                    reason: reason.clone(),
                };
                Err(ApiError::Forbidden(reason))
            }
            Ok(start) => match start.quiz {
                Some(quiz) => {
                    inner.quiz = Some(quiz);
                    inner.phase = RunnerPhase::Ready;
                    Ok(())
                }
                None => {
                    let message = "LMS did not return the quiz content".to_string();
                    inner.phase = RunnerPhase::Error {
                        message: message.clone(),
                    };
                    Err(ApiError::Decode(message))
                }
            },
            Err(ApiError::ServerRejection { status, message })
                if matches!(status, 400 | 403 | 409) =>
            {
                inner.phase = RunnerPhase::Ineligible {
                    reason: message.clone(),
                };
                Err(ApiError::Forbidden(message))
            }
            Err(e) => {
                inner.phase = RunnerPhase::Error {
                    message: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Enters `in_progress`. The countdown is armed only for timed quizzes.
    pub fn begin(self: &Arc<Self>) -> ApiResult<()> {
        let mut inner = self.lock();
        if !matches!(inner.phase, RunnerPhase::Ready) {
            return Err(ApiError::Conflict(format!(
                "Cannot start attempt while {}",
                inner.phase.name()
            )));
        }

        let (question_count, time_limit) = match &inner.quiz {
            Some(quiz) => (quiz.questions.len(), quiz.time_limit.filter(|m| *m > 0)),
            None => (0, None),
        };

        let now = Instant::now();
        inner.answers = vec![None; question_count];
        inner.started_at = Some(now);
        inner.last_activity = now;
        inner.phase = RunnerPhase::InProgress;

        if let Some(minutes) = time_limit {
            let limit = Duration::from_secs(u64::from(minutes) * 60);
            inner.deadline = Some(now + limit);
            self.arm_timer(&mut inner, limit);
        }

        tracing::info!(
            "Attempt {} started: quiz={}, student={}, questions={}, time_limit={:?}min",
            self.run_id,
            self.quiz_id,
            self.student_id,
            question_count,
            time_limit
        );
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, inner: &mut RunnerInner, after: Duration) {
        if let Some(previous) = inner.timer.take() {
            previous.abort();
        }
        let runner: Weak<Self> = Arc::downgrade(self);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(runner) = runner.upgrade() {
                tracing::info!("Attempt {} timer expired, submitting", runner.run_id);
                if let Err(e) = runner.submit(SubmitTrigger::TimerExpired).await {
                    tracing::warn!("Automatic submit of {} failed: {}", runner.run_id, e);
                }
            }
        }));
    }

    /// Returns how many questions have an answer.
    pub fn record_answer(&self, index: usize, answer: Value) -> ApiResult<usize> {
        let mut inner = self.lock();
        if !matches!(inner.phase, RunnerPhase::InProgress) {
            return Err(ApiError::Conflict("Attempt is not in progress".to_string()));
        }
        let total = inner.answers.len();
        let slot = inner.answers.get_mut(index).ok_or_else(|| {
            ApiError::Validation(format!(
                "Question index {} out of range (quiz has {} questions)",
                index, total
            ))
        })?;
        *slot = if answer.is_null() { None } else { Some(answer) };
        inner.last_activity = Instant::now();
        Ok(inner.answers.iter().filter(|a| a.is_some()).count())
    }

    /// Submits the recorded answers. Only accepted from `in_progress`, so a
    /// timer expiry racing a manual submit results in one submission.
    pub async fn submit(self: &Arc<Self>, trigger: SubmitTrigger) -> ApiResult<AttemptResult> {
        let request = {
            let mut inner = self.lock();
            if !matches!(inner.phase, RunnerPhase::InProgress) {
                return Err(ApiError::Conflict(format!(
                    "Cannot submit while {}",
                    inner.phase.name()
                )));
            }
            inner.phase = RunnerPhase::Submitting;
            inner.last_activity = Instant::now();

            if let Some(timer) = inner.timer.take() {
                // The timer task is the caller on expiry; aborting it would cancel this submit
                if trigger == SubmitTrigger::Manual {
                    timer.abort();
                }
            }

            let elapsed = inner
                .started_at
                .map(|started| started.elapsed())
                .unwrap_or_default();

            SubmitAttemptRequest {
                quiz_id: self.quiz_id.clone(),
                answers: inner.answers.clone(),
                time_taken: elapsed.as_secs(),
            }
        };

        tracing::info!(
            "Submitting attempt {} ({}): answered={}/{}, time_taken={}s",
            self.run_id,
            trigger.as_str(),
            request.answers.iter().filter(|a| a.is_some()).count(),
            request.answers.len(),
            request.time_taken
        );

        let outcome = self.lms.submit_attempt(&self.token, &request).await;

        let mut inner = self.lock();
        match outcome {
            Ok(result) => {
                ATTEMPTS_SUBMITTED_TOTAL
                    .with_label_values(&[trigger.as_str(), "success"])
                    .inc();
                inner.phase = RunnerPhase::Result {
                    result: result.clone(),
                };
                inner.finished_at = Some(Instant::now());
                inner.submitted_by = Some(trigger);
                tracing::info!(
                    "Attempt {} graded: score={}, passed={}",
                    self.run_id,
                    result.score,
                    result.passed
                );
                Ok(result)
            }
            Err(e) => {
                ATTEMPTS_SUBMITTED_TOTAL
                    .with_label_values(&[trigger.as_str(), "failure"])
                    .inc();
                tracing::error!("Submit of attempt {} failed: {}", self.run_id, e);
                inner.phase = RunnerPhase::InProgress;
                if let Some(deadline) = inner.deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let wait = if remaining.is_zero() {
                        AUTO_SUBMIT_RETRY
                    } else {
                        remaining
                    };
                    self.arm_timer(&mut inner, wait);
                }
                Err(e)
            }
        }
    }

    pub fn timer_status(&self) -> TimerStatus {
        let inner = self.lock();
        let now = Instant::now();
        let end = inner.finished_at.unwrap_or(now);
        TimerStatus {
            phase: inner.phase.clone(),
            elapsed: inner
                .started_at
                .map(|started| end.saturating_duration_since(started))
                .unwrap_or_default(),
            remaining: inner
                .deadline
                .map(|deadline| deadline.saturating_duration_since(end)),
            total: inner
                .deadline
                .zip(inner.started_at)
                .map(|(deadline, started)| deadline.saturating_duration_since(started)),
            submitted_by: inner.submitted_by,
        }
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let timer = self.timer_status();
        let inner = self.lock();
        RunnerSnapshot {
            run_id: self.run_id.clone(),
            quiz_id: self.quiz_id.clone(),
            title: inner.quiz.as_ref().map(|q| q.title.clone()),
            phase: inner.phase.clone(),
            questions: inner
                .quiz
                .as_ref()
                .map(|q| q.questions.clone())
                .unwrap_or_default(),
            answers: inner.answers.clone(),
            answered_count: inner.answers.iter().filter(|a| a.is_some()).count(),
            elapsed_seconds: timer.elapsed.as_secs(),
            remaining_seconds: timer.remaining.map(|r| r.as_secs()),
            time_limit_seconds: timer.total.map(|t| t.as_secs()),
            submitted_by: inner.submitted_by,
        }
    }

    /// Finished runs expire `retention` after they end. Unfinished ones expire
    /// after `idle_limit` without activity, unless a countdown is still running
    /// or a submit is in flight.
    fn is_expired(&self, retention: Duration, idle_limit: Duration) -> bool {
        let inner = self.lock();
        let now = Instant::now();
        if inner.phase.is_terminal() {
            return inner
                .finished_at
                .is_none_or(|finished| now.saturating_duration_since(finished) >= retention);
        }
        if matches!(inner.phase, RunnerPhase::Submitting)
            || inner.deadline.is_some_and(|deadline| deadline > now)
        {
            return false;
        }
        now.saturating_duration_since(inner.last_activity) >= idle_limit
    }
}

impl Drop for AttemptRunner {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}

/// Live runners by run id. Finished runs are kept for `retention` so results
/// stay readable, then pruned. Runs left unfinished are dropped after
/// `idle_limit` without activity; dropping a runner aborts its timer.
pub struct AttemptRegistry {
    runs: RwLock<HashMap<String, Arc<AttemptRunner>>>,
    retention: Duration,
    idle_limit: Duration,
}

impl AttemptRegistry {
    pub fn new(retention: Duration, idle_limit: Duration) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            retention,
            idle_limit,
        }
    }

    pub fn insert(&self, runner: Arc<AttemptRunner>) {
        self.prune();
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        runs.insert(runner.run_id().to_string(), runner);
        ATTEMPT_RUNNERS_ACTIVE.set(runs.len() as i64);
    }

    /// Runs belonging to other students are reported as missing.
    pub fn get(&self, run_id: &str, student_id: &str) -> ApiResult<Arc<AttemptRunner>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .filter(|runner| runner.student_id() == student_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Attempt {} not found", run_id)))
    }

    pub fn prune(&self) -> usize {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let before = runs.len();
        runs.retain(|_, runner| !runner.is_expired(self.retention, self.idle_limit));
        ATTEMPT_RUNNERS_ACTIVE.set(runs.len() as i64);
        let pruned = before - runs.len();
        if pruned > 0 {
            tracing::debug!("Pruned {} attempt runs, {} live", pruned, runs.len());
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
