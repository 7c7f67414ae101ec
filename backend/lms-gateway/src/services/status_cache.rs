//! Server-authoritative quiz status cache for one student and one set of
//! quizzes, plus the signal bus and poller that keep it fresh.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::metrics::{QUIZ_STATES_RESOLVED_TOTAL, STATUS_REFRESHES_TOTAL};
use crate::models::quiz::{ExtraAttemptRequest, ExtraRequestStatus, Quiz, QuizAttempt, QuizServerStatus};
use crate::services::lms_client::LmsApi;
use crate::services::quiz_status::{self, QuizHints, QuizStatusView};

const SIGNAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Initial,
    Poll,
    Signal,
    Manual,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Initial => "initial",
            RefreshTrigger::Poll => "poll",
            RefreshTrigger::Signal => "signal",
            RefreshTrigger::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusSignal {
    AttemptExtensionUpdated {
        student_id: String,
        quiz_id: String,
        status: ExtraRequestStatus,
    },
}

/// Pub/sub bus for status invalidation. Replaces ad hoc global event names
/// with a typed channel that boards subscribe to for their lifetime.
#[derive(Clone)]
pub struct StatusSignals {
    tx: broadcast::Sender<StatusSignal>,
}

impl Default for StatusSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    /// Returns how many boards received the signal.
    pub fn publish(&self, signal: StatusSignal) -> usize {
        tracing::debug!("Publishing status signal: {:?}", signal);
        self.tx.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSignal> {
        self.tx.subscribe()
    }
}

/// Presentation hints kept apart from server state and merged only when
/// resolving.
#[derive(Debug, Default, Clone)]
pub struct DisplayHints {
    /// quiz id -> cache generation current when the grant was signalled
    extra_granted: HashMap<String, u64>,
    rejected: HashSet<String>,
    pending: HashSet<String>,
    last_signal_generation: u64,
    last_requests_generation: u64,
}

impl DisplayHints {
    pub fn for_quiz(&self, quiz_id: &str) -> QuizHints {
        QuizHints {
            extra_granted: self.extra_granted.contains_key(quiz_id),
            rejected: self.rejected.contains(quiz_id),
            request_pending: self.pending.contains(quiz_id),
            attempts_outdated: false,
        }
    }

    fn apply_signal(&mut self, quiz_id: &str, status: ExtraRequestStatus, generation: u64) {
        self.last_signal_generation = generation;
        match status {
            ExtraRequestStatus::Granted => {
                self.extra_granted.insert(quiz_id.to_string(), generation);
                self.pending.remove(quiz_id);
                self.rejected.remove(quiz_id);
            }
            ExtraRequestStatus::Rejected => {
                self.rejected.insert(quiz_id.to_string());
                self.pending.remove(quiz_id);
            }
            ExtraRequestStatus::Pending => {
                self.pending.insert(quiz_id.to_string());
            }
        }
    }

    /// Rebuilds pending/rejected from the server's request list. A list from a
    /// fetch that started before the last signal, or before the list already
    /// applied, is ignored. Returns whether the list was applied.
    fn apply_requests(&mut self, requests: &[ExtraAttemptRequest], generation: u64) -> bool {
        if generation <= self.last_signal_generation || generation <= self.last_requests_generation {
            return false;
        }
        self.last_requests_generation = generation;
        self.pending.clear();
        self.rejected.clear();
        // Latest request per quiz decides
        let mut latest: HashMap<&str, &ExtraAttemptRequest> = HashMap::new();
        for request in requests {
            let newer = latest
                .get(request.quiz_id.as_str())
                .is_none_or(|current| request.created_at >= current.created_at);
            if newer {
                latest.insert(request.quiz_id.as_str(), request);
            }
        }
        for (quiz_id, request) in latest {
            match request.status {
                ExtraRequestStatus::Pending => {
                    self.pending.insert(quiz_id.to_string());
                }
                ExtraRequestStatus::Rejected => {
                    self.rejected.insert(quiz_id.to_string());
                }
                ExtraRequestStatus::Granted => {}
            }
        }
        true
    }

    /// An authoritative status fetch started after the grant supersedes it.
    fn supersede_grant(&mut self, quiz_id: &str, fetch_generation: u64) {
        if self
            .extra_granted
            .get(quiz_id)
            .is_some_and(|set_at| fetch_generation > *set_at)
        {
            self.extra_granted.remove(quiz_id);
        }
    }
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    statuses: HashMap<String, Stamped<QuizServerStatus>>,
    attempts: HashMap<String, Stamped<Vec<QuizAttempt>>>,
    hints: DisplayHints,
    degraded: HashSet<String>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Keeps `value` only if it comes from a newer request than what is stored.
fn apply_latest<T>(map: &mut HashMap<String, Stamped<T>>, key: &str, value: T, generation: u64) -> bool {
    match map.get(key) {
        Some(existing) if existing.generation >= generation => false,
        _ => {
            map.insert(key.to_string(), Stamped { value, generation });
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizFetchFailure {
    pub quiz_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub generation: u64,
    pub updated: usize,
    /// Responses dropped because a newer request already landed.
    pub stale: usize,
    pub failed: Vec<QuizFetchFailure>,
    pub discarded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub quizzes: Vec<QuizStatusView>,
    pub degraded_quiz_ids: Vec<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

pub struct StatusCache {
    lms: Arc<dyn LmsApi>,
    token: String,
    student_id: String,
    quizzes: Vec<Quiz>,
    state: RwLock<CacheState>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl StatusCache {
    pub fn new(lms: Arc<dyn LmsApi>, token: String, student_id: String, quizzes: Vec<Quiz>) -> Self {
        Self {
            lms,
            token,
            student_id,
            quizzes,
            state: RwLock::new(CacheState::default()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Teardown: fetches still in flight complete but are not applied.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Fans out status + attempts fetches for every quiz. A failing quiz keeps
    /// its previous values and is reported; the others still update.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> RefreshReport {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        STATUS_REFRESHES_TOTAL
            .with_label_values(&[trigger.as_str()])
            .inc();

        let lms = self.lms.as_ref();
        let token = self.token.as_str();
        let fetches = self.quizzes.iter().map(|quiz| async move {
            let (status, attempts) = tokio::join!(
                lms.quiz_status(token, &quiz.id),
                lms.quiz_attempts(token, &quiz.id)
            );
            (quiz.id.as_str(), status, attempts)
        });
        let (results, requests) = tokio::join!(join_all(fetches), lms.my_extra_requests(token));

        let mut report = RefreshReport {
            generation,
            ..RefreshReport::default()
        };

        if self.is_closed() {
            tracing::debug!("Discarding refresh {} after teardown", generation);
            report.discarded = true;
            return report;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (quiz_id, status, attempts) in results {
            let mut failure = None;

            match status {
                Ok(status) => {
                    if apply_latest(&mut state.statuses, quiz_id, status, generation) {
                        state.hints.supersede_grant(quiz_id, generation);
                        report.updated += 1;
                    } else {
                        report.stale += 1;
                    }
                }
                Err(e) => failure = Some(e.to_string()),
            }

            match attempts {
                Ok(attempts) => {
                    apply_latest(&mut state.attempts, quiz_id, attempts, generation);
                }
                Err(e) => {
                    failure.get_or_insert_with(|| e.to_string());
                }
            }

            if let Some(message) = failure {
                tracing::warn!("Status refresh failed for quiz {}: {}", quiz_id, message);
                state.degraded.insert(quiz_id.to_string());
                report.failed.push(QuizFetchFailure {
                    quiz_id: quiz_id.to_string(),
                    message,
                });
            } else {
                state.degraded.remove(quiz_id);
            }
        }

        match requests {
            Ok(list) => {
                let mine: Vec<ExtraAttemptRequest> = list
                    .into_iter()
                    .filter(|r| r.student_id == self.student_id)
                    .collect();
                if !state.hints.apply_requests(&mine, generation) {
                    tracing::debug!("Dropping extra attempt requests from refresh {}", generation);
                }
            }
            Err(e) => tracing::warn!("Extra attempt requests unavailable: {}", e),
        }

        state.refreshed_at = Some(Utc::now());
        tracing::debug!(
            "Refresh {} ({}) updated={} stale={} failed={}",
            generation,
            trigger.as_str(),
            report.updated,
            report.stale,
            report.failed.len()
        );
        report
    }

    /// Applies a signal addressed to this board. Returns false when the
    /// signal is for another student or quiz.
    pub fn accept_signal(&self, signal: &StatusSignal) -> bool {
        let StatusSignal::AttemptExtensionUpdated {
            student_id,
            quiz_id,
            status,
        } = signal;

        if *student_id != self.student_id || !self.quizzes.iter().any(|q| q.id == *quiz_id) {
            return false;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.hints.apply_signal(quiz_id, *status, generation);
        true
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let quizzes = self
            .quizzes
            .iter()
            .map(|quiz| {
                let stamped_attempts = state.attempts.get(&quiz.id);
                let stamped_status = state.statuses.get(&quiz.id);
                // Pass/fail needs an attempts list at least as fresh as the status
                let attempts_outdated = match (stamped_status, stamped_attempts) {
                    (_, None) => true,
                    (Some(status), Some(attempts)) => attempts.generation < status.generation,
                    (None, Some(_)) => false,
                };
                let hints = QuizHints {
                    attempts_outdated,
                    ..state.hints.for_quiz(&quiz.id)
                };
                let view = quiz_status::resolve(
                    quiz,
                    stamped_attempts.map(|a| a.value.as_slice()).unwrap_or_default(),
                    stamped_status.map(|s| &s.value),
                    hints,
                );
                QUIZ_STATES_RESOLVED_TOTAL
                    .with_label_values(&[view.state.as_str()])
                    .inc();
                view
            })
            .collect();

        let mut degraded_quiz_ids: Vec<String> = state.degraded.iter().cloned().collect();
        degraded_quiz_ids.sort();

        BoardSnapshot {
            quizzes,
            degraded_quiz_ids,
            refreshed_at: state.refreshed_at,
        }
    }
}

/// Background refresher bound to one [`StatusCache`]. Dropping it tears the
/// board down.
pub struct StatusPoller {
    cache: Arc<StatusCache>,
    handle: JoinHandle<()>,
    updates: watch::Receiver<Option<BoardSnapshot>>,
}

impl StatusPoller {
    /// Refreshes immediately, then on every tick of `interval` and on every
    /// signal addressed to this board.
    pub fn spawn(cache: Arc<StatusCache>, interval: Duration, signals: &StatusSignals) -> Self {
        let (tx, rx) = watch::channel(None);
        let mut signal_rx = signals.subscribe();
        let task_cache = cache.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut signals_open = true;
            let mut first = true;

            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => {
                        if std::mem::take(&mut first) {
                            RefreshTrigger::Initial
                        } else {
                            RefreshTrigger::Poll
                        }
                    }
                    signal = signal_rx.recv(), if signals_open => match signal {
                        Ok(signal) => {
                            if !task_cache.accept_signal(&signal) {
                                continue;
                            }
                            RefreshTrigger::Signal
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Status board lagged {} signals, refreshing", skipped);
                            RefreshTrigger::Signal
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            signals_open = false;
                            continue;
                        }
                    },
                };

                if task_cache.is_closed() {
                    break;
                }
                task_cache.refresh(trigger).await;
                if task_cache.is_closed() {
                    break;
                }
                if tx.send(Some(task_cache.snapshot())).is_err() {
                    break;
                }
            }

            tracing::debug!(
                "Status poller stopped for student {}",
                task_cache.student_id()
            );
        });

        Self {
            cache,
            handle,
            updates: rx,
        }
    }

    pub fn updates(&self) -> watch::Receiver<Option<BoardSnapshot>> {
        self.updates.clone()
    }

    pub fn shutdown(&self) {
        self.cache.close();
        self.handle.abort();
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
