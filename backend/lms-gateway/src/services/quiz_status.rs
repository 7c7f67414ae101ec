//! Quiz status resolution.
//!
//! Maps a quiz, the student's attempts, the latest server status and the
//! display hints onto exactly one [`QuizState`]. Pure: no I/O, no clock.

use serde::{Deserialize, Serialize};

use crate::models::quiz::{Quiz, QuizAttempt, QuizServerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizState {
    NotAttempted,
    /// Terminal once reached: a passed quiz is never offered for retake.
    PassedNoAttempts,
    FailedCanRetake,
    NoAttemptsLeft,
    Rejected,
}

impl QuizState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuizState::NotAttempted => "not_attempted",
            QuizState::PassedNoAttempts => "passed_no_attempts",
            QuizState::FailedCanRetake => "failed_can_retake",
            QuizState::NoAttemptsLeft => "no_attempts_left",
            QuizState::Rejected => "rejected",
        }
    }
}

/// Remaining attempts. `attemptsAllowed == 0` is `Unlimited` and never goes
/// through arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttemptsLeft {
    Unlimited,
    Finite(u32),
}

impl AttemptsLeft {
    pub fn from_counts(attempts_allowed: u32, attempts_used: u32) -> Self {
        if attempts_allowed == 0 {
            AttemptsLeft::Unlimited
        } else {
            AttemptsLeft::Finite(attempts_allowed.saturating_sub(attempts_used))
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            AttemptsLeft::Unlimited => true,
            AttemptsLeft::Finite(n) => *n > 0,
        }
    }

    fn floor_at_one(self) -> Self {
        match self {
            AttemptsLeft::Finite(n) => AttemptsLeft::Finite(n.max(1)),
            unlimited => unlimited,
        }
    }

    pub fn label(&self) -> String {
        match self {
            AttemptsLeft::Unlimited => "Unlimited".to_string(),
            AttemptsLeft::Finite(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizAction {
    Start,
    Retake,
    ViewResults,
    RequestExtraAttempt,
}

/// Presentation hints layered over server state. They never grant or deny
/// an attempt on their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuizHints {
    /// An extra attempt was just approved; the next status fetch has not landed yet.
    pub extra_granted: bool,
    pub rejected: bool,
    pub request_pending: bool,
    /// The attempts list is older than the server status (or was never
    /// fetched), so a failed outcome cannot be told apart from an unseen pass.
    pub attempts_outdated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizStatusView {
    pub quiz_id: String,
    pub title: String,
    pub state: QuizState,
    pub attempts_used: u32,
    pub attempts_allowed: u32,
    pub attempts_left: AttemptsLeft,
    pub attempts_left_label: String,
    pub best_score: Option<f64>,
    pub passing_score: f64,
    pub extra_request_pending: bool,
    /// False while pass/fail cannot be derived; only results are offered then.
    pub outcome_known: bool,
    pub actions: Vec<QuizAction>,
}

/// Highest-scoring attempt; ties keep the earliest in list order.
pub fn best_attempt(attempts: &[QuizAttempt]) -> Option<&QuizAttempt> {
    let (first, rest) = attempts.split_first()?;
    Some(rest.iter().fold(first, |best, attempt| {
        if attempt.score > best.score {
            attempt
        } else {
            best
        }
    }))
}

pub fn resolve(
    quiz: &Quiz,
    attempts: &[QuizAttempt],
    server: Option<&QuizServerStatus>,
    hints: QuizHints,
) -> QuizStatusView {
    let attempts_allowed = server
        .map(|s| s.attempts_allowed)
        .unwrap_or(quiz.attempts_allowed);
    let attempts_used = server
        .map(|s| s.attempts_used)
        .unwrap_or(attempts.len() as u32);

    let remaining = match (attempts_allowed, server.and_then(|s| s.attempts_remaining)) {
        (0, _) => AttemptsLeft::Unlimited,
        (_, Some(n)) => AttemptsLeft::Finite(n),
        (allowed, None) => AttemptsLeft::from_counts(allowed, attempts_used),
    };

    // Server canAttempt wins over local arithmetic
    let permitted = server
        .map(|s| s.can_attempt)
        .unwrap_or_else(|| remaining.is_available());

    let attempts_left = if hints.extra_granted {
        remaining.floor_at_one()
    } else {
        remaining
    };

    let best_score = best_attempt(attempts).map(|a| a.score);
    let passed = best_score.is_some_and(|score| score >= quiz.passing_score);
    // A pass seen in an older list still counts; a fail does not
    let outcome_known = passed
        || !hints.attempts_outdated
        || server.is_some_and(|s| s.attempts_used == 0);

    let state = if attempts_used == 0 && permitted {
        QuizState::NotAttempted
    } else if passed {
        QuizState::PassedNoAttempts
    } else if permitted {
        QuizState::FailedCanRetake
    } else if hints.rejected {
        QuizState::Rejected
    } else {
        QuizState::NoAttemptsLeft
    };

    let actions = match state {
        _ if !outcome_known => vec![QuizAction::ViewResults],
        QuizState::NotAttempted => vec![QuizAction::Start],
        QuizState::PassedNoAttempts => vec![QuizAction::ViewResults],
        QuizState::FailedCanRetake => vec![QuizAction::Retake, QuizAction::ViewResults],
        QuizState::NoAttemptsLeft if hints.request_pending => vec![QuizAction::ViewResults],
        QuizState::NoAttemptsLeft => {
            vec![QuizAction::RequestExtraAttempt, QuizAction::ViewResults]
        }
        QuizState::Rejected => Vec::new(),
    };

    QuizStatusView {
        quiz_id: quiz.id.clone(),
        title: quiz.title.clone(),
        state,
        attempts_used,
        attempts_allowed,
        attempts_left,
        attempts_left_label: attempts_left.label(),
        best_score,
        passing_score: quiz.passing_score,
        extra_request_pending: hints.request_pending,
        outcome_known,
        actions,
    }
}
