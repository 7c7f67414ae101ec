use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events pushed on `GET /api/attempts/{run_id}/stream`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AttemptEvent {
    TimerTick(TimerTick),
    TimeExpired(TimeExpired),
    AttemptFinished(AttemptFinished),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimerTick {
    pub run_id: String,
    /// `None` for untimed quizzes.
    pub remaining_seconds: Option<u64>,
    pub elapsed_seconds: u64,
    pub total_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeExpired {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttemptFinished {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub score: Option<f64>,
    pub passed: Option<bool>,
}

impl AttemptEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            AttemptEvent::TimerTick(_) => "timer-tick",
            AttemptEvent::TimeExpired(_) => "time-expired",
            AttemptEvent::AttemptFinished(_) => "attempt-finished",
        }
    }
}
