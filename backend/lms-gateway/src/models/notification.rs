use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-pushed timeline notification (`GET /api/module-timelines/notifications/:courseId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineNotification {
    #[serde(alias = "_id")]
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingDeadline {
    #[serde(alias = "_id")]
    pub id: String,
    pub module_id: String,
    pub module_title: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub module_id: String,
    pub module_title: String,
    pub violated_at: DateTime<Utc>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Overdue,
    Critical,
    Urgent,
    Warning,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    Notification,
    Deadline,
    Violation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub source: FeedSource,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub urgency: Option<Urgency>,
    pub is_read: bool,
    /// Only server notifications can be marked as read upstream.
    pub can_mark_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub items: Vec<FeedItem>,
    pub dismissed_count: usize,
    pub degraded_sources: Vec<FeedSource>,
}
