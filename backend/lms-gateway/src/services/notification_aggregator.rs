use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use crate::error::ApiResult;
use crate::models::notification::{
    Feed, FeedItem, FeedSource, TimelineNotification, UpcomingDeadline, Urgency, ViolationRecord,
};
use crate::services::lms_client::LmsApi;

pub fn classify_urgency(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Urgency {
    let left = deadline - now;
    if left <= Duration::zero() {
        Urgency::Overdue
    } else if left < Duration::hours(1) {
        Urgency::Critical
    } else if left < Duration::hours(24) {
        Urgency::Urgent
    } else if left < Duration::hours(72) {
        Urgency::Warning
    } else {
        Urgency::Normal
    }
}

fn deadline_message(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let left = deadline - now;
    if left <= Duration::zero() {
        return format!("Overdue since {}", deadline.format("%Y-%m-%d %H:%M UTC"));
    }
    if left.num_days() >= 1 {
        format!("Due in {} day(s)", left.num_days())
    } else if left.num_hours() >= 1 {
        format!("Due in {} hour(s)", left.num_hours())
    } else {
        format!("Due in {} minute(s)", left.num_minutes().max(1))
    }
}

/// Merges the three sources into one feed.
///
/// Order is notifications as served, then deadlines soonest first, then
/// violations newest first. Ids are unique within the result; the first
/// occurrence wins.
pub fn merge_feed(
    notifications: Vec<TimelineNotification>,
    mut deadlines: Vec<UpcomingDeadline>,
    mut violations: Vec<ViolationRecord>,
    now: DateTime<Utc>,
) -> Vec<FeedItem> {
    deadlines.sort_by_key(|d| d.deadline);
    violations.sort_by(|a, b| b.violated_at.cmp(&a.violated_at));

    let notification_items = notifications.into_iter().map(|n| FeedItem {
        id: n.id,
        source: FeedSource::Notification,
        title: n.title,
        message: n.message,
        timestamp: n.created_at,
        urgency: None,
        is_read: n.is_read,
        can_mark_read: true,
    });

    let deadline_items = deadlines.into_iter().map(|d| FeedItem {
        id: d.id,
        source: FeedSource::Deadline,
        title: format!("Deadline: {}", d.module_title),
        message: deadline_message(d.deadline, now),
        timestamp: d.deadline,
        urgency: Some(classify_urgency(d.deadline, now)),
        is_read: false,
        can_mark_read: false,
    });

    let violation_items = violations.into_iter().map(|v| FeedItem {
        id: v.id,
        source: FeedSource::Violation,
        title: format!("Timeline violation: {}", v.module_title),
        message: v
            .action
            .unwrap_or_else(|| "Module accessed outside its timeline window".to_string()),
        timestamp: v.violated_at,
        urgency: None,
        is_read: false,
        can_mark_read: false,
    });

    let mut seen = HashSet::new();
    notification_items
        .chain(deadline_items)
        .chain(violation_items)
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}

fn degrade<T>(
    source: FeedSource,
    course_id: &str,
    result: ApiResult<Vec<T>>,
    degraded: &mut Vec<FeedSource>,
) -> Vec<T> {
    result.unwrap_or_else(|e| {
        tracing::warn!(
            "Feed source {:?} unavailable for course {}: {}",
            source,
            course_id,
            e
        );
        degraded.push(source);
        Vec::new()
    })
}

/// Builds the feed for one student. A failing source is left out and listed
/// in `degraded_sources`; dismissed ids are filtered.
pub async fn build_feed(
    lms: &dyn LmsApi,
    token: &str,
    course_id: &str,
    dismissed: &HashSet<String>,
    now: DateTime<Utc>,
) -> Feed {
    let (notifications, deadlines, violations) = tokio::join!(
        lms.timeline_notifications(token, course_id),
        lms.upcoming_deadlines(token, course_id),
        lms.violation_history(token, course_id)
    );

    let mut degraded_sources = Vec::new();
    let notifications = degrade(
        FeedSource::Notification,
        course_id,
        notifications,
        &mut degraded_sources,
    );
    let deadlines = degrade(FeedSource::Deadline, course_id, deadlines, &mut degraded_sources);
    let violations = degrade(
        FeedSource::Violation,
        course_id,
        violations,
        &mut degraded_sources,
    );

    let merged = merge_feed(notifications, deadlines, violations, now);
    let before = merged.len();
    let items: Vec<FeedItem> = merged
        .into_iter()
        .filter(|item| !dismissed.contains(&item.id))
        .collect();

    Feed {
        dismissed_count: before - items.len(),
        items,
        degraded_sources,
    }
}

/// Dismissals older than this are forgotten.
const DISMISSAL_TTL_DAYS: i64 = 30;
/// Per-student cap; the oldest dismissal is evicted first.
const MAX_DISMISSED_PER_STUDENT: usize = 500;

/// Per-student dismissed feed item ids with the time of dismissal. Held in
/// memory only, bounded per student and expired after a TTL.
pub struct DismissalStore {
    dismissed: RwLock<HashMap<String, HashMap<String, DateTime<Utc>>>>,
    ttl: Duration,
    max_per_student: usize,
}

impl Default for DismissalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DismissalStore {
    pub fn new() -> Self {
        Self::with_limits(Duration::days(DISMISSAL_TTL_DAYS), MAX_DISMISSED_PER_STUDENT)
    }

    pub fn with_limits(ttl: Duration, max_per_student: usize) -> Self {
        Self {
            dismissed: RwLock::new(HashMap::new()),
            ttl,
            max_per_student: max_per_student.max(1),
        }
    }

    /// Returns false when the item was already dismissed.
    pub fn dismiss(&self, student_id: &str, item_id: &str, now: DateTime<Utc>) -> bool {
        let mut dismissed = self.dismissed.write().unwrap_or_else(PoisonError::into_inner);
        self.expire(&mut dismissed, now);

        let items = dismissed.entry(student_id.to_string()).or_default();
        if items.contains_key(item_id) {
            return false;
        }
        while items.len() >= self.max_per_student {
            let Some(oldest) = items
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            items.remove(&oldest);
        }
        items.insert(item_id.to_string(), now);
        true
    }

    pub fn dismissed_for(&self, student_id: &str, now: DateTime<Utc>) -> HashSet<String> {
        let cutoff = now - self.ttl;
        self.dismissed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(student_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, at)| **at > cutoff)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of dismissals held across all students.
    pub fn len(&self) -> usize {
        self.dismissed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, dismissed: &mut HashMap<String, HashMap<String, DateTime<Utc>>>, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        dismissed.retain(|_, items| {
            items.retain(|_, at| *at > cutoff);
            !items.is_empty()
        });
    }
}
