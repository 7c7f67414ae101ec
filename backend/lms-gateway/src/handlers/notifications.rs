use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middlewares::auth::AuthContext;
use crate::models::notification::Feed;
use crate::models::Envelope;
use crate::services::notification_aggregator::build_feed;
use crate::services::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissResponse {
    pub item_id: String,
    pub already_dismissed: bool,
}

/// GET /api/courses/{course_id}/feed
pub async fn course_feed(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(course_id): Path<String>,
) -> Json<Envelope<Feed>> {
    let dismissed = state.dismissals.dismissed_for(auth.user_id(), Utc::now());
    let feed = build_feed(
        state.lms.as_ref(),
        &auth.token,
        &course_id,
        &dismissed,
        Utc::now(),
    )
    .await;

    if feed.degraded_sources.is_empty() {
        Json(Envelope::ok(feed))
    } else {
        Json(Envelope::ok_with_message(
            feed,
            "Some notification sources are unavailable",
        ))
    }
}

/// POST /api/courses/{course_id}/feed/{item_id}/dismiss
///
/// Local to this gateway; nothing is sent upstream. Dismissals are bounded
/// per student and expire.
pub async fn dismiss_item(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((_course_id, item_id)): Path<(String, String)>,
) -> Json<Envelope<DismissResponse>> {
    let newly = state
        .dismissals
        .dismiss(auth.user_id(), &item_id, Utc::now());
    Json(Envelope::ok(DismissResponse {
        item_id,
        already_dismissed: !newly,
    }))
}

/// POST /api/notifications/{notification_id}/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(notification_id): Path<String>,
) -> ApiResult<Json<Envelope<()>>> {
    state
        .lms
        .mark_notification_read(&auth.token, &notification_id)
        .await
        .inspect_err(|e| {
            tracing::error!("Marking notification {} read failed: {}", notification_id, e)
        })?;
    Ok(Json(Envelope::ok_with_message((), "Notification marked as read")))
}
