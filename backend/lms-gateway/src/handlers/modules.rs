use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middlewares::auth::AuthContext;
use crate::models::progress::ModuleAccess;
use crate::models::Envelope;
use crate::services::module_access;
use crate::services::AppState;

/// GET /api/courses/{course_id}/modules/access
pub async fn list_access(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(course_id): Path<String>,
) -> ApiResult<Json<Envelope<Vec<ModuleAccess>>>> {
    let modules = module_access::resolve_course(state.lms.as_ref(), &auth.token, &course_id).await?;
    Ok(Json(Envelope::ok(modules)))
}

/// POST /api/courses/{course_id}/modules/{module_id}/open
pub async fn open_module(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((course_id, module_id)): Path<(String, String)>,
) -> ApiResult<Json<Envelope<ModuleAccess>>> {
    let access =
        module_access::open_module(state.lms.as_ref(), &auth.token, &course_id, &module_id).await?;
    tracing::info!(
        "Module opened: course={}, module={}, user={}",
        course_id,
        module_id,
        auth.user_id()
    );
    Ok(Json(Envelope::ok(access)))
}
