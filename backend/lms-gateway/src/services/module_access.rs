use futures::future::join_all;
use std::collections::HashSet;

use crate::error::{ApiError, ApiResult};
use crate::models::progress::{CourseModule, ModuleAccess, ModuleStatus, TimelineAccess};
use crate::services::lms_client::LmsApi;

pub const ACCESS_CHECK_FAILED: &str = "Error checking access";

/// Combines one module's access response with local completion state.
/// Completion dominates whatever the access check said.
pub fn combine(
    module: &CourseModule,
    completed: bool,
    access: Result<TimelineAccess, ApiError>,
) -> ModuleAccess {
    let base = ModuleAccess {
        module_id: module.id.clone(),
        title: module.title.clone(),
        order: module.order,
        status: ModuleStatus::Locked,
        has_access: false,
        is_timeline_restricted: false,
        reason: None,
        current_accessible_module_index: None,
    };

    match (completed, access) {
        (true, access) => ModuleAccess {
            status: ModuleStatus::Completed,
            has_access: true,
            current_accessible_module_index: access
                .ok()
                .and_then(|a| a.current_accessible_module_index),
            ..base
        },
        (false, Err(_)) => ModuleAccess {
            reason: Some(ACCESS_CHECK_FAILED.to_string()),
            ..base
        },
        (false, Ok(access)) => {
            let status = if access.has_access {
                ModuleStatus::Available
            } else if access.is_timeline_restricted {
                ModuleStatus::TimelineLocked
            } else {
                ModuleStatus::Locked
            };
            ModuleAccess {
                status,
                has_access: access.has_access,
                is_timeline_restricted: access.is_timeline_restricted,
                reason: access.reason,
                current_accessible_module_index: access.current_accessible_module_index,
                ..base
            }
        }
    }
}

/// Resolves every module in course order. Access checks run concurrently and
/// a failed check degrades only its own module.
pub async fn resolve_modules(
    lms: &dyn LmsApi,
    token: &str,
    course_id: &str,
    mut modules: Vec<CourseModule>,
    completed_module_ids: &[String],
) -> Vec<ModuleAccess> {
    modules.sort_by_key(|m| m.order);
    let completed: HashSet<&str> = completed_module_ids.iter().map(String::as_str).collect();

    let checks = modules
        .iter()
        .map(|module| lms.timeline_access(token, course_id, &module.id));
    let results = join_all(checks).await;

    modules
        .iter()
        .zip(results)
        .map(|(module, access)| {
            if let Err(e) = &access {
                tracing::warn!(
                    "Timeline access check failed for course={} module={}: {}",
                    course_id,
                    module.id,
                    e
                );
            }
            combine(module, completed.contains(module.id.as_str()), access)
        })
        .collect()
}

pub async fn resolve_course(
    lms: &dyn LmsApi,
    token: &str,
    course_id: &str,
) -> ApiResult<Vec<ModuleAccess>> {
    let (modules, progress) = tokio::try_join!(
        lms.course_modules(token, course_id),
        lms.course_progress(token, course_id)
    )?;

    Ok(resolve_modules(lms, token, course_id, modules, &progress.completed_module_ids).await)
}

/// Click-through guard. Both lock kinds block; only the message differs.
pub fn check_click(access: &ModuleAccess) -> Result<(), String> {
    match access.status {
        ModuleStatus::Completed | ModuleStatus::Available => Ok(()),
        ModuleStatus::TimelineLocked => Err(format!(
            "This module is not open yet: {}",
            access
                .reason
                .as_deref()
                .unwrap_or("it is restricted by the course timeline")
        )),
        ModuleStatus::Locked if access.reason.as_deref() == Some(ACCESS_CHECK_FAILED) => {
            Err("Could not verify access to this module, please try again".to_string())
        }
        ModuleStatus::Locked => Err("Complete the previous module to unlock this one".to_string()),
    }
}

pub async fn open_module(
    lms: &dyn LmsApi,
    token: &str,
    course_id: &str,
    module_id: &str,
) -> ApiResult<ModuleAccess> {
    let modules = resolve_course(lms, token, course_id).await?;
    let access = modules
        .into_iter()
        .find(|m| m.module_id == module_id)
        .ok_or_else(|| ApiError::NotFound(format!("Module {} not found in course", module_id)))?;

    check_click(&access).map_err(ApiError::Forbidden)?;
    Ok(access)
}
