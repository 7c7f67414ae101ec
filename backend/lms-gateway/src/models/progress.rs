use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseModule {
    #[serde(alias = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub order: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    #[serde(default)]
    pub completed_module_ids: Vec<String>,
    #[serde(default)]
    pub level: Option<u8>,
}

/// `GET /api/progress/timeline-access/:courseId/:moduleId`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineAccess {
    pub has_access: bool,
    #[serde(default)]
    pub is_timeline_restricted: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub current_accessible_module_index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Completed,
    Available,
    /// Previous module not completed yet.
    Locked,
    /// Deadline or release window not open.
    TimelineLocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleAccess {
    pub module_id: String,
    pub title: String,
    pub order: u32,
    pub status: ModuleStatus,
    pub has_access: bool,
    pub is_timeline_restricted: bool,
    pub reason: Option<String>,
    pub current_accessible_module_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetLevelRequest {
    #[validate(length(min = 1, message = "Student is required"))]
    pub student_id: String,

    #[validate(length(min = 1, message = "Course is required"))]
    pub course_id: String,

    #[validate(range(min = 1, max = 5, message = "Level must be between 1 and 5"))]
    pub level: u8,

    /// Protects the assigned level from automatic promotion.
    #[serde(default)]
    pub lock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelAssignment {
    pub student_id: String,
    pub course_id: String,
    pub level: u8,
    #[serde(default)]
    pub locked: bool,
}
