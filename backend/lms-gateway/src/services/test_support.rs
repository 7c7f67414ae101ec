//! In-memory [`LmsApi`] for unit tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{ApiError, ApiResult};
use crate::models::notification::{TimelineNotification, UpcomingDeadline, ViolationRecord};
use crate::models::progress::{
    CourseModule, CourseProgress, LevelAssignment, SetLevelRequest, TimelineAccess,
};
use crate::models::quiz::{
    AttemptResult, CreateQuizRequest, ExtraAttemptRequest, ExtraRequestStatus, Quiz, QuizAttempt,
    QuizServerStatus, RequestExtraAttemptBody, StartAttemptResponse, SubmitAttemptRequest,
};
use crate::services::lms_client::LmsApi;

#[derive(Default)]
struct FakeState {
    quizzes: Vec<Quiz>,
    statuses: HashMap<String, QuizServerStatus>,
    failing_status: HashSet<String>,
    status_calls: HashMap<String, usize>,
    attempts: HashMap<String, Vec<QuizAttempt>>,
    failing_attempts: HashSet<String>,
    extra_requests: Vec<ExtraAttemptRequest>,
    start: Option<StartAttemptResponse>,
    submit_failures: usize,
    submissions: Vec<SubmitAttemptRequest>,
    modules: Vec<CourseModule>,
    completed: Vec<String>,
    access: HashMap<String, TimelineAccess>,
    failing_access: HashSet<String>,
    notifications: Vec<TimelineNotification>,
    deadlines: Vec<UpcomingDeadline>,
    violations: Vec<ViolationRecord>,
    failing_sources: HashSet<&'static str>,
    marked_read: Vec<String>,
}

#[derive(Default)]
pub struct FakeLms {
    state: Mutex<FakeState>,
}

fn down() -> ApiError {
    ApiError::Network("connection refused".to_string())
}

impl FakeLms {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_quiz(&self, quiz: Quiz) {
        self.with(|s| s.quizzes.push(quiz));
    }

    pub fn set_status(&self, quiz_id: &str, status: QuizServerStatus) {
        self.with(|s| {
            s.failing_status.remove(quiz_id);
            s.statuses.insert(quiz_id.to_string(), status);
        });
    }

    pub fn fail_status(&self, quiz_id: &str) {
        self.with(|s| s.failing_status.insert(quiz_id.to_string()));
    }

    pub fn status_calls(&self, quiz_id: &str) -> usize {
        self.with(|s| s.status_calls.get(quiz_id).copied().unwrap_or(0))
    }

    pub fn set_attempts(&self, quiz_id: &str, scores: &[f64]) {
        let attempts = scores
            .iter()
            .enumerate()
            .map(|(i, score)| QuizAttempt {
                id: format!("{}-attempt-{}", quiz_id, i),
                quiz_id: quiz_id.to_string(),
                score: *score,
                submitted_at: Utc::now() - ChronoDuration::minutes((scores.len() - i) as i64),
            })
            .collect();
        self.with(|s| s.attempts.insert(quiz_id.to_string(), attempts));
    }

    pub fn fail_attempts(&self, quiz_id: &str) {
        self.with(|s| s.failing_attempts.insert(quiz_id.to_string()));
    }

    pub fn restore_attempts(&self, quiz_id: &str) {
        self.with(|s| s.failing_attempts.remove(quiz_id));
    }

    pub fn add_extra_request(&self, student_id: &str, quiz_id: &str, status: ExtraRequestStatus) {
        self.with(|s| {
            let id = format!("request-{}", s.extra_requests.len() + 1);
            s.extra_requests.push(ExtraAttemptRequest {
                id,
                student_id: student_id.to_string(),
                quiz_id: quiz_id.to_string(),
                status,
                reason: None,
                created_at: Some(Utc::now()),
            });
        });
    }

    pub fn set_start(&self, response: StartAttemptResponse) {
        self.with(|s| s.start = Some(response));
    }

    pub fn fail_next_submits(&self, count: usize) {
        self.with(|s| s.submit_failures = count);
    }

    pub fn submissions(&self) -> Vec<SubmitAttemptRequest> {
        self.with(|s| s.submissions.clone())
    }

    pub fn set_modules(&self, modules: Vec<CourseModule>) {
        self.with(|s| s.modules = modules);
    }

    pub fn set_completed(&self, ids: &[&str]) {
        self.with(|s| s.completed = ids.iter().map(|id| id.to_string()).collect());
    }

    pub fn set_access(&self, module_id: &str, access: TimelineAccess) {
        self.with(|s| s.access.insert(module_id.to_string(), access));
    }

    pub fn fail_access(&self, module_id: &str) {
        self.with(|s| s.failing_access.insert(module_id.to_string()));
    }

    pub fn set_notifications(&self, items: Vec<TimelineNotification>) {
        self.with(|s| s.notifications = items);
    }

    pub fn set_deadlines(&self, items: Vec<UpcomingDeadline>) {
        self.with(|s| s.deadlines = items);
    }

    pub fn set_violations(&self, items: Vec<ViolationRecord>) {
        self.with(|s| s.violations = items);
    }

    /// `source` is one of `notifications`, `deadlines`, `violations`.
    pub fn fail_source(&self, source: &'static str) {
        self.with(|s| s.failing_sources.insert(source));
    }

    pub fn marked_read(&self) -> Vec<String> {
        self.with(|s| s.marked_read.clone())
    }
}

#[async_trait]
impl LmsApi for FakeLms {
    async fn course_quizzes(&self, _token: &str, course_id: &str) -> ApiResult<Vec<Quiz>> {
        Ok(self.with(|s| {
            s.quizzes
                .iter()
                .filter(|q| q.course_id.as_deref() == Some(course_id))
                .cloned()
                .collect()
        }))
    }

    async fn quiz(&self, _token: &str, quiz_id: &str) -> ApiResult<Quiz> {
        self.with(|s| s.quizzes.iter().find(|q| q.id == quiz_id).cloned())
            .ok_or_else(|| ApiError::rejection(404, "Quiz not found"))
    }

    async fn create_quiz(&self, _token: &str, req: &CreateQuizRequest) -> ApiResult<Quiz> {
        let quiz = Quiz {
            id: "created-quiz".to_string(),
            title: req.title.clone(),
            course_id: Some(req.course_id.clone()),
            module_id: req.module_id.clone(),
            passing_score: req.passing_score,
            time_limit: req.time_limit,
            attempts_allowed: req.attempts_allowed,
            questions: Vec::new(),
        };
        self.add_quiz(quiz.clone());
        Ok(quiz)
    }

    async fn quiz_status(&self, _token: &str, quiz_id: &str) -> ApiResult<QuizServerStatus> {
        self.with(|s| {
            *s.status_calls.entry(quiz_id.to_string()).or_default() += 1;
            if s.failing_status.contains(quiz_id) {
                return Err(down());
            }
            s.statuses
                .get(quiz_id)
                .cloned()
                .ok_or_else(|| ApiError::rejection(404, "Quiz not found"))
        })
    }

    async fn quiz_attempts(&self, _token: &str, quiz_id: &str) -> ApiResult<Vec<QuizAttempt>> {
        self.with(|s| {
            if s.failing_attempts.contains(quiz_id) {
                return Err(down());
            }
            Ok(s.attempts.get(quiz_id).cloned().unwrap_or_default())
        })
    }

    async fn start_attempt(&self, _token: &str, quiz_id: &str) -> ApiResult<StartAttemptResponse> {
        self.with(|s| {
            if let Some(start) = &s.start {
                return Ok(start.clone());
            }
            let quiz = s
                .quizzes
                .iter()
                .find(|q| q.id == quiz_id)
                .cloned()
                .ok_or_else(|| ApiError::rejection(404, "Quiz not found"))?;
            Ok(StartAttemptResponse {
                can_attempt: true,
                reason: None,
                quiz: Some(quiz),
            })
        })
    }

    async fn submit_attempt(
        &self,
        _token: &str,
        req: &SubmitAttemptRequest,
    ) -> ApiResult<AttemptResult> {
        self.with(|s| {
            s.submissions.push(req.clone());
            if s.submit_failures > 0 {
                s.submit_failures -= 1;
                return Err(down());
            }
            let answered = req.answers.iter().filter(|a| a.is_some()).count();
            let score = if req.answers.is_empty() {
                0.0
            } else {
                answered as f64 * 100.0 / req.answers.len() as f64
            };
            Ok(AttemptResult {
                attempt_id: Some(format!("attempt-{}", s.submissions.len())),
                score,
                passed: score >= 70.0,
                attempts_remaining: Some(0),
                detailed_answers: Vec::new(),
            })
        })
    }

    async fn request_extra_attempt(
        &self,
        _token: &str,
        body: &RequestExtraAttemptBody,
    ) -> ApiResult<ExtraAttemptRequest> {
        self.add_extra_request("student-1", &body.quiz_id, ExtraRequestStatus::Pending);
        Ok(self.with(|s| s.extra_requests.last().cloned().unwrap()))
    }

    async fn my_extra_requests(&self, _token: &str) -> ApiResult<Vec<ExtraAttemptRequest>> {
        Ok(self.with(|s| s.extra_requests.clone()))
    }

    async fn review_extra_request(
        &self,
        _token: &str,
        request_id: &str,
        status: ExtraRequestStatus,
    ) -> ApiResult<ExtraAttemptRequest> {
        self.with(|s| {
            let request = s
                .extra_requests
                .iter_mut()
                .find(|r| r.id == request_id)
                .ok_or_else(|| ApiError::rejection(404, "Request not found"))?;
            request.status = status;
            Ok(request.clone())
        })
    }

    async fn course_modules(&self, _token: &str, _course_id: &str) -> ApiResult<Vec<CourseModule>> {
        Ok(self.with(|s| s.modules.clone()))
    }

    async fn course_progress(&self, _token: &str, _course_id: &str) -> ApiResult<CourseProgress> {
        Ok(self.with(|s| CourseProgress {
            completed_module_ids: s.completed.clone(),
            level: None,
        }))
    }

    async fn timeline_access(
        &self,
        _token: &str,
        _course_id: &str,
        module_id: &str,
    ) -> ApiResult<TimelineAccess> {
        self.with(|s| {
            if s.failing_access.contains(module_id) {
                return Err(down());
            }
            s.access
                .get(module_id)
                .cloned()
                .ok_or_else(|| ApiError::rejection(404, "Module not found"))
        })
    }

    async fn set_level(&self, _token: &str, req: &SetLevelRequest) -> ApiResult<LevelAssignment> {
        Ok(LevelAssignment {
            student_id: req.student_id.clone(),
            course_id: req.course_id.clone(),
            level: req.level,
            locked: req.lock,
        })
    }

    async fn timeline_notifications(
        &self,
        _token: &str,
        _course_id: &str,
    ) -> ApiResult<Vec<TimelineNotification>> {
        self.with(|s| {
            if s.failing_sources.contains("notifications") {
                return Err(down());
            }
            Ok(s.notifications.clone())
        })
    }

    async fn upcoming_deadlines(
        &self,
        _token: &str,
        _course_id: &str,
    ) -> ApiResult<Vec<UpcomingDeadline>> {
        self.with(|s| {
            if s.failing_sources.contains("deadlines") {
                return Err(down());
            }
            Ok(s.deadlines.clone())
        })
    }

    async fn violation_history(
        &self,
        _token: &str,
        _course_id: &str,
    ) -> ApiResult<Vec<ViolationRecord>> {
        self.with(|s| {
            if s.failing_sources.contains("violations") {
                return Err(down());
            }
            Ok(s.violations.clone())
        })
    }

    async fn mark_notification_read(&self, _token: &str, notification_id: &str) -> ApiResult<()> {
        self.with(|s| s.marked_read.push(notification_id.to_string()));
        Ok(())
    }

    async fn ping(&self) -> ApiResult<()> {
        Ok(())
    }
}
