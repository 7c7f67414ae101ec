#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    extract::{Path, State},
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use lms_gateway::{
    config::Config,
    create_router,
    middlewares::auth::{JwtClaims, JwtService},
    services::AppState,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub const TEST_SECRET: &str = "integration-test-secret";
pub const STUDENT: &str = "student-1";

/// Upstream LMS data served by the mock server.
#[derive(Default)]
pub struct MockState {
    pub quizzes: Vec<Value>,
    pub statuses: HashMap<String, Value>,
    pub attempts: HashMap<String, Vec<Value>>,
    pub extra_requests: Vec<Value>,
    pub start_rejection: Option<(u16, String)>,
    pub modules: Vec<Value>,
    pub completed: Vec<String>,
    pub access: HashMap<String, Value>,
    pub notifications: Vec<Value>,
    pub deadlines: Vec<Value>,
    pub violations: Vec<Value>,
    /// Endpoint keys answered with HTTP 500.
    pub failing: HashSet<String>,
    pub expired_session: bool,
    pub submissions: Vec<Value>,
    pub created_quizzes: Vec<Value>,
    pub level_updates: Vec<Value>,
    pub marked_read: Vec<String>,
    pub calls: usize,
}

#[derive(Clone, Default)]
pub struct MockLms(Arc<Mutex<MockState>>);

impl MockLms {
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn add_quiz(&self, id: &str, title: &str, passing_score: f64, attempts_allowed: u32) {
        self.with(|s| {
            s.quizzes.push(json!({
                "_id": id,
                "title": title,
                "courseId": "course-1",
                "passingScore": passing_score,
                "attemptsAllowed": attempts_allowed,
                "questions": [
                    { "_id": format!("{}-q1", id), "questionText": "2 + 2?", "options": ["3", "4"] },
                    { "_id": format!("{}-q2", id), "questionText": "Capital of France?", "options": ["Paris", "Rome"] },
                    { "_id": format!("{}-q3", id), "questionText": "Rust is memory safe", "questionType": "true_false" }
                ]
            }))
        });
    }

    pub fn set_status(&self, quiz_id: &str, allowed: u32, used: u32, can_attempt: bool) {
        let remaining = if allowed == 0 {
            Value::Null
        } else {
            json!(allowed.saturating_sub(used))
        };
        self.with(|s| {
            s.statuses.insert(
                quiz_id.to_string(),
                json!({
                    "attemptsAllowed": allowed,
                    "attemptsUsed": used,
                    "attemptsRemaining": remaining,
                    "canAttempt": can_attempt
                }),
            )
        });
    }

    pub fn set_attempts(&self, quiz_id: &str, scores: &[f64]) {
        let attempts = scores
            .iter()
            .enumerate()
            .map(|(i, score)| {
                json!({
                    "_id": format!("{}-attempt-{}", quiz_id, i),
                    "quizId": quiz_id,
                    "score": score,
                    "submittedAt": Utc::now().to_rfc3339()
                })
            })
            .collect();
        self.with(|s| s.attempts.insert(quiz_id.to_string(), attempts));
    }

    pub fn add_extra_request(&self, id: &str, student: &str, quiz_id: &str, status: &str) {
        self.with(|s| {
            s.extra_requests.push(json!({
                "_id": id,
                "studentId": student,
                "quizId": quiz_id,
                "status": status,
                "createdAt": Utc::now().to_rfc3339()
            }))
        });
    }

    pub fn fail(&self, endpoint: &str) {
        self.with(|s| s.failing.insert(endpoint.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.with(|s| s.calls)
    }
}

fn envelope(data: Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn reject(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "success": false, "message": message })),
    )
        .into_response()
}

/// Common gate: bearer token present, session not expired, endpoint healthy.
fn gate(lms: &MockLms, headers: &HeaderMap, endpoint: &str) -> Option<Response> {
    lms.with(|s| {
        s.calls += 1;
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer "));
        if !authorized || s.expired_session {
            return Some(reject(StatusCode::UNAUTHORIZED, "Token expired"));
        }
        if s.failing.contains(endpoint) {
            return Some(reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"));
        }
        None
    })
}

async fn course_quizzes(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "quizzes") {
        return r;
    }
    envelope(lms.with(|s| json!(s.quizzes)))
}

async fn get_quiz(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "quiz") {
        return r;
    }
    match lms.with(|s| s.quizzes.iter().find(|q| q["_id"] == id.as_str()).cloned()) {
        Some(quiz) => envelope(quiz),
        None => reject(StatusCode::NOT_FOUND, "Quiz not found"),
    }
}

async fn create_quiz(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "create_quiz") {
        return r;
    }
    let mut quiz = body.clone();
    quiz["_id"] = json!("quiz-created");
    quiz["questions"] = json!([]);
    lms.with(|s| s.created_quizzes.push(body));
    (StatusCode::CREATED, Json(json!({ "success": true, "data": quiz }))).into_response()
}

async fn attempt_status(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, &format!("status:{}", id)) {
        return r;
    }
    match lms.with(|s| s.statuses.get(&id).cloned()) {
        Some(status) => envelope(status),
        None => reject(StatusCode::NOT_FOUND, "Quiz not found"),
    }
}

async fn my_attempts(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, &format!("attempts:{}", id)) {
        return r;
    }
    envelope(lms.with(|s| json!(s.attempts.get(&id).cloned().unwrap_or_default())))
}

async fn start_attempt(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "start") {
        return r;
    }
    if let Some((status, message)) = lms.with(|s| s.start_rejection.clone()) {
        return reject(
            StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN),
            &message,
        );
    }
    match lms.with(|s| s.quizzes.iter().find(|q| q["_id"] == id.as_str()).cloned()) {
        Some(quiz) => envelope(json!({ "canAttempt": true, "quiz": quiz })),
        None => reject(StatusCode::NOT_FOUND, "Quiz not found"),
    }
}

async fn submit_attempt(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "submit") {
        return r;
    }
    let answers = body["answers"].as_array().cloned().unwrap_or_default();
    let answered = answers.iter().filter(|a| !a.is_null()).count();
    let score = if answers.is_empty() {
        0.0
    } else {
        answered as f64 * 100.0 / answers.len() as f64
    };
    lms.with(|s| s.submissions.push(body));
    envelope(json!({
        "attemptId": "attempt-graded",
        "score": score,
        "passed": score >= 70.0,
        "attemptsRemaining": 1
    }))
}

async fn request_extra(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "request_extra") {
        return r;
    }
    let request = json!({
        "_id": format!("request-{}", lms.with(|s| s.extra_requests.len() + 1)),
        "studentId": STUDENT,
        "quizId": body["quizId"],
        "status": "pending",
        "reason": body.get("reason").cloned().unwrap_or(Value::Null),
        "createdAt": Utc::now().to_rfc3339()
    });
    lms.with(|s| s.extra_requests.push(request.clone()));
    (StatusCode::CREATED, Json(json!({ "success": true, "data": request }))).into_response()
}

async fn my_extra_requests(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "extra_requests") {
        return r;
    }
    envelope(lms.with(|s| json!(s.extra_requests)))
}

async fn review_extra(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "review") {
        return r;
    }
    let updated = lms.with(|s| {
        s.extra_requests
            .iter_mut()
            .find(|r| r["_id"] == id.as_str())
            .map(|r| {
                r["status"] = body["status"].clone();
                r.clone()
            })
    });
    match updated {
        Some(request) => envelope(request),
        None => reject(StatusCode::NOT_FOUND, "Request not found"),
    }
}

async fn course_modules(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "modules") {
        return r;
    }
    envelope(lms.with(|s| json!(s.modules)))
}

async fn course_progress(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "progress") {
        return r;
    }
    envelope(lms.with(|s| json!({ "completedModuleIds": s.completed, "level": 2 })))
}

async fn timeline_access(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path((_course, module)): Path<(String, String)>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, &format!("access:{}", module)) {
        return r;
    }
    match lms.with(|s| s.access.get(&module).cloned()) {
        Some(access) => envelope(access),
        None => reject(StatusCode::NOT_FOUND, "Module not found"),
    }
}

async fn set_level(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "set_level") {
        return r;
    }
    lms.with(|s| s.level_updates.push(body.clone()));
    envelope(json!({
        "studentId": body["studentId"],
        "courseId": body["courseId"],
        "level": body["level"],
        "locked": body["lock"]
    }))
}

async fn notifications(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "notifications") {
        return r;
    }
    envelope(lms.with(|s| json!(s.notifications)))
}

async fn upcoming(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "upcoming") {
        return r;
    }
    envelope(lms.with(|s| json!(s.deadlines)))
}

async fn violations(State(lms): State<MockLms>, headers: HeaderMap) -> Response {
    if let Some(r) = gate(&lms, &headers, "violations") {
        return r;
    }
    envelope(lms.with(|s| json!(s.violations)))
}

async fn mark_read(
    State(lms): State<MockLms>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Some(r) = gate(&lms, &headers, "mark_read") {
        return r;
    }
    lms.with(|s| s.marked_read.push(id));
    Json(json!({ "success": true, "message": "Marked as read" })).into_response()
}

fn mock_router(lms: MockLms) -> Router {
    Router::new()
        .route("/api/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/api/quizzes", post(create_quiz))
        .route("/api/quizzes/course/{course_id}", get(course_quizzes))
        .route("/api/quizzes/{quiz_id}", get(get_quiz))
        .route("/api/attempts/status/{quiz_id}", get(attempt_status))
        .route("/api/attempts/my/{quiz_id}", get(my_attempts))
        .route("/api/attempts/start/{quiz_id}", post(start_attempt))
        .route("/api/attempts/submit", post(submit_attempt))
        .route("/api/attempts/request-extra", post(request_extra))
        .route("/api/attempts/extra-requests/my", get(my_extra_requests))
        .route("/api/attempts/extra-requests/{request_id}", patch(review_extra))
        .route("/api/courses/{course_id}/modules", get(course_modules))
        .route("/api/progress/{course_id}", get(course_progress))
        .route(
            "/api/progress/timeline-access/{course_id}/{module_id}",
            get(timeline_access),
        )
        .route("/api/progress/admin/set-level", patch(set_level))
        .route(
            "/api/module-timelines/notifications/{id}",
            get(notifications),
        )
        .route(
            "/api/module-timelines/notifications/{id}/read",
            patch(mark_read),
        )
        .route("/api/module-timelines/upcoming/{course_id}", get(upcoming))
        .route("/api/module-timelines/violations/{course_id}", get(violations))
        .with_state(lms)
}

async fn spawn_mock_lms(lms: MockLms) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, mock_router(lms)).await.unwrap();
    });
    format!("http://{}", addr)
}

pub fn test_config(lms_api_url: &str) -> Config {
    Config {
        lms_api_url: lms_api_url.to_string(),
        jwt_secret: TEST_SECRET.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        request_timeout_ms: 2000,
        status_poll_interval_secs: 30,
        timer_tick_interval_ms: 50,
        metrics_auth: "metrics:secret".to_string(),
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub lms: MockLms,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let lms = MockLms::default();
        let url = spawn_mock_lms(lms.clone()).await;
        Self::with_config(test_config(&url), lms)
    }

    pub fn with_config(config: Config, lms: MockLms) -> Self {
        let state = Arc::new(AppState::new(config).expect("Failed to initialize test app state"));
        Self {
            router: create_router(state.clone()),
            state,
            lms,
        }
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(build_request(method, uri, token, body))
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            json!({ "raw": String::from_utf8_lossy(&bytes).to_string() })
        });
        (status, json)
    }
}

pub fn build_request(
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn token_for(user_id: &str, role: &str) -> String {
    let now = Utc::now().timestamp();
    JwtService::new(TEST_SECRET)
        .generate_token(&JwtClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (now + 3600) as usize,
            iat: now as usize,
        })
        .unwrap()
}

pub fn student_token() -> String {
    token_for(STUDENT, "student")
}

pub fn instructor_token() -> String {
    token_for("instructor-1", "instructor")
}
