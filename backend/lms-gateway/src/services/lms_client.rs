use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{ApiError, ApiResult};
use crate::metrics::track_upstream_call;
use crate::models::{
    envelope::Envelope,
    notification::{TimelineNotification, UpcomingDeadline, ViolationRecord},
    progress::{CourseModule, CourseProgress, LevelAssignment, SetLevelRequest, TimelineAccess},
    quiz::{
        AttemptResult, CreateQuizRequest, ExtraAttemptRequest, ExtraRequestStatus, Quiz,
        QuizAttempt, QuizServerStatus, RequestExtraAttemptBody, ReviewExtraRequestBody,
        StartAttemptResponse, SubmitAttemptRequest,
    },
};
use crate::utils::retry::{retry_if, RetryConfig};

/// Unreserved characters stay as-is inside a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn seg(id: &str) -> String {
    utf8_percent_encode(id, PATH_SEGMENT).to_string()
}

/// Everything the gateway needs from the LMS server. Every call forwards the
/// caller's bearer token.
#[async_trait]
pub trait LmsApi: Send + Sync {
    async fn course_quizzes(&self, token: &str, course_id: &str) -> ApiResult<Vec<Quiz>>;
    async fn quiz(&self, token: &str, quiz_id: &str) -> ApiResult<Quiz>;
    async fn create_quiz(&self, token: &str, req: &CreateQuizRequest) -> ApiResult<Quiz>;

    async fn quiz_status(&self, token: &str, quiz_id: &str) -> ApiResult<QuizServerStatus>;
    async fn quiz_attempts(&self, token: &str, quiz_id: &str) -> ApiResult<Vec<QuizAttempt>>;
    async fn start_attempt(&self, token: &str, quiz_id: &str) -> ApiResult<StartAttemptResponse>;
    async fn submit_attempt(
        &self,
        token: &str,
        req: &SubmitAttemptRequest,
    ) -> ApiResult<AttemptResult>;

    async fn request_extra_attempt(
        &self,
        token: &str,
        body: &RequestExtraAttemptBody,
    ) -> ApiResult<ExtraAttemptRequest>;
    async fn my_extra_requests(&self, token: &str) -> ApiResult<Vec<ExtraAttemptRequest>>;
    async fn review_extra_request(
        &self,
        token: &str,
        request_id: &str,
        status: ExtraRequestStatus,
    ) -> ApiResult<ExtraAttemptRequest>;

    async fn course_modules(&self, token: &str, course_id: &str) -> ApiResult<Vec<CourseModule>>;
    async fn course_progress(&self, token: &str, course_id: &str) -> ApiResult<CourseProgress>;
    async fn timeline_access(
        &self,
        token: &str,
        course_id: &str,
        module_id: &str,
    ) -> ApiResult<TimelineAccess>;
    async fn set_level(&self, token: &str, req: &SetLevelRequest) -> ApiResult<LevelAssignment>;

    async fn timeline_notifications(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<TimelineNotification>>;
    async fn upcoming_deadlines(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<UpcomingDeadline>>;
    async fn violation_history(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<ViolationRecord>>;
    async fn mark_notification_read(&self, token: &str, notification_id: &str) -> ApiResult<()>;

    async fn ping(&self) -> ApiResult<()>;
}

pub struct HttpLmsClient {
    http: Client,
    base_url: String,
    read_retry: RetryConfig,
}

impl HttpLmsClient {
    pub fn new(base_url: &str, timeout: Duration) -> ApiResult<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ApiError::Validation(format!("Invalid LMS API URL '{}': {}", base_url, e)))?;

        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            read_retry: RetryConfig::default(),
        })
    }

    pub fn with_read_retry(mut self, config: RetryConfig) -> Self {
        self.read_retry = config;
        self
    }

    /// GETs are idempotent, so network failures are retried.
    async fn get<T>(&self, endpoint: &str, token: &str, path: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Send,
    {
        track_upstream_call(
            endpoint,
            retry_if(
                &self.read_retry,
                || self.execute::<(), T>(Method::GET, token, path, None),
                ApiError::is_network,
            ),
        )
        .await
    }

    async fn send<B, T>(
        &self,
        endpoint: &str,
        method: Method,
        token: &str,
        path: &str,
        body: &B,
    ) -> ApiResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        track_upstream_call(endpoint, self.execute(method, token, path, Some(body))).await
    }

    async fn execute<B, T>(
        &self,
        method: Method,
        token: &str,
        path: &str,
        body: Option<&B>,
    ) -> ApiResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("LMS request: {} {}", method, url);

        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        decode_envelope(response).await
    }
}

/// Unwraps `{success, data, message}`. HTTP 401 is an expired session; any
/// other error status or `success: false` surfaces the server's message.
async fn decode_envelope<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::AuthExpiry);
    }

    let bytes = response.bytes().await?;
    let envelope: Envelope<Value> = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(ApiError::rejection(
                status.as_u16(),
                status.canonical_reason().unwrap_or("LMS request failed"),
            ));
        }
        Err(e) => return Err(ApiError::Decode(e.to_string())),
    };

    if !status.is_success() || !envelope.success {
        let code = if status.is_success() {
            StatusCode::BAD_REQUEST.as_u16()
        } else {
            status.as_u16()
        };
        let message = envelope
            .message
            .unwrap_or_else(|| format!("LMS request failed with status {}", code));
        return Err(ApiError::rejection(code, message));
    }

    serde_json::from_value(envelope.data.unwrap_or(Value::Null))
        .map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl LmsApi for HttpLmsClient {
    async fn course_quizzes(&self, token: &str, course_id: &str) -> ApiResult<Vec<Quiz>> {
        self.get(
            "quizzes.by_course",
            token,
            &format!("/api/quizzes/course/{}", seg(course_id)),
        )
        .await
    }

    async fn quiz(&self, token: &str, quiz_id: &str) -> ApiResult<Quiz> {
        self.get("quizzes.get", token, &format!("/api/quizzes/{}", seg(quiz_id)))
            .await
    }

    async fn create_quiz(&self, token: &str, req: &CreateQuizRequest) -> ApiResult<Quiz> {
        self.send("quizzes.create", Method::POST, token, "/api/quizzes", req)
            .await
    }

    async fn quiz_status(&self, token: &str, quiz_id: &str) -> ApiResult<QuizServerStatus> {
        let mut status: QuizServerStatus = self
            .get(
                "attempts.status",
                token,
                &format!("/api/attempts/status/{}", seg(quiz_id)),
            )
            .await?;
        if status.quiz_id.is_empty() {
            status.quiz_id = quiz_id.to_string();
        }
        Ok(status)
    }

    async fn quiz_attempts(&self, token: &str, quiz_id: &str) -> ApiResult<Vec<QuizAttempt>> {
        self.get(
            "attempts.mine",
            token,
            &format!("/api/attempts/my/{}", seg(quiz_id)),
        )
        .await
    }

    async fn start_attempt(&self, token: &str, quiz_id: &str) -> ApiResult<StartAttemptResponse> {
        self.send(
            "attempts.start",
            Method::POST,
            token,
            &format!("/api/attempts/start/{}", seg(quiz_id)),
            &json!({}),
        )
        .await
    }

    async fn submit_attempt(
        &self,
        token: &str,
        req: &SubmitAttemptRequest,
    ) -> ApiResult<AttemptResult> {
        self.send(
            "attempts.submit",
            Method::POST,
            token,
            "/api/attempts/submit",
            req,
        )
        .await
    }

    async fn request_extra_attempt(
        &self,
        token: &str,
        body: &RequestExtraAttemptBody,
    ) -> ApiResult<ExtraAttemptRequest> {
        self.send(
            "attempts.request_extra",
            Method::POST,
            token,
            "/api/attempts/request-extra",
            body,
        )
        .await
    }

    async fn my_extra_requests(&self, token: &str) -> ApiResult<Vec<ExtraAttemptRequest>> {
        self.get(
            "attempts.extra_requests",
            token,
            "/api/attempts/extra-requests/my",
        )
        .await
    }

    async fn review_extra_request(
        &self,
        token: &str,
        request_id: &str,
        status: ExtraRequestStatus,
    ) -> ApiResult<ExtraAttemptRequest> {
        self.send(
            "attempts.review_extra",
            Method::PATCH,
            token,
            &format!("/api/attempts/extra-requests/{}", seg(request_id)),
            &ReviewExtraRequestBody { status },
        )
        .await
    }

    async fn course_modules(&self, token: &str, course_id: &str) -> ApiResult<Vec<CourseModule>> {
        self.get(
            "courses.modules",
            token,
            &format!("/api/courses/{}/modules", seg(course_id)),
        )
        .await
    }

    async fn course_progress(&self, token: &str, course_id: &str) -> ApiResult<CourseProgress> {
        self.get(
            "progress.course",
            token,
            &format!("/api/progress/{}", seg(course_id)),
        )
        .await
    }

    async fn timeline_access(
        &self,
        token: &str,
        course_id: &str,
        module_id: &str,
    ) -> ApiResult<TimelineAccess> {
        self.get(
            "progress.timeline_access",
            token,
            &format!(
                "/api/progress/timeline-access/{}/{}",
                seg(course_id),
                seg(module_id)
            ),
        )
        .await
    }

    async fn set_level(&self, token: &str, req: &SetLevelRequest) -> ApiResult<LevelAssignment> {
        self.send(
            "progress.set_level",
            Method::PATCH,
            token,
            "/api/progress/admin/set-level",
            req,
        )
        .await
    }

    async fn timeline_notifications(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<TimelineNotification>> {
        self.get(
            "timelines.notifications",
            token,
            &format!("/api/module-timelines/notifications/{}", seg(course_id)),
        )
        .await
    }

    async fn upcoming_deadlines(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<UpcomingDeadline>> {
        self.get(
            "timelines.upcoming",
            token,
            &format!("/api/module-timelines/upcoming/{}", seg(course_id)),
        )
        .await
    }

    async fn violation_history(
        &self,
        token: &str,
        course_id: &str,
    ) -> ApiResult<Vec<ViolationRecord>> {
        self.get(
            "timelines.violations",
            token,
            &format!("/api/module-timelines/violations/{}", seg(course_id)),
        )
        .await
    }

    async fn mark_notification_read(&self, token: &str, notification_id: &str) -> ApiResult<()> {
        let _: Value = self
            .send(
                "timelines.mark_read",
                Method::PATCH,
                token,
                &format!(
                    "/api/module-timelines/notifications/{}/read",
                    seg(notification_id)
                ),
                &json!({}),
            )
            .await?;
        Ok(())
    }

    async fn ping(&self) -> ApiResult<()> {
        let response = self
            .http
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ApiError::rejection(
                response.status().as_u16(),
                "LMS health check failed",
            ))
        }
    }
}
