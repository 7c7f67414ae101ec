use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    #[serde(alias = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    pub passing_score: f64,
    /// Minutes; `None` means untimed.
    #[serde(default)]
    pub time_limit: Option<u32>,
    /// 0 means unlimited.
    #[serde(default)]
    pub attempts_allowed: u32,
    #[serde(default)]
    pub questions: Vec<QuizQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    #[serde(alias = "_id")]
    pub id: String,
    pub question_text: String,
    #[serde(default)]
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    #[default]
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    #[serde(alias = "_id")]
    pub id: String,
    pub quiz_id: String,
    pub score: f64,
    pub submitted_at: DateTime<Utc>,
}

/// `GET /api/attempts/status/:quizId`. The server serializes an unlimited
/// remaining count as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizServerStatus {
    #[serde(default)]
    pub quiz_id: String,
    pub attempts_allowed: u32,
    #[serde(default)]
    pub attempts_used: u32,
    #[serde(default)]
    pub attempts_remaining: Option<u32>,
    pub can_attempt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptResponse {
    pub can_attempt: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub quiz: Option<Quiz>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAttemptRequest {
    pub quiz_id: String,
    /// One slot per question, `null` when unanswered.
    pub answers: Vec<Option<Value>>,
    /// Seconds since the attempt entered progress.
    pub time_taken: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResult {
    #[serde(default)]
    pub attempt_id: Option<String>,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub attempts_remaining: Option<u32>,
    #[serde(default)]
    pub detailed_answers: Vec<DetailedAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedAnswer {
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub answer: Option<Value>,
    #[serde(default)]
    pub correct_answer: Option<Value>,
    pub is_correct: bool,
    #[serde(default)]
    pub points_earned: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtraRequestStatus {
    Pending,
    #[serde(alias = "approved")]
    Granted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraAttemptRequest {
    #[serde(alias = "_id")]
    pub id: String,
    pub student_id: String,
    pub quiz_id: String,
    pub status: ExtraRequestStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Body sent to `POST /api/attempts/request-extra`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExtraAttemptBody {
    pub quiz_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What the student sends to the gateway when asking for one more attempt.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ExtraAttemptInput {
    #[validate(length(max = 500, message = "Reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewExtraRequestBody {
    pub status: ExtraRequestStatus,
}

/// Quiz authoring payload. Checked locally before anything reaches the LMS.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,

    #[validate(length(min = 1, message = "Course is required"))]
    pub course_id: String,

    pub module_id: Option<String>,

    #[validate(range(min = 0.0, max = 100.0, message = "Passing score must be between 0 and 100"))]
    pub passing_score: f64,

    #[validate(range(min = 1, message = "Time limit must be at least one minute"))]
    pub time_limit: Option<u32>,

    #[serde(default)]
    pub attempts_allowed: u32,

    #[validate(
        length(min = 1, message = "Quiz must have at least one question"),
        custom(function = "validate_questions")
    )]
    pub questions: Vec<QuestionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionInput {
    pub question_text: String,
    #[serde(default)]
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub points: Option<f64>,
}

#[allow(clippy::ptr_arg)]
fn validate_questions(questions: &Vec<QuestionInput>) -> Result<(), ValidationError> {
    for (index, question) in questions.iter().enumerate() {
        let number = index + 1;
        if question.question_text.trim().is_empty() {
            return Err(question_error(format!("Question {} has no text", number)));
        }

        let answer = question
            .correct_answer
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                question_error(format!("Question {} needs a correct answer", number))
            })?;

        match question.question_type {
            QuestionType::MultipleChoice => {
                if question.options.iter().filter(|o| !o.trim().is_empty()).count() < 2 {
                    return Err(question_error(format!(
                        "Question {} needs at least two options",
                        number
                    )));
                }
                if !question.options.iter().any(|o| o.trim() == answer) {
                    return Err(question_error(format!(
                        "Question {}: correct answer must be one of the options",
                        number
                    )));
                }
            }
            QuestionType::TrueFalse => {
                if !matches!(answer.to_ascii_lowercase().as_str(), "true" | "false") {
                    return Err(question_error(format!(
                        "Question {}: answer must be true or false",
                        number
                    )));
                }
            }
            QuestionType::ShortAnswer => {}
        }
    }
    Ok(())
}

fn question_error(message: String) -> ValidationError {
    ValidationError::new("invalid_question").with_message(message.into())
}
