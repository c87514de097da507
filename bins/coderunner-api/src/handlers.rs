// HTTP route handlers for the CodeRunner grading API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use coderunner_common::outcome::TestingOutcome;
use coderunner_common::redis;
use coderunner_common::types::{GradingJob, Question, Submission, TestCase};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub question: Question,
    pub submission: Submission,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub is_precheck: bool,
}

#[derive(Debug, Serialize)]
pub struct GradeResponse {
    pub job_id: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Body returned once a job has been graded.
pub fn outcome_body(job_id: &Uuid, outcome: &TestingOutcome) -> Value {
    json!({
        "job_id": job_id.to_string(),
        "status": "done",
        "fraction": outcome.mark_as_fraction(),
        "all_correct": outcome.all_correct(),
        "outcome": outcome,
    })
}

/// POST /grade - Validate and queue a grading job
pub async fn submit_grading(State(state): State<Arc<AppState>>, Json(payload): Json<GradeRequest>) -> Response {
    let job = GradingJob::new(payload.question, payload.submission, payload.test_cases, payload.is_precheck);

    if let Err(e) = job.validate() {
        warn!(job_id = %job.id, error = %e, "Rejected invalid question");
        return error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
    }

    let mut conn = state.redis.clone();
    // Pending marker goes first so a fast worker's "done" is never overwritten
    if let Err(e) = redis::mark_pending(&mut conn, &job.id, state.result_ttl_secs).await {
        error!(job_id = %job.id, error = %e, "Failed to record pending job");
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e));
    }

    match redis::push_job(&mut conn, &job).await {
        Ok(_) => {
            info!(
                job_id = %job.id,
                language = %job.question.language,
                grader = %job.question.grader,
                test_cases = job.test_cases.len(),
                is_precheck = job.is_precheck,
                "Job queued"
            );
            (
                StatusCode::CREATED,
                Json(GradeResponse {
                    job_id: job.id.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue job");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e))
        }
    }
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /grade/:job_id - Query a grading outcome
pub async fn get_grading_result(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let job_uuid = match Uuid::parse_str(&job_id) {
        Ok(id) => id,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "Invalid job ID format"),
    };

    let mut conn = state.redis.clone();
    match redis::get_outcome(&mut conn, &job_uuid).await {
        Ok(Some(outcome)) => {
            info!(job_id = %job_id, status = ?outcome.status, "Outcome retrieved");
            (StatusCode::OK, Json(outcome_body(&job_uuid, &outcome))).into_response()
        }
        Ok(None) => match redis::get_status(&mut conn, &job_uuid).await {
            Ok(Some(_)) => {
                info!(job_id = %job_id, "Job still pending");
                (
                    StatusCode::ACCEPTED,
                    Json(json!({
                        "job_id": job_id,
                        "status": "pending",
                        "message": "Job is queued or still being graded"
                    })),
                )
                    .into_response()
            }
            Ok(None) => error_body(StatusCode::NOT_FOUND, "Unknown or expired job"),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to fetch job status");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query job status: {}", e))
            }
        },
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch outcome");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to query job status: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_common::outcome::OutcomeStatus;
    use coderunner_common::types::GraderKind;

    #[test]
    fn test_grade_request_parses() {
        let body = json!({
            "question": {
                "language": "python3",
                "per_test_template": "{{ STUDENT_ANSWER }}\n{{ TEST.testcode }}",
                "grader": "NearEqualityGrader"
            },
            "submission": {"answer": "def sq(n): return n * n"},
            "test_cases": [{"test_code": "print(sq(3))", "expected": "9"}]
        });
        let request: GradeRequest = serde_json::from_value(body).unwrap();

        assert_eq!(request.question.grader, GraderKind::NearEquality);
        assert_eq!(request.test_cases[0].mark, 1.0);
        assert!(!request.is_precheck);
    }

    #[test]
    fn test_unknown_grader_rejected() {
        let body = json!({
            "question": {"language": "c", "per_test_template": "x", "grader": "FuzzyGrader"},
            "submission": {"answer": ""},
            "test_cases": []
        });
        assert!(serde_json::from_value::<GradeRequest>(body).is_err());
    }

    #[test]
    fn test_outcome_body() {
        let id = Uuid::new_v4();
        let mut outcome = TestingOutcome::new(2.0, 0, false);
        let body = outcome_body(&id, &outcome);
        assert_eq!(body["fraction"], 1.0);
        assert_eq!(body["all_correct"], true);

        outcome.set_status(OutcomeStatus::SyntaxError, "bad");
        let body = outcome_body(&id, &outcome);
        assert_eq!(body["fraction"], 0.0);
        assert_eq!(body["outcome"]["status"], "syntax_error");
        assert_eq!(body["job_id"], id.to_string());
    }
}
