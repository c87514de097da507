// CLI commands for operating the CodeRunner grading service
use anyhow::{bail, Context, Result};
use coderunner_common::config::AppConfig;
use coderunner_common::outcome::{OutcomeStatus, TestingOutcome};
use coderunner_common::redis;
use coderunner_common::types::{validate_test_cases, GradingJob, Question, Submission, TestCase};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// A job file: the same shape the API accepts on `POST /grade`.
#[derive(Debug, Deserialize)]
pub struct JobFile {
    pub question: Question,
    pub submission: Submission,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub is_precheck: bool,
}

/// Question files may hold a bare question or a whole job.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuestionFile {
    Job(JobFile),
    Question(Question),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn connect(config: &AppConfig) -> Result<::redis::aio::ConnectionManager> {
    let client = ::redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

/// Check a question (or job) file the way the API does on intake
pub async fn validate_question(path: &str) -> Result<()> {
    println!("🔍 Validating: {}", path);

    let (question, test_cases) = match read_json::<QuestionFile>(Path::new(path))? {
        QuestionFile::Job(job) => (job.question, job.test_cases),
        QuestionFile::Question(question) => (question, Vec::new()),
    };

    if let Err(e) = question.validate().and_then(|_| validate_test_cases(&test_cases)) {
        println!("❌ Invalid question: {}", e);
        bail!("validation failed");
    }

    println!("✅ Question is valid");
    println!("  Language:        {}", question.language);
    println!("  Grader:          {}", question.grader);
    println!(
        "  Combined run:    {}",
        if question.has_combinator() { "yes" } else { "no" }
    );
    if !test_cases.is_empty() {
        let total: f64 = test_cases.iter().map(|tc| tc.mark).sum();
        println!("  Test cases:      {} (total mark {})", test_cases.len(), total);
    }
    Ok(())
}

/// Queue a job file and optionally wait for its outcome
pub async fn submit_job(path: &str, wait: bool, timeout_secs: u64) -> Result<()> {
    let file: JobFile = read_json(Path::new(path))?;
    let job = GradingJob::new(file.question, file.submission, file.test_cases, file.is_precheck);
    job.validate().context("Job file holds an invalid question")?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let mut conn = connect(&config).await?;

    redis::mark_pending(&mut conn, &job.id, config.result_ttl_secs).await?;
    redis::push_job(&mut conn, &job).await?;

    println!("🚀 Job queued: {}", job.id);
    println!("  Queue:      {}", redis::QUEUE_NAME);
    println!("  Test cases: {}", job.selected_test_cases().len());

    if !wait {
        println!("\n📋 Fetch the outcome with: coderunner-cli result {}", job.id);
        return Ok(());
    }

    println!("\n⏳ Waiting for outcome (up to {}s)...", timeout_secs);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if let Some(outcome) = redis::get_outcome(&mut conn, &job.id).await? {
            print!("{}", render_outcome(&outcome));
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    bail!("Timed out waiting for job {}", job.id)
}

/// Print the stored outcome of a job
pub async fn show_result(job_id: &str, json: bool) -> Result<()> {
    let job_uuid = Uuid::parse_str(job_id).with_context(|| format!("'{}' is not a job id", job_id))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let mut conn = connect(&config).await?;

    match redis::get_outcome(&mut conn, &job_uuid).await? {
        Some(outcome) if json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        Some(outcome) => print!("{}", render_outcome(&outcome)),
        None => match redis::get_status(&mut conn, &job_uuid).await? {
            Some(_) => println!("⏳ Job {} is queued or still being graded", job_id),
            None => bail!("Unknown or expired job {}", job_id),
        },
    }
    Ok(())
}

fn status_line(outcome: &TestingOutcome) -> &'static str {
    match outcome.status {
        OutcomeStatus::Valid if outcome.all_correct() => "✅ All tests passed",
        OutcomeStatus::Valid => "⚠️  Some tests failed",
        OutcomeStatus::SyntaxError => "❌ Syntax error",
        OutcomeStatus::SandboxError => "❌ Sandbox error",
        OutcomeStatus::SelfGraded => "📝 Graded by the question's own program",
    }
}

/// Human-readable summary of an outcome
pub fn render_outcome(outcome: &TestingOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", status_line(outcome)));
    out.push_str(&format!(
        "  Mark: {:.2} / {:.2} ({:.0}%)\n",
        outcome.actual_mark,
        outcome.max_possible_mark,
        outcome.mark_as_fraction() * 100.0
    ));
    if !outcome.error_message.is_empty() {
        out.push_str(&format!("\n{}\n", outcome.error_message));
    }
    if let Some(feedback) = outcome.feedback.as_ref().filter(|f| !f.feedback.is_empty()) {
        out.push_str(&format!("\n{}\n", feedback.feedback));
    }

    if !outcome.test_results.is_empty() {
        out.push_str(&format!("\n{:<6} {:<8} {:<30} {:<30}\n", "Test", "Result", "Expected", "Got"));
        out.push_str(&format!("{}\n", "─".repeat(76)));
        for (idx, result) in outcome.test_results.iter().enumerate() {
            out.push_str(&format!(
                "{:<6} {:<8} {:<30} {:<30}\n",
                idx + 1,
                if result.is_correct { "pass" } else { "FAIL" },
                first_line(&result.expected),
                first_line(&result.got)
            ));
        }
        let skipped = outcome.num_tests_expected.saturating_sub(outcome.test_results.len());
        if skipped > 0 {
            out.push_str(&format!("\n⏭️  {} test(s) not run\n", skipped));
        }
    }
    out
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > 28 || text.lines().nth(1).is_some() {
        format!("{}…", line.chars().take(27).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_common::outcome::{TestResult, TruncationLimits};

    #[test]
    fn test_question_file_accepts_both_shapes() {
        let bare: QuestionFile = serde_json::from_str(r#"{"language": "c", "per_test_template": "x"}"#).unwrap();
        assert!(matches!(bare, QuestionFile::Question(_)));

        let job: QuestionFile = serde_json::from_str(
            r#"{"question": {"language": "c", "per_test_template": "x"},
                "submission": {"answer": "int main() {}"},
                "test_cases": [{"expected": "1"}]}"#,
        )
        .unwrap();
        assert!(matches!(job, QuestionFile::Job(ref j) if j.test_cases.len() == 1));
    }

    #[test]
    fn test_render_outcome() {
        let limits = TruncationLimits::default();
        let tc1 = TestCase::new("print(1)", "1");
        let tc2 = TestCase::new("print(2)", "2");
        let mut outcome = TestingOutcome::new(2.0, 3, false);
        outcome.add_test_result(TestResult::new(&tc1, true, 1.0, "1", &limits));
        outcome.add_test_result(TestResult::new(&tc2, false, 0.0, "two\nlines", &limits));

        let text = render_outcome(&outcome);

        assert!(text.starts_with("⚠️  Some tests failed"));
        assert!(text.contains("Mark: 1.00 / 2.00 (50%)"));
        assert!(text.contains("FAIL"));
        assert!(text.contains("two…"));
        assert!(text.contains("1 test(s) not run"));
    }

    #[test]
    fn test_render_syntax_error() {
        let mut outcome = TestingOutcome::new(1.0, 1, false);
        outcome.set_status(OutcomeStatus::SyntaxError, "prog.c:1: error: expected ';'");

        let text = render_outcome(&outcome);

        assert!(text.starts_with("❌ Syntax error"));
        assert!(text.contains("expected ';'"));
        assert!(text.contains("(0%)"));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("short"), "short");
        assert_eq!(first_line("a\nb"), "a…");
        assert_eq!(first_line(&"x".repeat(40)), format!("{}…", "x".repeat(27)));
    }
}
