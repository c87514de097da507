/// Test Runner - Grading State Machine
///
/// **Core Responsibility:**
/// Run one submission's test cases through templates, the sandbox and the
/// active grader, producing a `TestingOutcome`.
///
/// **Flow:**
/// 1. Combined run: when the question has a combinator template and it is
///    safe to use, render every test into one program and run it once.
///    The result is final unless the run is "unusable" (runtime error,
///    stderr output, wrong number of output segments), in which case it is
///    silently discarded.
/// 2. Individual runs: one program per test, in order. Template errors,
///    sandbox errors and compile errors end the attempt; any other failed
///    run is recorded as a failing result and the remaining tests are
///    skipped.
/// 3. Finalize: attach the generated programs if requested and close the
///    sandbox session (always exactly once).
///
/// Ordinary grading failures are data in the outcome. `RunnerError` is only
/// returned for an invalid question or a sandbox that cannot be reached at
/// all.

use crate::grader::{bad_record_feedback, grader_for, parse_grading_record, Grader};
use crate::sandbox::{RunRequest, RunResponse, RunResult, Sandbox, SandboxError, SandboxSession};
use crate::template::{java_escape, matlab_escape, python_escape, TemplateRenderer};
use coderunner_common::outcome::{max_possible_mark, OutcomeStatus, TestingOutcome, TruncationLimits};
use coderunner_common::types::{validate_test_cases, Question, QuestionError, SandboxLimits, Submission, TestCase};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid question: {0}")]
    Question(#[from] QuestionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub struct TestRunner {
    sandbox: Arc<dyn Sandbox>,
    renderer: Arc<dyn TemplateRenderer>,
    truncation: TruncationLimits,
    default_limits: SandboxLimits,
}

impl TestRunner {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        renderer: Arc<dyn TemplateRenderer>,
        truncation: TruncationLimits,
        default_limits: SandboxLimits,
    ) -> Self {
        Self {
            sandbox,
            renderer,
            truncation,
            default_limits,
        }
    }

    /// Grade `submission` against `test_cases`, which must already be the
    /// subset (and order) appropriate to `is_precheck`.
    #[tracing::instrument(
        skip_all,
        fields(sandbox = self.sandbox.name(), language = %question.language, tests = test_cases.len(), is_precheck = is_precheck)
    )]
    pub async fn run_tests(
        &self,
        question: &Question,
        submission: &Submission,
        test_cases: &[TestCase],
        is_precheck: bool,
    ) -> Result<TestingOutcome, RunnerError> {
        question.validate()?;
        validate_test_cases(test_cases)?;
        let splitter = question.splitter()?;

        let session = self.sandbox.open_session().await?;
        let answer = graded_answer(question, &submission.answer);

        let mut run = GradingRun {
            question,
            test_cases,
            is_precheck,
            grader: grader_for(question.grader),
            renderer: self.renderer.as_ref(),
            truncation: self.truncation,
            splitter,
            env: template_environment(question, submission, &answer, is_precheck),
            base_request: RunRequest {
                language: sandbox_language(question, submission),
                files: merged_files(question, submission),
                limits: question.limits.or(&self.default_limits),
                params: question.sandbox_params.clone(),
                ..RunRequest::default()
            },
            session,
            sources: Vec::new(),
        };

        let mut outcome = match run.try_combined().await {
            Some(outcome) => outcome,
            None => run.run_individually().await,
        };

        run.session.close().await;
        if question.show_source {
            outcome.source_code_list = Some(run.sources);
        }

        info!(
            status = ?outcome.status,
            mark = outcome.actual_mark,
            max_mark = outcome.max_possible_mark,
            error_count = outcome.error_count,
            results = outcome.test_results.len(),
            "Grading complete"
        );
        Ok(outcome)
    }
}

/// State of one grading attempt.
struct GradingRun<'a> {
    question: &'a Question,
    test_cases: &'a [TestCase],
    is_precheck: bool,
    grader: Box<dyn Grader>,
    renderer: &'a dyn TemplateRenderer,
    truncation: TruncationLimits,
    splitter: Regex,
    env: Map<String, Value>,
    base_request: RunRequest,
    session: Box<dyn SandboxSession>,
    sources: Vec<String>,
}

impl GradingRun<'_> {
    fn new_outcome(&self) -> TestingOutcome {
        TestingOutcome::new(max_possible_mark(self.test_cases), self.test_cases.len(), self.is_precheck)
    }

    fn use_combined(&self) -> bool {
        let q = self.question;
        let no_stdins = self.test_cases.iter().all(|tc| tc.stdin.is_empty());
        q.has_combinator()
            && (q.grader.is_self_grading()
                || ((no_stdins || q.allow_multiple_stdins) && !q.grader.requires_isolation()))
    }

    async fn execute(&mut self, source: String, stdin: &str) -> RunResponse {
        self.sources.push(source.clone());
        let request = RunRequest {
            source,
            stdin: stdin.to_string(),
            ..self.base_request.clone()
        };
        self.session.execute(&request).await
    }

    /// `None` means the combined run was not attempted or was unusable.
    async fn try_combined(&mut self) -> Option<TestingOutcome> {
        if !self.use_combined() {
            return None;
        }
        let num_tests = self.test_cases.len();
        let mut outcome = self.new_outcome();

        let mut env = self.env.clone();
        env.insert(
            "TESTCASES".to_string(),
            Value::Array(self.test_cases.iter().map(test_case_value).collect()),
        );
        let template = self.question.combinator_template.as_deref().unwrap_or_default();
        let source = match self.renderer.render(template, &Value::Object(env)) {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "Combined template failed to render");
                outcome.set_status(OutcomeStatus::SyntaxError, format!("TEMPLATE ERROR: {}", e));
                return Some(outcome);
            }
        };

        let response = self.execute(source, "").await;
        if !response.is_ok() {
            error!(error = ?response.error, diagnostic = %response.diagnostic, "Sandbox error on combined run");
            outcome.set_status(OutcomeStatus::SandboxError, response.error_message());
            return Some(outcome);
        }

        if self.question.grader.is_self_grading() {
            return Some(self.self_graded(&response));
        }

        match response.result {
            RunResult::CompilationError => {
                warn!("Combined program failed to compile");
                outcome.set_status(OutcomeStatus::SyntaxError, response.cmpinfo);
                Some(outcome)
            }
            RunResult::Success if response.stderr.is_empty() => {
                let segments: Vec<&str> = self.splitter.split(&response.stdout).collect();
                if segments.len() != num_tests {
                    info!(
                        expected = num_tests,
                        got = segments.len(),
                        "Combined output has the wrong number of segments; running tests individually"
                    );
                    return None;
                }
                for (segment, tc) in segments.iter().zip(self.test_cases) {
                    outcome.add_test_result(self.grader.grade(segment, tc, false, &self.truncation));
                }
                Some(outcome)
            }
            other => {
                info!(
                    result = ?other,
                    stderr_bytes = response.stderr.len(),
                    "Combined run unusable; running tests individually"
                );
                None
            }
        }
    }

    fn self_graded(&self, response: &RunResponse) -> TestingOutcome {
        let max_mark = max_possible_mark(self.test_cases);
        let num_tests = self.test_cases.len();

        let record = if response.result == RunResult::Success {
            parse_grading_record(&response.stdout).map_err(|reason| (reason, response.stdout.clone()))
        } else {
            Err((format!("run ended with {}", response.result_string()), response.error_report()))
        };

        match record {
            Ok((fraction, feedback)) => {
                TestingOutcome::self_graded(fraction, max_mark, feedback, num_tests, self.is_precheck)
            }
            Err((reason, raw)) => {
                warn!(reason = %reason, "Self-grading program produced unusable output");
                let feedback = bad_record_feedback(&reason, &raw, &self.truncation);
                TestingOutcome::self_graded(0.0, max_mark, feedback, num_tests, self.is_precheck)
            }
        }
    }

    async fn run_individually(&mut self) -> TestingOutcome {
        let mut outcome = self.new_outcome();
        let test_cases = self.test_cases;

        for (idx, tc) in test_cases.iter().enumerate() {
            let test_num = idx + 1;
            let test = test_case_value(tc);
            let mut env = self.env.clone();
            env.insert("TESTCASES".to_string(), Value::Array(vec![test.clone()]));
            env.insert("TEST".to_string(), test);

            let source = match self.renderer.render(&self.question.per_test_template, &Value::Object(env)) {
                Ok(source) => source,
                Err(e) => {
                    warn!(test_num, error = %e, "Per-test template failed to render");
                    outcome.set_status(OutcomeStatus::SyntaxError, format!("TEMPLATE ERROR: {}", e));
                    break;
                }
            };

            let response = self.execute(source, &tc.stdin).await;
            if !response.is_ok() {
                error!(test_num, error = ?response.error, diagnostic = %response.diagnostic, "Sandbox error");
                outcome.set_status(OutcomeStatus::SandboxError, response.error_message());
                break;
            }

            match response.result {
                RunResult::CompilationError => {
                    warn!(test_num, "Program failed to compile");
                    outcome.set_status(OutcomeStatus::SyntaxError, response.cmpinfo);
                    break;
                }
                RunResult::Success => {
                    let output = merged_output(&response.stdout, &response.stderr);
                    let mut result = self.grader.grade(&output, tc, false, &self.truncation);
                    let aborting = result.abort;
                    if aborting {
                        result.mark_aborted();
                    }
                    outcome.add_test_result(result);
                    if aborting {
                        info!(test_num, "Grader requested abort; skipping remaining tests");
                        break;
                    }
                }
                other => {
                    warn!(test_num, result = ?other, signal = response.signal, "Test run failed; skipping remaining tests");
                    let report = response.error_report();
                    outcome.add_test_result(self.grader.grade(&report, tc, true, &self.truncation));
                    break;
                }
            }
        }
        outcome
    }
}

/// The code that is actually graded. UI plugins may submit a JSON object
/// whose `answer_code` array holds the program.
pub fn graded_answer(question: &Question, answer: &str) -> String {
    if question.extract_code_from_json {
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(answer) {
            let code = fields
                .get("answer_code")
                .and_then(Value::as_array)
                .and_then(|codes| codes.first())
                .and_then(Value::as_str);
            if let Some(code) = code {
                return code.to_string();
            }
        }
    }
    answer.to_string()
}

fn sandbox_language(question: &Question, submission: &Submission) -> String {
    submission
        .answer_language
        .as_deref()
        .filter(|lang| !lang.is_empty())
        .unwrap_or(&question.language)
        .to_string()
}

/// Stdout followed by stderr, on a new line when stdout does not end one.
pub fn merged_output(stdout: &str, stderr: &str) -> String {
    if stdout.is_empty() || stderr.is_empty() || stdout.ends_with('\n') {
        format!("{}{}", stdout, stderr)
    } else {
        format!("{}\n{}", stdout, stderr)
    }
}

/// Attachments plus support files; a support file wins on a name clash.
fn merged_files(question: &Question, submission: &Submission) -> BTreeMap<String, Vec<u8>> {
    let mut files = submission.attachments.clone();
    files.extend(question.support_files.iter().map(|(name, bytes)| (name.clone(), bytes.clone())));
    files
}

pub fn test_case_value(tc: &TestCase) -> Value {
    json!({
        "testcode": tc.test_code,
        "stdin": tc.stdin,
        "expected": tc.expected,
        "extra": tc.extra,
        "mark": tc.mark,
        "display": tc.display.as_str(),
        "useasexample": tc.use_as_example,
        "testtype": tc.test_type.code(),
        "hiderestiffail": tc.hide_rest_if_fail,
    })
}

/// Variables shared by the combined and per-test templates. Question
/// template parameters are visible at top level but cannot shadow the
/// built-in names.
pub fn template_environment(
    question: &Question,
    submission: &Submission,
    answer: &str,
    is_precheck: bool,
) -> Map<String, Value> {
    let mut env = question.template_params.clone();
    let attachments: Vec<&str> = submission.attachments.keys().map(String::as_str).collect();

    env.insert("STUDENT_ANSWER".to_string(), json!(answer));
    env.insert("ESCAPED_STUDENT_ANSWER".to_string(), json!(python_escape(answer)));
    env.insert("JAVA_ESCAPED_STUDENT_ANSWER".to_string(), json!(java_escape(answer)));
    env.insert("MATLAB_ESCAPED_STUDENT_ANSWER".to_string(), json!(matlab_escape(answer)));
    env.insert("IS_PRECHECK".to_string(), json!(if is_precheck { "1" } else { "0" }));
    env.insert("ANSWER_LANGUAGE".to_string(), json!(sandbox_language(question, submission)));
    env.insert("ATTACHMENTS".to_string(), json!(attachments.join(",")));
    env.insert(
        "QUESTION".to_string(),
        json!({
            "language": question.language,
            "grader": question.grader.name(),
            "parameters": question.template_params,
        }),
    );
    env
}
