/// Job Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Build the configured sandbox and test runner, then turn each queued
/// `GradingJob` into a `TestingOutcome` ready to store.
///
/// This module is the glue layer. It knows nothing about:
/// - How programs execute (the sandbox's job)
/// - How tests are combined and graded (the runner's job)

use crate::config::LanguageConfigManager;
use crate::runner::{RunnerError, TestRunner};
use crate::sandbox::docker::DockerSandbox;
use crate::sandbox::jobe::JobeSandbox;
use crate::sandbox::Sandbox;
use crate::template::SimpleRenderer;
use anyhow::{Context, Result};
use coderunner_common::config::{AppConfig, SandboxKind};
use coderunner_common::outcome::{max_possible_mark, OutcomeStatus, TestingOutcome};
use coderunner_common::types::{GradingJob, TestCase};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Connect to the sandbox selected by `SANDBOX`.
pub async fn build_sandbox(config: &AppConfig) -> Result<Arc<dyn Sandbox>> {
    match config.sandbox {
        SandboxKind::Jobe => {
            let jobe = JobeSandbox::new(config.jobe_servers.clone(), config.jobe_api_key.clone())
                .context("Failed to create Jobe client")?;
            match jobe.languages().await {
                Ok(languages) => {
                    let names: Vec<&str> = languages.iter().map(|(name, _)| name.as_str()).collect();
                    info!(servers = ?config.jobe_servers, languages = ?names, "Jobe sandbox ready");
                }
                // Jobe may come up after the worker; runs report it per job
                Err(e) => warn!(servers = ?config.jobe_servers, error = %e, "Jobe server not answering yet"),
            }
            Ok(Arc::new(jobe))
        }
        SandboxKind::Docker => {
            let languages = LanguageConfigManager::load(Path::new(&config.languages_config)).map_err(|e| {
                error!("Failed to load language configurations: {}", e);
                error!("Make sure {} exists", config.languages_config);
                e
            })?;
            info!("Loaded language configurations for: {:?}", languages.list_languages());

            let docker = DockerSandbox::new(languages).context("Failed to connect to Docker")?;
            docker.ping().await.context("Docker daemon is not responding")?;
            info!("Docker sandbox ready");
            Ok(Arc::new(docker))
        }
    }
}

pub fn build_runner(config: &AppConfig, sandbox: Arc<dyn Sandbox>) -> TestRunner {
    TestRunner::new(sandbox, Arc::new(SimpleRenderer), config.truncation, config.default_limits)
}

/// Grade one job. Runner errors become a sandbox-error outcome so the
/// submitter always gets an answer.
pub async fn execute_job(runner: &TestRunner, job: &GradingJob) -> TestingOutcome {
    let test_cases = job.selected_test_cases();
    info!(
        job_id = %job.id,
        language = %job.question.language,
        grader = %job.question.grader,
        test_cases = test_cases.len(),
        is_precheck = job.is_precheck,
        "Starting job execution"
    );

    match runner
        .run_tests(&job.question, &job.submission, &test_cases, job.is_precheck)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Grading could not run");
            failure_outcome(&test_cases, job.is_precheck, &e)
        }
    }
}

fn failure_outcome(test_cases: &[TestCase], is_precheck: bool, err: &RunnerError) -> TestingOutcome {
    let mut outcome = TestingOutcome::new(max_possible_mark(test_cases), test_cases.len(), is_precheck);
    outcome.set_status(OutcomeStatus::SandboxError, err.to_string());
    outcome
}
