mod config;
mod executor;
mod grader;
mod runner;
mod sandbox;
mod template;

use anyhow::Context;
use coderunner_common::config::AppConfig;
use coderunner_common::redis;
use runner::TestRunner;
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("CodeRunner worker booting...");

    let config = AppConfig::from_env().context("Invalid worker configuration")?;
    info!(sandbox = ?config.sandbox, queue = redis::QUEUE_NAME, "Worker configured");

    let sandbox = executor::build_sandbox(&config).await?;
    let runner = executor::build_runner(&config, sandbox);

    // Connect to Redis
    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", config.redis_url);

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping after the current job...");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &runner, config.result_ttl_secs) => {},
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, runner))]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    runner: &TestRunner,
    result_ttl_secs: u64,
) -> anyhow::Result<()> {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                info!(
                    job_id = %job_id,
                    language = %job.question.language,
                    test_cases = job.test_cases.len(),
                    answer_size = job.submission.answer.len(),
                    "Received job"
                );

                let start = std::time::Instant::now();
                let outcome = executor::execute_job(runner, &job).await;

                info!(
                    job_id = %job_id,
                    status = ?outcome.status,
                    mark = outcome.actual_mark,
                    max_mark = outcome.max_possible_mark,
                    fraction = outcome.mark_as_fraction(),
                    execution_ms = start.elapsed().as_millis(),
                    "Grading completed"
                );

                for (idx, result) in outcome.test_results.iter().enumerate() {
                    debug!(
                        job_id = %job_id,
                        test_num = idx + 1,
                        is_correct = result.is_correct,
                        awarded = result.awarded,
                        mark = result.mark,
                        "Test result"
                    );
                }

                // Persist outcome to Redis
                match redis::store_outcome(redis_conn, &job_id, &outcome, result_ttl_secs).await {
                    Ok(_) => {
                        info!(job_id = %job_id, "Outcome persisted to Redis");
                    }
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to persist outcome");
                        // Non-fatal - worker continues
                    }
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
