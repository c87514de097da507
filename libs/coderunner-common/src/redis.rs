use crate::codec::{decode_outcome, encode_outcome};
use crate::outcome::TestingOutcome;
use crate::types::GradingJob;
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics shared by the API and the worker, so key names
/// never drift between them.

pub const QUEUE_NAME: &str = "coderunner:queue:grading";
pub const OUTCOME_PREFIX: &str = "coderunner:outcome";
pub const STATUS_PREFIX: &str = "coderunner:status";

/// Generate outcome key for a job
pub fn outcome_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", OUTCOME_PREFIX, job_id)
}

/// Generate status key for a job
pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

fn type_error(desc: &'static str, detail: String) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, desc, detail))
}

/// Push a grading job onto the queue
/// Uses RPUSH for FIFO semantics
pub async fn push_job(conn: &mut redis::aio::ConnectionManager, job: &GradingJob) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| type_error("serialization error", e.to_string()))?;
    conn.rpush(QUEUE_NAME, payload).await
}

/// Record that a job is waiting, so a lookup can tell pending from unknown
pub async fn mark_pending(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
    ttl_secs: u64,
) -> RedisResult<()> {
    conn.set_ex(status_key(job_id), "pending", ttl_secs).await
}

/// Pop a job from the queue
/// Uses BLPOP with timeout for graceful shutdown
pub async fn pop_job(conn: &mut redis::aio::ConnectionManager, timeout_seconds: f64) -> RedisResult<Option<GradingJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_NAME, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradingJob =
                serde_json::from_str(&payload).map_err(|e| type_error("deserialization error", e.to_string()))?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a testing outcome as a versioned blob with a TTL
pub async fn store_outcome(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
    outcome: &TestingOutcome,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = encode_outcome(outcome).map_err(|e| type_error("serialization error", e.to_string()))?;
    let _: () = conn.set_ex(outcome_key(job_id), payload, ttl_secs).await?;
    let _: () = conn.set_ex(status_key(job_id), "done", ttl_secs).await?;
    Ok(())
}

/// Retrieve a stored outcome; legacy blobs are converted on read
pub async fn get_outcome(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<TestingOutcome>> {
    let payload: Option<String> = conn.get(outcome_key(job_id)).await?;

    match payload {
        Some(data) => {
            let outcome = decode_outcome(&data).map_err(|e| type_error("deserialization error", e.to_string()))?;
            Ok(Some(outcome))
        }
        None => Ok(None),
    }
}

/// Current status marker of a job, if any
pub async fn get_status(conn: &mut redis::aio::ConnectionManager, job_id: &uuid::Uuid) -> RedisResult<Option<String>> {
    conn.get(status_key(job_id)).await
}
