//! Client for a Jobe server, the remote REST sandbox.
//!
//! Runs are posted to `{host}/jobe/index.php/restapi/runs`. Support files
//! are referenced by content hash; when the server answers 404 the files
//! are uploaded and the run is submitted once more.

use super::{RunRequest, RunResponse, RunResult, Sandbox, SandboxError, SandboxErrorKind, SandboxSession};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

const API_PATH: &str = "jobe/index.php/restapi";
const JOB_ID_HEADER: &str = "X-CodeRunner-Job-Id";

// Extra time allowed over the run's own wall-clock limit before the HTTP
// request is abandoned.
const HTTP_GRACE_SECS: u64 = 30;

/// Jobe outcome codes.
const OUTCOME_COMPILE_ERROR: i64 = 11;
const OUTCOME_RUNTIME_ERROR: i64 = 12;
const OUTCOME_TIME_LIMIT: i64 = 13;
const OUTCOME_SUCCESS: i64 = 15;
const OUTCOME_MEMORY_LIMIT: i64 = 17;
const OUTCOME_ILLEGAL_SYSCALL: i64 = 19;
const OUTCOME_INTERNAL_ERROR: i64 = 20;
const OUTCOME_SERVER_OVERLOAD: i64 = 21;
const OUTCOME_OUTPUT_LIMIT: i64 = 30;
const OUTCOME_ABNORMAL: i64 = 31;

fn run_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/home/jobe/runs/jobe_[a-zA-Z0-9_]+/([a-zA-Z0-9_]+)").expect("valid regex"))
}

fn java_class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*public\s+(?:final\s+)?class\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"))
}

/// Replace `/home/jobe/runs/<run dir>/name` with `name`.
pub fn filter_run_paths(text: &str) -> String {
    run_path_re().replace_all(text, "$1").into_owned()
}

/// File name Jobe should save the program under.
pub fn source_filename(source: &str, language: &str, params: &Map<String, Value>) -> String {
    if let Some(name) = params.get("sourcefilename").and_then(Value::as_str) {
        return name.to_string();
    }
    if language.eq_ignore_ascii_case("java") {
        if let Some(caps) = java_class_re().captures(source) {
            return format!("{}.java", &caps[1]);
        }
    }
    format!("__tester__.{}", language)
}

/// Content-addressed id used for Jobe's file cache.
pub fn file_id(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

pub fn classify_outcome(outcome: i64) -> Result<RunResult, SandboxErrorKind> {
    match outcome {
        OUTCOME_COMPILE_ERROR => Ok(RunResult::CompilationError),
        OUTCOME_RUNTIME_ERROR => Ok(RunResult::RuntimeError),
        OUTCOME_TIME_LIMIT => Ok(RunResult::TimeLimitExceeded),
        OUTCOME_SUCCESS => Ok(RunResult::Success),
        OUTCOME_MEMORY_LIMIT => Ok(RunResult::MemoryLimitExceeded),
        OUTCOME_ILLEGAL_SYSCALL => Ok(RunResult::IllegalSyscall),
        OUTCOME_INTERNAL_ERROR => Ok(RunResult::InternalError),
        OUTCOME_SERVER_OVERLOAD => Err(SandboxErrorKind::Overload),
        OUTCOME_OUTPUT_LIMIT => Ok(RunResult::OutputLimitExceeded),
        OUTCOME_ABNORMAL => Ok(RunResult::AbnormalTermination),
        _ => Ok(RunResult::InternalError),
    }
}

fn classify_http(status: StatusCode, body: &str) -> SandboxErrorKind {
    match status.as_u16() {
        400 if body.to_lowercase().contains("language") => SandboxErrorKind::UnsupportedLanguage,
        400 | 403 => SandboxErrorKind::MisconfiguredSandbox,
        401 | 429 | 503 => SandboxErrorKind::Overload,
        _ => SandboxErrorKind::Other,
    }
}

/// Build Jobe's `parameters` object: the run limits, then the question's
/// own sandbox parameters, which win on conflict.
pub fn run_parameters(request: &RunRequest) -> Map<String, Value> {
    let limits = &request.limits;
    let mut params = Map::new();
    if let Some(cpu) = limits.cpu_time_secs {
        params.insert("cputime".to_string(), json!(cpu));
    }
    if let Some(mem) = limits.memory_mb {
        params.insert("memorylimit".to_string(), json!(mem));
    }
    if let Some(disk_kb) = limits.disk_kb {
        params.insert("disklimit".to_string(), json!(disk_kb.div_ceil(1024)));
    }
    if let Some(procs) = limits.max_processes {
        params.insert("numprocs".to_string(), json!(procs));
    }
    for (k, v) in &request.params {
        params.insert(k.clone(), v.clone());
    }
    params
}

#[derive(Debug, Deserialize)]
struct RunResultBody {
    outcome: i64,
    #[serde(default)]
    cmpinfo: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

struct JobeInner {
    client: reqwest::Client,
    servers: Vec<String>,
    api_key: Option<String>,
    next_server: AtomicUsize,
}

/// Jobe-backed sandbox. Cheap to share; sessions are handed out
/// round-robin over the configured servers.
#[derive(Clone)]
pub struct JobeSandbox {
    inner: Arc<JobeInner>,
}

impl JobeSandbox {
    pub fn new(servers: Vec<String>, api_key: Option<String>) -> Result<Self, SandboxError> {
        if servers.is_empty() {
            return Err(SandboxError::Misconfigured("no Jobe servers configured".to_string()));
        }
        let servers = servers
            .into_iter()
            .map(|host| {
                let host = host.trim_end_matches('/');
                if host.starts_with("http://") || host.starts_with("https://") {
                    host.to_string()
                } else {
                    format!("http://{}", host)
                }
            })
            .collect();
        let client = reqwest::Client::builder()
            .user_agent("CodeRunner")
            .build()
            .map_err(|e| SandboxError::Misconfigured(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(JobeInner {
                client,
                servers,
                api_key,
                next_server: AtomicUsize::new(0),
            }),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .inner
            .client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(key) = &self.inner.api_key {
            builder = builder.header("X-API-KEY", key);
        }
        builder
    }

    /// Languages the first server supports, as `(name, version)` pairs.
    pub async fn languages(&self) -> Result<Vec<(String, String)>, SandboxError> {
        let url = format!("{}/{}/languages", self.inner.servers[0], API_PATH);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| SandboxError::Unavailable("jobe", e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Unavailable("jobe", format!("HTTP {}", response.status())));
        }
        let pairs: Vec<(String, String)> = response
            .json()
            .await
            .map_err(|e| SandboxError::Unavailable("jobe", e.to_string()))?;
        Ok(pairs)
    }
}

#[async_trait]
impl Sandbox for JobeSandbox {
    fn name(&self) -> &'static str {
        "jobe"
    }

    async fn open_session(&self) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let index = self.inner.next_server.fetch_add(1, Ordering::Relaxed) % self.inner.servers.len();
        Ok(Box::new(JobeSession {
            sandbox: self.clone(),
            server: self.inner.servers[index].clone(),
            job_id: Uuid::new_v4(),
        }))
    }
}

pub struct JobeSession {
    sandbox: JobeSandbox,
    server: String,
    job_id: Uuid,
}

enum Submitted {
    Done(RunResponse),
    MissingFiles,
}

impl JobeSession {
    fn url(&self, resource: &str) -> String {
        format!("{}/{}/{}", self.server, API_PATH, resource)
    }

    async fn submit(&self, body: &Value, timeout: Duration) -> Submitted {
        let response = self
            .sandbox
            .request(reqwest::Method::POST, &self.url("runs"))
            .header(JOB_ID_HEADER, self.job_id.to_string())
            .timeout(timeout)
            .json(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                error!(server = %self.server, error = %e, "Jobe request failed");
                return Submitted::Done(RunResponse::failed(SandboxErrorKind::Other, e.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Submitted::MissingFiles;
        }
        let text = response.text().await.unwrap_or_default();
        if status != StatusCode::OK {
            warn!(server = %self.server, http_status = status.as_u16(), "Jobe rejected run");
            return Submitted::Done(RunResponse::failed(classify_http(status, &text), text));
        }

        let body: RunResultBody = match serde_json::from_str(&text) {
            Ok(b) => b,
            Err(e) => {
                error!(server = %self.server, error = %e, "Unreadable Jobe response");
                return Submitted::Done(RunResponse::failed(
                    SandboxErrorKind::Other,
                    format!("Bad response from Jobe: {}", e),
                ));
            }
        };

        let result = match classify_outcome(body.outcome) {
            Ok(result) => result,
            Err(kind) => return Submitted::Done(RunResponse::failed(kind, "")),
        };
        Submitted::Done(RunResponse {
            error: SandboxErrorKind::Ok,
            diagnostic: String::new(),
            result,
            stdout: filter_run_paths(&body.stdout.unwrap_or_default()),
            stderr: filter_run_paths(&body.stderr.unwrap_or_default()),
            cmpinfo: body.cmpinfo.unwrap_or_default(),
            signal: 0,
        })
    }

    /// Upload every file; returns the first failure status, if any.
    async fn put_files(&self, request: &RunRequest) -> Result<(), RunResponse> {
        for (name, contents) in &request.files {
            let id = file_id(contents);
            let body = json!({ "file_contents": general_purpose::STANDARD.encode(contents) });
            debug!(file = %name, id = %id, "Uploading file to Jobe");
            let response = self
                .sandbox
                .request(reqwest::Method::PUT, &self.url(&format!("files/{}", id)))
                .json(&body)
                .send()
                .await
                .map_err(|e| RunResponse::failed(SandboxErrorKind::Other, e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(RunResponse::failed(classify_http(status, &text), text));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxSession for JobeSession {
    #[tracing::instrument(skip(self, request), fields(sandbox = "jobe", job_id = %self.job_id, language = %request.language))]
    async fn execute(&mut self, request: &RunRequest) -> RunResponse {
        let language = request.language.to_lowercase();
        let mut input = request.stdin.clone();
        if !input.is_empty() && !input.ends_with('\n') {
            input.push('\n');
        }

        let file_list: Vec<Value> = request
            .files
            .iter()
            .map(|(name, contents)| json!([file_id(contents), name]))
            .collect();

        let body = json!({
            "run_spec": {
                "language_id": language,
                "sourcecode": request.source,
                "sourcefilename": source_filename(&request.source, &language, &request.params),
                "input": input,
                "file_list": file_list,
                "parameters": run_parameters(request),
            }
        });

        let wall = request.limits.wall_time_secs.unwrap_or(30.0).max(1.0);
        let timeout = Duration::from_secs(wall.ceil() as u64 + HTTP_GRACE_SECS);

        match self.submit(&body, timeout).await {
            Submitted::Done(response) => response,
            Submitted::MissingFiles if request.files.is_empty() => {
                RunResponse::failed(SandboxErrorKind::MisconfiguredSandbox, "Jobe answered 404 for runs")
            }
            Submitted::MissingFiles => {
                if let Err(response) = self.put_files(request).await {
                    return response;
                }
                match self.submit(&body, timeout).await {
                    Submitted::Done(response) => response,
                    Submitted::MissingFiles => RunResponse::failed(
                        SandboxErrorKind::MisconfiguredSandbox,
                        "Jobe still reports missing files after upload",
                    ),
                }
            }
        }
    }

    async fn close(&mut self) {
        // Jobe runs are stateless over HTTP.
        debug!(job_id = %self.job_id, "Jobe session closed");
    }
}
