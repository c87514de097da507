/// Sandbox Client - Contract With the Code-Executing Service
///
/// **Core Responsibility:**
/// Send one program (source, stdin, support files, limits) to an isolated
/// execution service and classify what happened.
///
/// **Critical Properties:**
/// - Knows nothing about templates, graders or marks
/// - `execute` never fails: transport and service problems are reported
///   through `RunResponse::error`, run problems through `RunResponse::result`
/// - Timeouts are a result classification, never retried here
/// - A session belongs to one grading attempt and is closed exactly once
///
/// Backends: `jobe` (remote REST service) and `docker` (local daemon).

pub mod docker;
pub mod jobe;

use async_trait::async_trait;
use coderunner_common::types::SandboxLimits;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure to obtain a usable sandbox at all.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox '{0}' is not available: {1}")]
    Unavailable(&'static str, String),

    #[error("Sandbox is misconfigured: {0}")]
    Misconfigured(String),
}

/// Service-level outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxErrorKind {
    Ok,
    Overload,
    UnsupportedLanguage,
    MisconfiguredSandbox,
    Other,
}

impl SandboxErrorKind {
    pub fn describe(&self) -> &'static str {
        match self {
            SandboxErrorKind::Ok => "OK",
            SandboxErrorKind::Overload => "Sandbox server overloaded. Please try again later.",
            SandboxErrorKind::UnsupportedLanguage => "Language not supported by the sandbox",
            SandboxErrorKind::MisconfiguredSandbox => "Sandbox is misconfigured or rejected the request",
            SandboxErrorKind::Other => "Sandbox could not be contacted",
        }
    }
}

/// How the submitted program itself ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Success,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    IllegalSyscall,
    InternalError,
    OutputLimitExceeded,
    AbnormalTermination,
}

impl RunResult {
    pub fn describe(&self) -> &'static str {
        match self {
            RunResult::Success => "Success",
            RunResult::CompilationError => "Compilation error",
            RunResult::RuntimeError => "Error",
            RunResult::TimeLimitExceeded => "Time limit exceeded",
            RunResult::MemoryLimitExceeded => "Memory limit exceeded",
            RunResult::IllegalSyscall => "Illegal function call",
            RunResult::InternalError => "Sandbox internal error",
            RunResult::OutputLimitExceeded => "Excessive output",
            RunResult::AbnormalTermination => "Abnormal termination",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    pub source: String,
    pub language: String,
    pub stdin: String,
    pub files: BTreeMap<String, Vec<u8>>,
    pub limits: SandboxLimits,
    /// Backend-specific extras, passed through verbatim.
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResponse {
    pub error: SandboxErrorKind,
    /// Extra text explaining a non-OK `error`.
    pub diagnostic: String,
    pub result: RunResult,
    pub stdout: String,
    pub stderr: String,
    pub cmpinfo: String,
    /// Signal that ended the program, 0 if none.
    pub signal: i32,
}

impl RunResponse {
    pub fn ok(result: RunResult, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            error: SandboxErrorKind::Ok,
            diagnostic: String::new(),
            result,
            stdout: stdout.into(),
            stderr: stderr.into(),
            cmpinfo: String::new(),
            signal: 0,
        }
    }

    pub fn compile_error(cmpinfo: impl Into<String>) -> Self {
        Self {
            cmpinfo: cmpinfo.into(),
            ..Self::ok(RunResult::CompilationError, "", "")
        }
    }

    pub fn failed(error: SandboxErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            error,
            diagnostic: diagnostic.into(),
            ..Self::ok(RunResult::InternalError, "", "")
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == SandboxErrorKind::Ok
    }

    /// Message for a non-OK `error`, suitable for the outcome.
    pub fn error_message(&self) -> String {
        if self.diagnostic.is_empty() {
            self.error.describe().to_string()
        } else {
            format!("{}\n{}", self.error.describe(), self.diagnostic)
        }
    }

    /// The run classification as shown to a student, e.g.
    /// `***Error*** (signal 11)`.
    pub fn result_string(&self) -> String {
        let mut s = format!("***{}***", self.result.describe());
        if self.result == RunResult::RuntimeError && self.signal != 0 {
            s.push_str(&format!(" (signal {})", self.signal));
        }
        s
    }

    /// Everything known about a failed run, one part per line, skipping
    /// empty parts.
    pub fn error_report(&self) -> String {
        let result = self.result_string();
        [self.cmpinfo.as_str(), self.stdout.as_str(), result.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|part| !part.trim().is_empty())
            .map(|part| part.trim_end_matches('\n'))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A factory of sessions. Shared by every grading attempt of a worker.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open_session(&self) -> Result<Box<dyn SandboxSession>, SandboxError>;
}

/// One grading attempt's exclusive handle on the sandbox.
#[async_trait]
pub trait SandboxSession: Send {
    async fn execute(&mut self, request: &RunRequest) -> RunResponse;

    async fn close(&mut self);
}
