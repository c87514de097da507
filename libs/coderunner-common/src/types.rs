use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Splitter used by combinator templates when the question does not set one.
pub const DEFAULT_TEST_SPLITTER: &str = r"#<ab@17943918#@>#\n";

/// Errors detected while loading a question, before any code is run.
#[derive(Debug, Error, PartialEq)]
pub enum QuestionError {
    #[error("Unknown grader '{0}'")]
    UnknownGrader(String),

    #[error("Invalid test splitter pattern '{pattern}': {reason}")]
    BadSplitter { pattern: String, reason: String },

    #[error("Grader '{0}' grades the whole submission and needs a combinator template")]
    MissingCombinatorTemplate(&'static str),

    #[error("Question has an empty per-test template")]
    MissingTemplate,

    #[error("Question language is not set")]
    MissingLanguage,

    #[error("Test case {index} has an invalid mark {mark}")]
    BadMark { index: usize, mark: f64 },

    #[error("Sandbox limit '{0}' must be a finite non-negative number")]
    BadLimit(&'static str),
}

/// Grading strategy selected by a question.
///
/// Serialized under the external grader names so that question files
/// written for older tooling keep working. Unknown names fail to
/// deserialize, which rejects the question at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GraderKind {
    #[default]
    #[serde(rename = "EqualityGrader")]
    Equality,
    #[serde(rename = "NearEqualityGrader")]
    NearEquality,
    #[serde(rename = "RegexGrader")]
    Regex,
    #[serde(rename = "TemplateGrader")]
    Template,
    #[serde(rename = "CombinatorTemplateGrader")]
    CombinatorTemplate,
}

impl GraderKind {
    pub fn name(&self) -> &'static str {
        match self {
            GraderKind::Equality => "EqualityGrader",
            GraderKind::NearEquality => "NearEqualityGrader",
            GraderKind::Regex => "RegexGrader",
            GraderKind::Template => "TemplateGrader",
            GraderKind::CombinatorTemplate => "CombinatorTemplateGrader",
        }
    }

    /// The executed program's output is the grading decision for the
    /// whole submission.
    pub fn is_self_grading(&self) -> bool {
        matches!(self, GraderKind::CombinatorTemplate)
    }

    /// Each test must run in its own sandbox execution.
    pub fn requires_isolation(&self) -> bool {
        matches!(self, GraderKind::Template)
    }
}

impl fmt::Display for GraderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GraderKind {
    type Err = QuestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "EqualityGrader" => Ok(GraderKind::Equality),
            "NearEqualityGrader" => Ok(GraderKind::NearEquality),
            "RegexGrader" => Ok(GraderKind::Regex),
            "TemplateGrader" => Ok(GraderKind::Template),
            "CombinatorTemplateGrader" => Ok(GraderKind::CombinatorTemplate),
            other => Err(QuestionError::UnknownGrader(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayPolicy {
    #[default]
    Show,
    Hide,
    HideIfFail,
    HideIfSucceed,
}

impl DisplayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayPolicy::Show => "SHOW",
            DisplayPolicy::Hide => "HIDE",
            DisplayPolicy::HideIfFail => "HIDE_IF_FAIL",
            DisplayPolicy::HideIfSucceed => "HIDE_IF_SUCCEED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[default]
    Normal,
    Precheck,
    Both,
}

impl TestType {
    /// Whether a test of this type runs for a precheck or a normal check.
    pub fn applies_to(&self, is_precheck: bool) -> bool {
        match self {
            TestType::Both => true,
            TestType::Normal => !is_precheck,
            TestType::Precheck => is_precheck,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            TestType::Normal => 0,
            TestType::Precheck => 1,
            TestType::Both => 2,
        }
    }
}

fn default_mark() -> f64 {
    1.0
}

/// A single author-defined test. Immutable for the duration of a grading run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub test_code: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default = "default_mark")]
    pub mark: f64,
    #[serde(default)]
    pub display: DisplayPolicy,
    #[serde(default)]
    pub use_as_example: bool,
    #[serde(default)]
    pub test_type: TestType,
    #[serde(default)]
    pub hide_rest_if_fail: bool,
    #[serde(default)]
    pub ordering: i32,
}

impl TestCase {
    pub fn new(test_code: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            test_code: test_code.into(),
            stdin: String::new(),
            expected: expected.into(),
            extra: String::new(),
            mark: default_mark(),
            display: DisplayPolicy::Show,
            use_as_example: false,
            test_type: TestType::Normal,
            hide_rest_if_fail: false,
            ordering: 0,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_mark(mut self, mark: f64) -> Self {
        self.mark = mark;
        self
    }
}

/// Resource limits forwarded to every sandbox run of a grading attempt.
///
/// Unset limits fall back to the deployment defaults; a limit that is
/// still unset after that is left to the sandbox's own default.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SandboxLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u32>,
}

impl SandboxLimits {
    /// Fill every unset limit from `fallback`. Set limits are never replaced.
    pub fn or(&self, fallback: &SandboxLimits) -> SandboxLimits {
        SandboxLimits {
            cpu_time_secs: self.cpu_time_secs.or(fallback.cpu_time_secs),
            wall_time_secs: self.wall_time_secs.or(fallback.wall_time_secs),
            memory_mb: self.memory_mb.or(fallback.memory_mb),
            disk_kb: self.disk_kb.or(fallback.disk_kb),
            max_processes: self.max_processes.or(fallback.max_processes),
        }
    }

    fn validate(&self) -> Result<(), QuestionError> {
        let bad = |v: Option<f64>| v.is_some_and(|v| !v.is_finite() || v < 0.0);
        if bad(self.cpu_time_secs) {
            return Err(QuestionError::BadLimit("cpu_time_secs"));
        }
        if bad(self.wall_time_secs) {
            return Err(QuestionError::BadLimit("wall_time_secs"));
        }
        Ok(())
    }
}

/// Base64 (de)serialization for named binary files.
pub mod file_map {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(files: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(
            files
                .iter()
                .map(|(name, bytes)| (name, general_purpose::STANDARD.encode(bytes))),
        )
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, data)| {
                general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| D::Error::custom(format!("file '{}' is not valid base64: {}", name, e)))
            })
            .collect()
    }
}

fn default_splitter() -> String {
    DEFAULT_TEST_SPLITTER.to_string()
}

/// Question definition as supplied by the host. Read-only during grading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub per_test_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combinator_template: Option<String>,
    #[serde(default = "default_splitter")]
    pub test_splitter_re: String,
    #[serde(default)]
    pub grader: GraderKind,
    #[serde(default)]
    pub limits: SandboxLimits,
    /// Extra sandbox-specific parameters, passed through untouched.
    #[serde(default)]
    pub sandbox_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub allow_multiple_stdins: bool,
    #[serde(default)]
    pub show_source: bool,
    #[serde(default)]
    pub extract_code_from_json: bool,
    #[serde(default)]
    pub template_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, with = "file_map")]
    pub support_files: BTreeMap<String, Vec<u8>>,
}

impl Question {
    pub fn new(language: impl Into<String>, per_test_template: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            language: language.into(),
            per_test_template: per_test_template.into(),
            combinator_template: None,
            test_splitter_re: default_splitter(),
            grader: GraderKind::Equality,
            limits: SandboxLimits::default(),
            sandbox_params: serde_json::Map::new(),
            allow_multiple_stdins: false,
            show_source: false,
            extract_code_from_json: false,
            template_params: serde_json::Map::new(),
            support_files: BTreeMap::new(),
        }
    }

    /// Compile the test splitter pattern.
    pub fn splitter(&self) -> Result<Regex, QuestionError> {
        Regex::new(&self.test_splitter_re).map_err(|e| QuestionError::BadSplitter {
            pattern: self.test_splitter_re.clone(),
            reason: e.to_string(),
        })
    }

    pub fn has_combinator(&self) -> bool {
        self.combinator_template
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Load-time checks. A question that passes can be graded without
    /// configuration errors surfacing mid-run.
    pub fn validate(&self) -> Result<(), QuestionError> {
        if self.language.trim().is_empty() {
            return Err(QuestionError::MissingLanguage);
        }
        if self.grader.is_self_grading() {
            if !self.has_combinator() {
                return Err(QuestionError::MissingCombinatorTemplate(self.grader.name()));
            }
        } else if self.per_test_template.trim().is_empty() {
            return Err(QuestionError::MissingTemplate);
        }
        if self.has_combinator() {
            self.splitter()?;
        }
        self.limits.validate()
    }
}

/// Reject test cases whose marks can't be summed into a sensible maximum.
pub fn validate_test_cases(test_cases: &[TestCase]) -> Result<(), QuestionError> {
    for (index, tc) in test_cases.iter().enumerate() {
        if !tc.mark.is_finite() || tc.mark < 0.0 {
            return Err(QuestionError::BadMark { index, mark: tc.mark });
        }
    }
    Ok(())
}

/// What the student handed in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Submission {
    pub answer: String,
    #[serde(default, with = "file_map")]
    pub attachments: BTreeMap<String, Vec<u8>>,
    /// Selected language for multi-language questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_language: Option<String>,
}

impl Submission {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Default::default()
        }
    }
}

/// One grading attempt, as queued between the intake API and the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub id: Uuid,
    pub question: Question,
    pub submission: Submission,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub is_precheck: bool,
    pub submitted_at: DateTime<Utc>,
}

impl GradingJob {
    pub fn new(question: Question, submission: Submission, test_cases: Vec<TestCase>, is_precheck: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            question,
            submission,
            test_cases,
            is_precheck,
            submitted_at: Utc::now(),
        }
    }

    /// Test cases for this kind of check, in ordering-key order.
    pub fn selected_test_cases(&self) -> Vec<TestCase> {
        let mut selected: Vec<TestCase> = self
            .test_cases
            .iter()
            .filter(|tc| tc.test_type.applies_to(self.is_precheck))
            .cloned()
            .collect();
        selected.sort_by_key(|tc| tc.ordering);
        selected
    }

    pub fn validate(&self) -> Result<(), QuestionError> {
        self.question.validate()?;
        validate_test_cases(&self.test_cases)
    }
}
