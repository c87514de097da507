/// Testing Outcome - Result Model of a Grading Attempt
///
/// **Core Responsibility:**
/// Hold everything the grading pipeline learned about one submission:
/// per-test results, the running mark, and the overall status.
///
/// **Critical Properties:**
/// - Every text field of a `TestResult` is size-capped when the result is
///   built, since outcomes are persisted
/// - `error_count == 0` with status `Valid` is the only meaning of "all correct"
/// - `mark_as_fraction` returns exactly 1.0 in that case
///
/// Built once per grading attempt by the worker, then serialized through
/// `codec` for storage. Nothing here performs I/O.

use crate::types::{DisplayPolicy, TestCase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker inserted where lines or characters were dropped.
pub const SNIP: &str = "...snip...";

/// Fractions closer to 1.0 than this are reported as full marks.
pub const FULL_MARK_TOLERANCE: f64 = 1e-5;

/// Caps applied to every stored text field of a test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationLimits {
    pub max_lines: usize,
    pub max_line_length: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            max_lines: 100,
            max_line_length: 200,
        }
    }
}

/// Strip trailing whitespace from every line and drop trailing blank lines.
pub fn clean(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').map(str::trim_end).collect();
    lines.join("\n").trim_end().to_string()
}

/// Make control characters visible, except newline and tab.
pub fn sanitise(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_control() && c != '\n' && c != '\t' {
            out.push_str(&format!("\\x{:02x}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

fn truncate_line(line: &str, max_len: usize) -> String {
    if line.chars().count() <= max_len {
        return line.to_string();
    }
    let marker = format!(" {}", SNIP);
    let marker_len = marker.chars().count();
    if max_len > marker_len {
        let mut kept: String = line.chars().take(max_len - marker_len).collect();
        kept.push_str(&marker);
        kept
    } else {
        line.chars().take(max_len).collect()
    }
}

/// Limit `text` to `limits.max_lines` lines of at most
/// `limits.max_line_length` characters. Excess lines are removed from the
/// middle so that both the start and the end of the output stay visible.
pub fn truncate(text: &str, limits: &TruncationLimits) -> String {
    if limits.max_lines == 0 || text.is_empty() {
        return String::new();
    }
    let (body, trailing_newline) = match text.strip_suffix('\n') {
        Some(body) => (body, true),
        None => (text, false),
    };
    let lines: Vec<&str> = body.split('\n').collect();

    let kept: Vec<&str> = if lines.len() > limits.max_lines {
        let remaining = limits.max_lines - 1;
        let head = remaining - remaining / 2;
        let tail = remaining / 2;
        let mut kept = Vec::with_capacity(limits.max_lines);
        kept.extend_from_slice(&lines[..head]);
        kept.push(SNIP);
        kept.extend_from_slice(&lines[lines.len() - tail..]);
        kept
    } else {
        lines
    };

    let mut out = kept
        .iter()
        .map(|line| truncate_line(line, limits.max_line_length))
        .collect::<Vec<_>>()
        .join("\n");
    if trailing_newline && kept.len() < limits.max_lines {
        out.push('\n');
    }
    out
}

/// Prepare text for storage: sanitise control characters, then cap size.
pub fn tidy(text: &str, limits: &TruncationLimits) -> String {
    truncate(&sanitise(text), limits)
}

/// Result of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_code: String,
    pub expected: String,
    pub got: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    pub mark: f64,
    pub awarded: f64,
    pub is_correct: bool,
    #[serde(default)]
    pub display: DisplayPolicy,
    #[serde(default)]
    pub hide_rest_if_fail: bool,
    #[serde(default)]
    pub abort: bool,
    /// Additional fields produced by a template grader, kept for display.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub grader_fields: BTreeMap<String, serde_json::Value>,
}

impl TestResult {
    /// Build a result for `tc`, capping every text field.
    pub fn new(tc: &TestCase, is_correct: bool, awarded: f64, got: &str, limits: &TruncationLimits) -> Self {
        let optional = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(tidy(s, limits))
            }
        };
        Self {
            test_code: tidy(&tc.test_code, limits),
            expected: tidy(&tc.expected, limits),
            got: tidy(got, limits),
            stdin: optional(&tc.stdin),
            extra: optional(&tc.extra),
            mark: tc.mark,
            awarded,
            is_correct,
            display: tc.display,
            hide_rest_if_fail: tc.hide_rest_if_fail,
            abort: false,
            grader_fields: BTreeMap::new(),
        }
    }

    /// Force this result to a zero-mark failure that ends the run.
    pub fn mark_aborted(&mut self) {
        self.abort = true;
        self.is_correct = false;
        self.awarded = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Valid,
    SyntaxError,
    SandboxError,
    SelfGraded,
}

/// Feedback produced by a self-grading program.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelfGradedFeedback {
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prologue_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epilogue_html: Option<String>,
    /// Results table, header row first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_formats: Option<Vec<String>>,
    #[serde(default)]
    pub show_differences: bool,
    #[serde(default)]
    pub output_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grader_state: Option<String>,
}

/// Aggregated outcome of one grading attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub error_message: String,
    pub error_count: u32,
    pub actual_mark: f64,
    pub max_possible_mark: f64,
    pub num_tests_expected: usize,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<SelfGradedFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code_list: Option<Vec<String>>,
    #[serde(default)]
    pub is_precheck: bool,
}

/// Maximum mark for a set of tests. A zero total is treated as 1 so that
/// fractions stay defined.
pub fn max_possible_mark(test_cases: &[TestCase]) -> f64 {
    let total: f64 = test_cases.iter().map(|tc| tc.mark).sum();
    if total == 0.0 {
        1.0
    } else {
        total
    }
}

impl TestingOutcome {
    pub fn new(max_possible_mark: f64, num_tests_expected: usize, is_precheck: bool) -> Self {
        Self {
            status: OutcomeStatus::Valid,
            error_message: String::new(),
            error_count: 0,
            actual_mark: 0.0,
            max_possible_mark,
            num_tests_expected,
            test_results: Vec::new(),
            feedback: None,
            source_code_list: None,
            is_precheck,
        }
    }

    /// Outcome of a run whose program graded itself. `fraction` is
    /// clamped to 0..1 before it is applied.
    pub fn self_graded(
        fraction: f64,
        max_possible_mark: f64,
        feedback: SelfGradedFeedback,
        num_tests_expected: usize,
        is_precheck: bool,
    ) -> Self {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            status: OutcomeStatus::SelfGraded,
            actual_mark: fraction * max_possible_mark,
            error_count: u32::from(fraction < 1.0),
            feedback: Some(feedback),
            ..Self::new(max_possible_mark, num_tests_expected, is_precheck)
        }
    }

    pub fn set_status(&mut self, status: OutcomeStatus, error_message: impl Into<String>) {
        self.status = status;
        self.error_message = error_message.into();
    }

    pub fn add_test_result(&mut self, result: TestResult) {
        self.actual_mark += result.awarded;
        if !result.is_correct {
            self.error_count += 1;
        }
        self.test_results.push(result);
    }

    pub fn mark_as_fraction(&self) -> f64 {
        match self.status {
            OutcomeStatus::Valid if self.error_count == 0 => 1.0,
            OutcomeStatus::Valid | OutcomeStatus::SelfGraded => {
                if self.max_possible_mark <= 0.0 {
                    return 0.0;
                }
                let fraction = (self.actual_mark / self.max_possible_mark).clamp(0.0, 1.0);
                if 1.0 - fraction < FULL_MARK_TOLERANCE {
                    1.0
                } else {
                    fraction
                }
            }
            OutcomeStatus::SyntaxError | OutcomeStatus::SandboxError => 0.0,
        }
    }

    pub fn all_correct(&self) -> bool {
        match self.status {
            OutcomeStatus::Valid => self.error_count == 0,
            OutcomeStatus::SelfGraded => self.mark_as_fraction() == 1.0,
            _ => false,
        }
    }

    pub fn was_aborted(&self) -> bool {
        self.test_results.iter().any(|r| r.abort)
    }

    pub fn run_failed(&self) -> bool {
        self.status == OutcomeStatus::SandboxError
    }

    pub fn has_syntax_error(&self) -> bool {
        self.status == OutcomeStatus::SyntaxError
    }

    pub fn is_self_graded(&self) -> bool {
        self.status == OutcomeStatus::SelfGraded
    }

    /// Display policy of a single result, ignoring hide-rest-if-fail.
    pub fn should_display(result: &TestResult) -> bool {
        match result.display {
            DisplayPolicy::Show => true,
            DisplayPolicy::Hide => false,
            DisplayPolicy::HideIfFail => result.is_correct,
            DisplayPolicy::HideIfSucceed => !result.is_correct,
        }
    }

    fn visible_mask(&self) -> Vec<bool> {
        let mut hiding_rest = false;
        self.test_results
            .iter()
            .map(|r| {
                let visible = !hiding_rest && Self::should_display(r);
                if r.hide_rest_if_fail && !r.is_correct {
                    hiding_rest = true;
                }
                visible
            })
            .collect()
    }

    /// Results a student is allowed to see, in test order. Everything after
    /// a failed hide-rest-if-fail test is hidden.
    pub fn visible_results(&self) -> Vec<&TestResult> {
        self.test_results
            .iter()
            .zip(self.visible_mask())
            .filter_map(|(r, visible)| visible.then_some(r))
            .collect()
    }

    pub fn count_hidden_errors(&self) -> usize {
        self.test_results
            .iter()
            .zip(self.visible_mask())
            .filter(|(r, visible)| !visible && !r.is_correct)
            .count()
    }
}
