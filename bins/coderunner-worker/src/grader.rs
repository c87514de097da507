/// Grader Strategies - Output Scoring
///
/// **Core Responsibility:**
/// Turn the text produced by one test run into a `TestResult`.
///
/// **Critical Properties:**
/// - Knows nothing about sandboxes or templates
/// - Pure function: (output, test case) → result, no I/O
/// - `awarded = mark * fraction` and `is_correct` iff fraction is exactly 1.0
///
/// **Strategies:**
/// - `EqualityGrader`: trailing whitespace and trailing blank lines ignored
/// - `NearEqualityGrader`: also ignores blank lines, runs of spaces/tabs and case
/// - `RegexGrader`: `expected` is a pattern searched for anywhere in the output
/// - `TemplateGrader`: the output is itself a JSON grading record
/// - `CombinatorTemplateGrader`: grades the whole submission in one run; see
///   `parse_grading_record`
///
/// Graders are looked up once per run through `grader_for`, so an unknown
/// grader name never reaches this module.

use coderunner_common::outcome::{clean, tidy, SelfGradedFeedback, TestResult, TruncationLimits};
use coderunner_common::types::{GraderKind, TestCase};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Template-grader fractions this close to 1.0 count as full marks.
const FRACTION_SNAP: f64 = 1e-6;

pub trait Grader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Grade output from a run that completed normally.
    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult;

    /// Grade `output` for `tc`. When `is_bad` is set the output is an error
    /// report from a failed run and the result is always a zero-mark failure.
    fn grade(&self, output: &str, tc: &TestCase, is_bad: bool, limits: &TruncationLimits) -> TestResult {
        if is_bad {
            TestResult::new(tc, false, 0.0, output, limits)
        } else {
            self.grade_known_good(output, tc, limits)
        }
    }
}

pub fn grader_for(kind: GraderKind) -> Box<dyn Grader> {
    match kind {
        GraderKind::Equality => Box::new(EqualityGrader),
        GraderKind::NearEquality => Box::new(NearEqualityGrader),
        GraderKind::Regex => Box::new(RegexGrader),
        GraderKind::Template => Box::new(TemplateGrader),
        GraderKind::CombinatorTemplate => Box::new(CombinatorTemplateGrader),
    }
}

fn full_or_nothing(tc: &TestCase, is_correct: bool) -> f64 {
    if is_correct {
        tc.mark
    } else {
        0.0
    }
}

pub struct EqualityGrader;

impl Grader for EqualityGrader {
    fn name(&self) -> &'static str {
        GraderKind::Equality.name()
    }

    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult {
        let got = clean(output);
        let is_correct = got == clean(&tc.expected);
        TestResult::new(tc, is_correct, full_or_nothing(tc, is_correct), &got, limits)
    }
}

pub struct NearEqualityGrader;

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\n+").expect("valid regex"))
}

fn horizontal_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"))
}

/// Reduce already-cleaned text to the form compared by `NearEqualityGrader`.
fn reduce(cleaned: &str) -> String {
    let collapsed = blank_lines_re().replace_all(cleaned, "\n");
    let trimmed = collapsed.strip_prefix('\n').unwrap_or(collapsed.as_ref());
    horizontal_space_re().replace_all(trimmed, " ").to_lowercase()
}

impl Grader for NearEqualityGrader {
    fn name(&self) -> &'static str {
        GraderKind::NearEquality.name()
    }

    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult {
        let got = clean(output);
        let is_correct = reduce(&got) == reduce(&clean(&tc.expected));
        TestResult::new(tc, is_correct, full_or_nothing(tc, is_correct), &got, limits)
    }
}

pub struct RegexGrader;

impl Grader for RegexGrader {
    fn name(&self) -> &'static str {
        GraderKind::Regex.name()
    }

    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult {
        // An expected value that is not a valid pattern can never match
        let is_correct = Regex::new(&format!("(?ims){}", tc.expected.trim_end()))
            .map(|re| re.is_match(output))
            .unwrap_or(false);
        TestResult::new(tc, is_correct, full_or_nothing(tc, is_correct), output, limits)
    }
}

/// The per-test program prints a JSON record such as
/// `{"fraction": 0.5, "got": "42", "abort": false}`.
pub struct TemplateGrader;

const TEMPLATE_RECORD_KEYS: [&str; 4] = ["fraction", "got", "awarded", "abort"];

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_display_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TemplateGrader {
    fn record_result(record: &Map<String, Value>, tc: &TestCase, limits: &TruncationLimits) -> Option<TestResult> {
        let mut fraction = record.get("fraction").and_then(numeric)?;
        if (fraction - 1.0).abs() < FRACTION_SNAP {
            fraction = 1.0;
        }
        if !(0.0..=1.0).contains(&fraction) {
            return None;
        }
        let awarded = record
            .get("awarded")
            .and_then(numeric)
            .unwrap_or(tc.mark * fraction)
            .max(0.0)
            .min(tc.mark);
        let got = record.get("got").map(as_display_text).unwrap_or_default();

        let mut result = TestResult::new(tc, fraction == 1.0, awarded, &got, limits);
        result.abort = record.get("abort").is_some_and(truthy);
        result.grader_fields = record
            .iter()
            .filter(|(key, _)| !TEMPLATE_RECORD_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Some(result)
    }
}

impl Grader for TemplateGrader {
    fn name(&self) -> &'static str {
        GraderKind::Template.name()
    }

    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult {
        let record = match serde_json::from_str::<Value>(output) {
            Ok(Value::Object(record)) => record,
            _ => {
                let message = format!("Bad grading result from template: '{}'", output);
                return TestResult::new(tc, false, 0.0, &message, limits);
            }
        };
        Self::record_result(&record, tc, limits).unwrap_or_else(|| {
            let message = format!("Missing or bad fraction in grading result from template: '{}'", output);
            TestResult::new(tc, false, 0.0, &message, limits)
        })
    }
}

/// Self-grading programs report on the whole submission, never on one test.
pub struct CombinatorTemplateGrader;

impl Grader for CombinatorTemplateGrader {
    fn name(&self) -> &'static str {
        GraderKind::CombinatorTemplate.name()
    }

    fn grade_known_good(&self, output: &str, tc: &TestCase, limits: &TruncationLimits) -> TestResult {
        let message = format!("{} cannot grade a single test. Output was: {}", self.name(), output);
        TestResult::new(tc, false, 0.0, &message, limits)
    }
}

/// Accepts `true`/`false` as well as the 0/1 integers many grading scripts print.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(truthy(&Value::deserialize(deserializer)?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GradingRecord {
    #[serde(default)]
    fraction: Option<f64>,
    #[serde(default, alias = "feedbackhtml", alias = "feedback_html")]
    feedback: Option<String>,
    #[serde(default)]
    prologuehtml: Option<String>,
    #[serde(default)]
    epiloguehtml: Option<String>,
    #[serde(default)]
    testresults: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    columnformats: Option<Vec<String>>,
    #[serde(default, deserialize_with = "flag")]
    showdifferences: bool,
    #[serde(default, deserialize_with = "flag")]
    showoutputonly: bool,
    #[serde(default)]
    graderstate: Option<String>,
}

const CONTROL_COLUMNS: [&str; 2] = ["iscorrect", "ishidden"];

fn check_column_formats(table: &[Vec<Value>], formats: &[String]) -> Result<(), String> {
    let Some(header) = table.first() else {
        return Ok(());
    };
    let columns = header
        .iter()
        .filter(|cell| !cell.as_str().is_some_and(|name| CONTROL_COLUMNS.contains(&name)))
        .count();
    if formats.len() != columns {
        return Err(format!("expected {} column formats, got {}", columns, formats.len()));
    }
    match formats.iter().find(|f| f.as_str() != "%s" && f.as_str() != "%h") {
        Some(bad) => Err(format!("illegal column format '{}'", bad)),
        None => Ok(()),
    }
}

/// Decode the JSON record printed by a self-grading program into the mark
/// fraction and the feedback to show. The error is a short reason suitable
/// for inclusion in student-visible feedback.
pub fn parse_grading_record(stdout: &str) -> Result<(f64, SelfGradedFeedback), String> {
    let record: GradingRecord = serde_json::from_str(stdout).map_err(|e| format!("invalid grading record ({})", e))?;

    let fraction = if record.showoutputonly {
        1.0
    } else {
        match record.fraction {
            Some(f) if (0.0..=1.0).contains(&f) => f,
            _ => return Err("missing or bad fraction".to_string()),
        }
    };
    if record.feedback.is_none() && !record.showoutputonly {
        return Err("missing feedback".to_string());
    }

    if let (Some(table), Some(formats)) = (&record.testresults, &record.columnformats) {
        check_column_formats(table, formats)?;
    }

    let feedback = SelfGradedFeedback {
        feedback: record.feedback.unwrap_or_default(),
        prologue_html: record.prologuehtml,
        epilogue_html: record.epiloguehtml,
        test_results: record.testresults,
        column_formats: record.columnformats,
        show_differences: record.showdifferences,
        output_only: record.showoutputonly,
        grader_state: record.graderstate,
    };
    Ok((fraction, feedback))
}

/// Feedback shown when a self-grading program's output cannot be used.
pub fn bad_record_feedback(reason: &str, raw: &str, limits: &TruncationLimits) -> SelfGradedFeedback {
    SelfGradedFeedback {
        feedback: format!(
            "Bad output from self-grading program: {}\nOutput was:\n{}",
            reason,
            tidy(raw, limits)
        ),
        ..SelfGradedFeedback::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_test_case(expected: &str, mark: f64) -> TestCase {
        TestCase::new("print(answer())", expected).with_mark(mark)
    }

    fn limits() -> TruncationLimits {
        TruncationLimits::default()
    }

    #[test]
    fn test_equality_exact_match() {
        let tc = make_test_case("120", 2.0);
        let result = EqualityGrader.grade("120\n", &tc, false, &limits());

        assert!(result.is_correct);
        assert_eq!(result.awarded, 2.0);
        assert_eq!(result.got, "120");
    }

    #[test]
    fn test_equality_ignores_trailing_whitespace_only() {
        let tc = make_test_case("hello\nworld", 1.0);
        assert!(EqualityGrader.grade("hello   \nworld\n\n\n", &tc, false, &limits()).is_correct);
        assert!(!EqualityGrader.grade("  hello\nworld", &tc, false, &limits()).is_correct);
        assert!(!EqualityGrader.grade("Hello\nworld", &tc, false, &limits()).is_correct);
    }

    #[test]
    fn test_equality_mismatch_awards_nothing() {
        let tc = make_test_case("expected", 5.0);
        let result = EqualityGrader.grade("actual", &tc, false, &limits());

        assert!(!result.is_correct);
        assert_eq!(result.awarded, 0.0);
        assert_eq!(result.expected, "expected");
    }

    #[test]
    fn test_bad_run_is_always_wrong() {
        let tc = make_test_case("120", 1.0);
        let result = EqualityGrader.grade("120", &tc, true, &limits());

        assert!(!result.is_correct);
        assert_eq!(result.awarded, 0.0);
        assert_eq!(result.got, "120");
    }

    #[test]
    fn test_near_equality() {
        let tc = make_test_case("a  b\n\nc", 1.0);
        let result = NearEqualityGrader.grade("A B\nC", &tc, false, &limits());
        assert!(result.is_correct);
        assert_eq!(result.awarded, 1.0);

        let tc = make_test_case("\n\nx\ty", 1.0);
        assert!(NearEqualityGrader.grade("X Y\n", &tc, false, &limits()).is_correct);
        assert!(!NearEqualityGrader.grade("XY", &tc, false, &limits()).is_correct);
    }

    #[test]
    fn test_reduce() {
        assert_eq!(reduce("A  B\n\n\nC"), "a b\nc");
        assert_eq!(reduce("\nx"), "x");
        assert_eq!(reduce("tab\t\tsep"), "tab sep");
    }

    #[test]
    fn test_regex_grader() {
        let tc = make_test_case("^hello.*WORLD$\n", 1.0);
        assert!(RegexGrader.grade("hello\nbig world", &tc, false, &limits()).is_correct);

        let tc = make_test_case(r"\d{3}", 1.0);
        assert!(RegexGrader.grade("answer: 120!", &tc, false, &limits()).is_correct);
        assert!(!RegexGrader.grade("answer: 12", &tc, false, &limits()).is_correct);
    }

    #[test]
    fn test_regex_grader_invalid_pattern() {
        let tc = make_test_case("(unclosed", 1.0);
        let result = RegexGrader.grade("(unclosed", &tc, false, &limits());
        assert!(!result.is_correct);
        assert_eq!(result.awarded, 0.0);
    }

    #[test]
    fn test_template_grader_full_record() {
        let tc = make_test_case("", 4.0);
        let output = json!({"fraction": 0.5, "got": "41", "expected_note": "close"}).to_string();
        let result = TemplateGrader.grade(&output, &tc, false, &limits());

        assert!(!result.is_correct);
        assert_eq!(result.awarded, 2.0);
        assert_eq!(result.got, "41");
        assert!(!result.abort);
        assert_eq!(result.grader_fields.get("expected_note"), Some(&json!("close")));
    }

    #[test]
    fn test_template_grader_snaps_to_one() {
        let tc = make_test_case("", 3.0);
        let result = TemplateGrader.grade(r#"{"fraction": 0.9999999}"#, &tc, false, &limits());

        assert!(result.is_correct);
        assert_eq!(result.awarded, 3.0);
    }

    #[test]
    fn test_template_grader_awarded_and_abort() {
        let tc = make_test_case("", 3.0);
        let result = TemplateGrader.grade(r#"{"fraction": 0, "awarded": 0.25, "abort": true}"#, &tc, false, &limits());

        assert_eq!(result.awarded, 0.25);
        assert!(result.abort);
        assert!(result.grader_fields.is_empty());
    }

    #[test]
    fn test_template_grader_bad_output() {
        let tc = make_test_case("", 1.0);
        let result = TemplateGrader.grade("Traceback (most recent call last)", &tc, false, &limits());
        assert!(!result.is_correct);
        assert_eq!(result.awarded, 0.0);
        assert!(result.got.starts_with("Bad grading result from template: 'Traceback"));

        let result = TemplateGrader.grade(r#"{"got": "x"}"#, &tc, false, &limits());
        assert!(result.got.starts_with("Missing or bad fraction"));
    }

    #[test]
    fn test_template_grader_rejects_fraction_out_of_range() {
        let tc = make_test_case("", 1.0);
        for output in [r#"{"fraction": 2.0}"#, r#"{"fraction": -0.5}"#, r#"{"fraction": "NaN"}"#] {
            let result = TemplateGrader.grade(output, &tc, false, &limits());
            assert!(!result.is_correct, "{}", output);
            assert_eq!(result.awarded, 0.0, "{}", output);
            assert!(result.got.starts_with("Missing or bad fraction"), "{}", output);
        }
    }

    #[test]
    fn test_template_grader_awarded_stays_within_mark() {
        let tc = make_test_case("", 1.0);
        let result = TemplateGrader.grade(r#"{"fraction": 1, "awarded": 7}"#, &tc, false, &limits());
        assert!(result.is_correct);
        assert_eq!(result.awarded, 1.0);

        let result = TemplateGrader.grade(r#"{"fraction": 0, "awarded": -3}"#, &tc, false, &limits());
        assert_eq!(result.awarded, 0.0);
    }

    #[test]
    fn test_combinator_grader_never_passes_a_single_test() {
        let tc = make_test_case("", 1.0);
        let result = CombinatorTemplateGrader.grade(r#"{"fraction": 1}"#, &tc, false, &limits());
        assert!(!result.is_correct);
        assert_eq!(result.awarded, 0.0);
    }

    #[test]
    fn test_grader_for() {
        assert_eq!(grader_for(GraderKind::Equality).name(), "EqualityGrader");
        assert_eq!(grader_for(GraderKind::NearEquality).name(), "NearEqualityGrader");
        assert_eq!(grader_for(GraderKind::Regex).name(), "RegexGrader");
        assert_eq!(grader_for(GraderKind::Template).name(), "TemplateGrader");
        assert_eq!(grader_for(GraderKind::CombinatorTemplate).name(), "CombinatorTemplateGrader");
    }

    #[test]
    fn test_parse_grading_record() {
        let (fraction, feedback) = parse_grading_record(r#"{"fraction": 0.5, "feedback": "partial"}"#).unwrap();
        assert_eq!(fraction, 0.5);
        assert_eq!(feedback.feedback, "partial");
        assert!(!feedback.output_only);

        let (_, feedback) = parse_grading_record(r#"{"fraction": 1, "feedback_html": "<b>ok</b>"}"#).unwrap();
        assert_eq!(feedback.feedback, "<b>ok</b>");
    }

    #[test]
    fn test_parse_grading_record_output_only() {
        let (fraction, feedback) =
            parse_grading_record(r#"{"showoutputonly": 1, "prologuehtml": "<p>hi</p>"}"#).unwrap();
        assert_eq!(fraction, 1.0);
        assert!(feedback.output_only);
        assert_eq!(feedback.prologue_html.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_parse_grading_record_rejects_bad_records() {
        assert!(parse_grading_record("not json").is_err());
        assert!(parse_grading_record(r#"{"feedback": "no fraction"}"#).is_err());
        assert!(parse_grading_record(r#"{"fraction": 1.5}"#).is_err());
        assert!(parse_grading_record(r#"{"fraction": -0.1}"#).is_err());
        assert!(parse_grading_record(r#"{"fraction": 1, "mark": 3}"#).is_err());
    }

    #[test]
    fn test_parse_grading_record_requires_feedback() {
        assert_eq!(
            parse_grading_record(r#"{"fraction": 0.75}"#).unwrap_err(),
            "missing feedback"
        );
        let (fraction, feedback) = parse_grading_record(r#"{"fraction": 0.75, "feedback": ""}"#).unwrap();
        assert_eq!(fraction, 0.75);
        assert!(feedback.feedback.is_empty());
    }

    #[test]
    fn test_parse_grading_record_column_formats() {
        let good = json!({
            "fraction": 1,
            "feedback": "",
            "testresults": [["iscorrect", "Test", "Got"], [true, "f(1)", "1"]],
            "columnformats": ["%s", "%h"],
        });
        let (_, feedback) = parse_grading_record(&good.to_string()).unwrap();
        assert_eq!(feedback.test_results.map(|t| t.len()), Some(2));

        let wrong_count = json!({
            "fraction": 1,
            "testresults": [["iscorrect", "Test", "Got"]],
            "columnformats": ["%s"],
        });
        assert!(parse_grading_record(&wrong_count.to_string()).is_err());

        let bad_format = json!({
            "fraction": 1,
            "testresults": [["Test"]],
            "columnformats": ["%d"],
        });
        assert!(parse_grading_record(&bad_format.to_string()).is_err());
    }

    #[test]
    fn test_bad_record_feedback_includes_raw_text() {
        let feedback = bad_record_feedback("missing or bad fraction", "oops\x07", &limits());
        assert!(feedback.feedback.starts_with("Bad output from self-grading program"));
        assert!(feedback.feedback.contains("oops\\x07"));
    }
}
