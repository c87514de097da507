//! Persistence boundary for testing outcomes.
//!
//! Outcomes are written as `{"schema_version": 1, "outcome": {...}}`.
//! Blobs without a version are the older flat format, whose field names
//! varied in case and underscores; those go through `decode_legacy`.

use crate::outcome::{OutcomeStatus, SelfGradedFeedback, TestResult, TestingOutcome};
use crate::types::DisplayPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Outcome is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported outcome schema version {0}")]
    UnsupportedVersion(u64),

    #[error("Legacy outcome has unknown status {0}")]
    UnknownLegacyStatus(i64),

    #[error("Legacy outcome is malformed: {0}")]
    MalformedLegacy(String),
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    schema_version: u32,
    outcome: &'a TestingOutcome,
}

#[derive(Deserialize)]
struct Envelope {
    outcome: TestingOutcome,
}

pub fn encode_outcome(outcome: &TestingOutcome) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&EnvelopeRef {
        schema_version: SCHEMA_VERSION,
        outcome,
    })?)
}

pub fn decode_outcome(data: &str) -> Result<TestingOutcome, CodecError> {
    let value: Value = serde_json::from_str(data)?;
    match value.get("schema_version") {
        None => decode_legacy(&value),
        Some(version) => match version.as_u64() {
            Some(v) if v == u64::from(SCHEMA_VERSION) => {
                let envelope: Envelope = serde_json::from_value(value)?;
                Ok(envelope.outcome)
            }
            Some(v) => Err(CodecError::UnsupportedVersion(v)),
            None => Err(CodecError::MalformedLegacy(format!("schema_version {}", version))),
        },
    }
}

/// Lowercase keys and drop underscores, recursively.
fn normalise_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_lowercase().replace('_', ""), normalise_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalise_keys).collect()),
        other => other.clone(),
    }
}

fn text(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn optional_text(map: &Map<String, Value>, key: &str) -> Option<String> {
    Some(text(map, key)).filter(|s| !s.is_empty())
}

fn number(map: &Map<String, Value>, key: &str) -> f64 {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn flag(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !(s.is_empty() || s == "0"),
        _ => false,
    }
}

fn legacy_display(value: &str) -> DisplayPolicy {
    match value.to_uppercase().as_str() {
        "HIDE" => DisplayPolicy::Hide,
        "HIDE_IF_FAIL" => DisplayPolicy::HideIfFail,
        "HIDE_IF_SUCCEED" => DisplayPolicy::HideIfSucceed,
        _ => DisplayPolicy::Show,
    }
}

fn legacy_result(value: &Value) -> Result<TestResult, CodecError> {
    let map = value
        .as_object()
        .ok_or_else(|| CodecError::MalformedLegacy("test result is not an object".to_string()))?;
    Ok(TestResult {
        test_code: text(map, "testcode"),
        expected: text(map, "expected"),
        got: text(map, "got"),
        stdin: optional_text(map, "stdin"),
        extra: optional_text(map, "extra"),
        mark: number(map, "mark"),
        awarded: number(map, "awarded"),
        is_correct: flag(map, "iscorrect"),
        display: legacy_display(&text(map, "display")),
        hide_rest_if_fail: flag(map, "hiderestiffail"),
        abort: flag(map, "abort"),
        grader_fields: BTreeMap::new(),
    })
}

/// Convert an unversioned outcome blob to the current schema.
///
/// Status codes: 1 valid, 2 syntax error, 3 (bad combinator) and 4 both
/// mean the run could not be graded, 5 is the old self-graded status.
pub fn decode_legacy(value: &Value) -> Result<TestingOutcome, CodecError> {
    let normalised = normalise_keys(value);
    let map = normalised
        .as_object()
        .ok_or_else(|| CodecError::MalformedLegacy("outcome is not an object".to_string()))?;

    let status_code = map.get("status").and_then(Value::as_i64).unwrap_or(1);
    let status = match status_code {
        1 => OutcomeStatus::Valid,
        2 => OutcomeStatus::SyntaxError,
        3 | 4 => OutcomeStatus::SandboxError,
        5 => OutcomeStatus::SelfGraded,
        other => return Err(CodecError::UnknownLegacyStatus(other)),
    };

    let test_results = match map.get("testresults") {
        Some(Value::Array(items)) => items.iter().map(legacy_result).collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    let feedback = optional_text(map, "feedbackhtml").map(|feedback| SelfGradedFeedback {
        feedback,
        ..Default::default()
    });

    let source_code_list = match map.get("sourcecodelist") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
        ),
        _ => None,
    };

    let max_possible_mark = number(map, "maxpossmark");
    Ok(TestingOutcome {
        status,
        error_message: text(map, "errormessage"),
        error_count: number(map, "errorcount").max(0.0) as u32,
        actual_mark: number(map, "actualmark"),
        max_possible_mark: if max_possible_mark > 0.0 { max_possible_mark } else { 1.0 },
        num_tests_expected: number(map, "numtestsexpected").max(0.0) as usize,
        test_results,
        feedback,
        source_code_list,
        is_precheck: flag(map, "isprecheck"),
    })
}
