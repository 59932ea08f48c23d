//! Assertion evaluation and variable extraction.
//!
//! A failed assertion is data, not control flow: evaluation always
//! returns the full outcome list with actual vs expected recorded.
//! Extraction is similarly non-fatal; a missing path leaves the
//! variable undefined and the problem surfaces downstream at point of
//! use as an unresolved-variable error.

use crate::model::{Assertion, AssertionOperator, AssertionOutcome, Extraction};
use crate::pipeline::PipelineResponse;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Addressable view of a response:
/// `{status, headers: {..}, body: <parsed json or raw string>}`.
pub fn response_root(response: &PipelineResponse) -> Value {
    let mut root = Map::new();
    root.insert("status".into(), Value::Number(response.status.into()));

    let mut headers = Map::new();
    for (name, value) in &response.headers {
        headers.insert(
            name.to_lowercase(),
            Value::String(value.clone()),
        );
    }
    root.insert("headers".into(), Value::Object(headers));

    let body = serde_json::from_str::<Value>(&response.body)
        .unwrap_or_else(|_| Value::String(response.body.clone()));
    root.insert("body".into(), body);

    Value::Object(root)
}

/// Dot-path lookup supporting object keys and numeric array indices.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    if path.is_empty() {
        return Some(current);
    }
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(array) => {
                let index = part.parse::<usize>().ok()?;
                array.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve an assertion/extraction path against the response root.
/// Paths starting with `status`/`headers`/`body` address the root
/// directly; bare paths fall back into the body.
fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let head = path.split('.').next().unwrap_or("");
    if matches!(head, "status" | "headers" | "body") {
        get_by_path(root, path)
    } else {
        get_by_path(root, &format!("body.{path}"))
    }
}

/// Evaluate all assertions against a response. Idempotent; never
/// panics or errors on a failing assertion.
pub fn evaluate(
    response: &PipelineResponse,
    assertions: &[Assertion],
) -> Vec<AssertionOutcome> {
    let root = response_root(response);
    assertions
        .iter()
        .map(|assertion| evaluate_one(&root, response, assertion))
        .collect()
}

fn evaluate_one(
    root: &Value,
    response: &PipelineResponse,
    assertion: &Assertion,
) -> AssertionOutcome {
    let mut outcome = AssertionOutcome {
        target: assertion.target.clone(),
        operator: assertion.operator,
        expected: assertion.expected.clone(),
        actual: None,
        passed: false,
        message: None,
    };

    match assertion.operator {
        AssertionOperator::StatusCode => {
            let actual = Value::Number(response.status.into());
            outcome.passed = values_equal(&actual, &assertion.expected);
            if !outcome.passed {
                outcome.message = Some(format!(
                    "expected status {}, got {}",
                    assertion.expected, response.status
                ));
            }
            outcome.actual = Some(actual);
        }
        AssertionOperator::Exists => {
            match resolve_path(root, &assertion.target) {
                Some(actual) => {
                    outcome.passed = true;
                    outcome.actual = Some(actual.clone());
                }
                None => {
                    outcome.message = Some(format!(
                        "path '{}' not found in response",
                        assertion.target
                    ));
                }
            }
        }
        AssertionOperator::Equals | AssertionOperator::NotEquals => {
            match resolve_path(root, &assertion.target) {
                Some(actual) => {
                    let equal = values_equal(actual, &assertion.expected);
                    outcome.passed = match assertion.operator {
                        AssertionOperator::NotEquals => !equal,
                        _ => equal,
                    };
                    if !outcome.passed {
                        outcome.message = Some(format!(
                            "path '{}': expected {} {}, got {}",
                            assertion.target,
                            if assertion.operator
                                == AssertionOperator::NotEquals
                            {
                                "anything but"
                            } else {
                                "value"
                            },
                            assertion.expected,
                            actual
                        ));
                    }
                    outcome.actual = Some(actual.clone());
                }
                None => {
                    outcome.message = Some(format!(
                        "path '{}' not found in response",
                        assertion.target
                    ));
                }
            }
        }
        AssertionOperator::Contains => {
            // Empty target matches against the raw body text.
            let actual = if assertion.target.is_empty() {
                Some(Value::String(response.body.clone()))
            } else {
                resolve_path(root, &assertion.target).cloned()
            };
            match actual {
                Some(actual) => {
                    outcome.passed = contains(&actual, &assertion.expected);
                    if !outcome.passed {
                        outcome.message = Some(format!(
                            "'{}' does not contain {}",
                            assertion.target, assertion.expected
                        ));
                    }
                    outcome.actual = Some(actual);
                }
                None => {
                    outcome.message = Some(format!(
                        "path '{}' not found in response",
                        assertion.target
                    ));
                }
            }
        }
    }

    outcome
}

/// Extract named variables from a response. Missing paths produce
/// warnings, never failures; the returned map only holds found values.
pub fn extract(
    response: &PipelineResponse,
    extractions: &[Extraction],
) -> (HashMap<String, Value>, Vec<String>) {
    let root = response_root(response);
    let mut values = HashMap::new();
    let mut warnings = Vec::new();

    for extraction in extractions {
        match resolve_path(&root, &extraction.path) {
            Some(value) => {
                debug!(
                    name = %extraction.name,
                    path = %extraction.path,
                    "extracted variable"
                );
                values.insert(extraction.name.clone(), value.clone());
            }
            None => {
                let message = format!(
                    "extraction '{}': path '{}' not found, variable left undefined",
                    extraction.name, extraction.path
                );
                warn!("{message}");
                warnings.push(message);
            }
        }
    }

    (values, warnings)
}

/// Type-aware equality: numeric strings equal numbers ("200" == 200),
/// boolean strings equal booleans, numbers compare by value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            as_f64(a) == as_f64(b)
        }
        (Value::Number(_), Value::String(s))
        | (Value::String(s), Value::Number(_)) => {
            let number = if matches!(a, Value::Number(_)) { a } else { b };
            s.trim().parse::<f64>().ok() == as_f64(number)
        }
        (Value::Bool(x), Value::String(s))
        | (Value::String(s), Value::Bool(x)) => {
            matches!(
                (x, s.trim().to_ascii_lowercase().as_str()),
                (true, "true") | (false, "false")
            )
        }
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => {
            let needle = match expected {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            haystack.contains(&needle)
        }
        Value::Array(items) => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Value::Object(map) => expected
            .as_str()
            .map(|key| map.contains_key(key))
            .unwrap_or(false),
        _ => false,
    }
}
