//! Request validation and structured output checks

use parley_ai::Body;

use crate::error::SessionError;
use crate::options::SessionOptions;

/// Check a run request before any provider call is made.
///
/// All problems are collected into a single [`SessionError::Validation`].
pub fn validate_request(
    body: &Body,
    options: &SessionOptions,
    stream: bool,
    supports_streaming: bool,
) -> Result<(), SessionError> {
    let mut problems = Vec::new();

    if body.is_empty() {
        problems.push("body has no interactions".to_string());
    }
    if options.max_turns == 0 {
        problems.push("max_turns must be at least 1".to_string());
    }
    if stream && !supports_streaming {
        problems.push("streaming requested but the provider does not support it".to_string());
    }
    if !body.results_follow_calls() {
        problems.push("a tool result precedes its tool call".to_string());
    }
    if let Some(schema) = body.json_output_schema() {
        if let Err(e) = jsonschema::validator_for(schema) {
            problems.push(format!("invalid JSON output schema: {}", e));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SessionError::Validation(problems))
    }
}

/// Check final assistant text against a JSON schema.
/// Returns `Some(error_message)` if the output does not conform, `None` if valid.
pub fn check_output(schema: &serde_json::Value, text: Option<&str>) -> Option<String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => return Some(format!("invalid JSON output schema: {}", e)),
    };

    let Some(text) = text else {
        return Some("no assistant output to validate".to_string());
    };
    let instance: serde_json::Value = match serde_json::from_str(text.trim()) {
        Ok(v) => v,
        Err(e) => return Some(format!("output is not valid JSON: {}", e)),
    };

    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Output schema validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
