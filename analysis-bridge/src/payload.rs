use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::invoker::RawOutput;

/// The worker's result message, decoded.
///
/// Exactly one variant is produced for any worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    /// A well-formed result carrying a summary.
    Structured {
        summary: String,
        original_text: String,
        metadata: Map<String, Value>,
    },
    /// The worker reported a failure through the `error` field.
    ErrorSignaled { message: String },
    /// Output that could not be decoded, kept as text.
    Unstructured { raw_text: String },
}

impl ParsedPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedPayload::Structured { .. } => "structured",
            ParsedPayload::ErrorSignaled { .. } => "error",
            ParsedPayload::Unstructured { .. } => "unstructured",
        }
    }
}

/// Decode the primary channel of a finished worker.
pub fn parse(raw: &RawOutput) -> ParsedPayload {
    parse_output(&raw.stdout)
}

/// Decode worker stdout. Never fails.
pub fn parse_output(stdout: &str) -> ParsedPayload {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return ParsedPayload::Unstructured {
            raw_text: String::new(),
        };
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => classify(value),
        Err(e) => {
            // Stray prints before the final message: retry with the last line.
            if let Some(value) = last_line_object(trimmed) {
                debug!("Recovered result message from the last output line");
                return classify(value);
            }
            warn!(error = %e, bytes = trimmed.len(), "Worker output is not valid JSON");
            ParsedPayload::Unstructured {
                raw_text: trimmed.to_string(),
            }
        }
    }
}

fn last_line_object(text: &str) -> Option<Value> {
    let last = text.lines().rev().map(str::trim).find(|line| !line.is_empty())?;
    if last.len() == text.len() {
        return None;
    }
    match serde_json::from_str::<Value>(last) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn classify(value: Value) -> ParsedPayload {
    let Value::Object(mut fields) = value else {
        return ParsedPayload::Structured {
            summary: value.to_string(),
            original_text: String::new(),
            metadata: Map::new(),
        };
    };

    let present = |key: &str| fields.get(key).is_some_and(|v| !v.is_null());

    if present("error") {
        let error = fields.remove("error").unwrap_or_default();
        return ParsedPayload::ErrorSignaled {
            message: into_text(error),
        };
    }

    if !present("summary") {
        return ParsedPayload::Structured {
            summary: Value::Object(fields).to_string(),
            original_text: String::new(),
            metadata: Map::new(),
        };
    }

    let summary = fields.remove("summary").unwrap_or_default();
    ParsedPayload::Structured {
        summary: into_text(summary),
        original_text: fields
            .remove("originalText")
            .filter(|v| !v.is_null())
            .map(into_text)
            .unwrap_or_default(),
        metadata: match fields.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            _ => Map::new(),
        },
    }
}

fn into_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
