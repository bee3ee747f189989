use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::classifier::{DocumentClassifier, KeywordClassifier, confidence_score};
use crate::error::{BridgeError, EnvironmentError};
use crate::invoker::RawOutput;
use crate::payload::ParsedPayload;

pub const UNKNOWN: &str = "Unknown";
pub const NO_SUMMARY: &str = "No summary generated";

const DEPENDENCY_MARKERS: &[&str] = &[
    "modulenotfounderror",
    "no module named",
    "importerror",
    "torch",
    "transformers",
];

const FIX_STEPS: &str = "To fix this:\n\
1. Ensure Python 3.8+ is installed\n\
2. Install dependencies: pip install torch transformers sentence-transformers langchain faiss-cpu pypdf\n\
3. Restart the application";

/// What the caller knows about the document being analyzed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub query: String,
}

/// The uniform result of one analysis, successful or degraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord {
    pub id: String,
    pub file_name: String,
    pub file_size: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub original_text: String,
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<RawResult>,
}

impl AnalysisRecord {
    pub fn disease_type(&self) -> Option<&str> {
        self.metadata.get("diseaseType").and_then(Value::as_str)
    }

    pub fn confidence_score(&self) -> Option<&str> {
        self.metadata.get("confidenceScore").and_then(Value::as_str)
    }

    /// The raw error string, present only on degraded records.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }

    pub fn is_degraded(&self) -> bool {
        self.metadata.contains_key("error")
    }
}

/// Diagnostic copy of what the worker produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    pub payload_kind: String,
    #[serde(flatten)]
    pub output: RawOutput,
}

/// Why an analysis degraded, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RuntimeMissing,
    DependencyMissing,
    Unknown,
}

impl FailureKind {
    pub fn from_error(error: &BridgeError, stderr: Option<&str>) -> Self {
        match error {
            BridgeError::Environment(EnvironmentError::RuntimeNotFound) => Self::RuntimeMissing,
            other => Self::from_message(&other.to_string(), stderr),
        }
    }

    pub fn from_message(message: &str, stderr: Option<&str>) -> Self {
        let mentions_dependency = |text: &str| {
            let lower = text.to_lowercase();
            DEPENDENCY_MARKERS.iter().any(|marker| lower.contains(marker))
        };

        if mentions_dependency(message) || stderr.is_some_and(mentions_dependency) {
            Self::DependencyMissing
        } else {
            Self::Unknown
        }
    }

    fn explanation(&self, detail: &str) -> String {
        match self {
            Self::RuntimeMissing => "Python is not installed or not in PATH. Please install Python 3.8+ and add it to PATH, or set PYTHON_PATH.".to_string(),
            Self::DependencyMissing => "Python dependencies missing. Please install: pip install torch transformers sentence-transformers langchain faiss-cpu pypdf langchain-text-splitters".to_string(),
            Self::Unknown => detail.to_string(),
        }
    }
}

/// Turns parsed worker output into [`AnalysisRecord`]s.
#[derive(Clone)]
pub struct ResultNormalizer {
    classifier: Arc<dyn DocumentClassifier>,
}

impl Default for ResultNormalizer {
    fn default() -> Self {
        Self::new(Arc::new(KeywordClassifier::new()))
    }
}

impl ResultNormalizer {
    pub fn new(classifier: Arc<dyn DocumentClassifier>) -> Self {
        Self { classifier }
    }

    pub fn normalize(
        &self,
        payload: ParsedPayload,
        meta: &RequestMeta,
        raw: Option<&RawOutput>,
    ) -> AnalysisRecord {
        let raw_result = raw.map(|output| RawResult {
            payload_kind: payload.kind().to_string(),
            output: output.clone(),
        });

        match payload {
            ParsedPayload::Structured {
                summary,
                original_text,
                metadata,
            } => self.build(meta, summary, original_text, metadata, raw_result),
            ParsedPayload::ErrorSignaled { message } => {
                let stderr = raw.map(|output| output.stderr.as_str());
                let kind = FailureKind::from_message(&message, stderr);
                let summary = match kind {
                    FailureKind::DependencyMissing => format!(
                        "Error: {}\n\nWorker message: {message}\n\n{FIX_STEPS}",
                        kind.explanation(&message)
                    ),
                    _ => format!("Error: The analysis worker reported a failure: {message}"),
                };
                let mut metadata = Map::new();
                metadata.insert("error".to_string(), json!(message));
                self.build(
                    meta,
                    summary,
                    format!("Error details: {message}"),
                    metadata,
                    raw_result,
                )
            }
            ParsedPayload::Unstructured { raw_text } => {
                let summary = if raw_text.trim().is_empty() {
                    NO_SUMMARY.to_string()
                } else {
                    raw_text
                };
                self.build(meta, summary, String::new(), Map::new(), raw_result)
            }
        }
    }

    /// Record for an analysis that failed before producing usable output.
    pub fn degraded(
        &self,
        meta: &RequestMeta,
        kind: FailureKind,
        error: &str,
        raw: Option<&RawOutput>,
    ) -> AnalysisRecord {
        let summary = format!("Error: {}\n\n{FIX_STEPS}", kind.explanation(error));
        let mut metadata = Map::new();
        metadata.insert("error".to_string(), json!(error));
        let raw_result = raw.map(|output| RawResult {
            payload_kind: "failed".to_string(),
            output: output.clone(),
        });

        self.build(
            meta,
            summary,
            format!("Error details: {error}"),
            metadata,
            raw_result,
        )
    }

    fn build(
        &self,
        meta: &RequestMeta,
        summary: String,
        original_text: String,
        upstream: Map<String, Value>,
        raw_result: Option<RawResult>,
    ) -> AnalysisRecord {
        let timestamp = Utc::now();
        let file_size = format_file_size(meta.file_size_bytes);

        let mut metadata = Map::new();
        metadata.insert("fileSize".to_string(), json!(file_size));
        metadata.insert("processedAt".to_string(), json!(timestamp.to_rfc3339()));
        metadata.insert("pages".to_string(), json!(UNKNOWN));
        metadata.insert("chunks".to_string(), json!(UNKNOWN));
        metadata.insert("query".to_string(), json!(meta.query));
        metadata.insert(
            "diseaseType".to_string(),
            json!(self.classifier.classify(&summary)),
        );
        metadata.insert(
            "confidenceScore".to_string(),
            json!(confidence_score(&summary)),
        );
        metadata.insert(
            "summaryLength".to_string(),
            json!(summary.chars().count()),
        );
        metadata.insert(
            "originalTextLength".to_string(),
            json!(original_text.chars().count()),
        );
        // Worker-provided keys override the defaults above.
        metadata.extend(upstream.into_iter().filter(|(_, value)| !value.is_null()));

        AnalysisRecord {
            id: Uuid::new_v4().to_string(),
            file_name: meta.file_name.clone(),
            file_size,
            timestamp,
            summary,
            original_text,
            metadata,
            raw_result,
        }
    }
}

/// Kilobytes with two decimals, e.g. `"12.50 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    format!("{:.2} KB", bytes as f64 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpawnError;

    fn meta() -> RequestMeta {
        RequestMeta {
            file_name: "report.pdf".to_string(),
            file_size_bytes: 12_800,
            query: "Summarize this document".to_string(),
        }
    }

    #[test]
    fn structured_payload_keeps_worker_fields() {
        let mut upstream = Map::new();
        upstream.insert("pages".to_string(), json!(12));
        upstream.insert("language".to_string(), json!("en"));

        let record = ResultNormalizer::default().normalize(
            ParsedPayload::Structured {
                summary: "Patient treated for hypertension".to_string(),
                original_text: "Full text".to_string(),
                metadata: upstream,
            },
            &meta(),
            None,
        );

        assert_eq!(record.file_name, "report.pdf");
        assert_eq!(record.file_size, "12.50 KB");
        assert_eq!(record.summary, "Patient treated for hypertension");
        assert_eq!(record.original_text, "Full text");
        assert_eq!(record.metadata["pages"], json!(12));
        assert_eq!(record.metadata["chunks"], json!("Unknown"));
        assert_eq!(record.metadata["language"], json!("en"));
        assert_eq!(record.metadata["query"], json!("Summarize this document"));
        assert_eq!(record.disease_type(), Some("Hypertension"));
        assert_eq!(record.confidence_score(), Some("50%"));
        assert_eq!(record.metadata["summaryLength"], json!(32));
        assert_eq!(record.metadata["originalTextLength"], json!(9));
        assert!(!record.is_degraded());
        assert!(record.raw_result.is_none());
    }

    #[test]
    fn error_payload_becomes_explanatory_record() {
        let raw = RawOutput::from_stdout(r#"{"error":"model load failed"}"#);
        let record = ResultNormalizer::default().normalize(
            ParsedPayload::ErrorSignaled {
                message: "model load failed".to_string(),
            },
            &meta(),
            Some(&raw),
        );

        assert!(record.summary.contains("model load failed"));
        assert_eq!(record.original_text, "Error details: model load failed");
        assert_eq!(record.error(), Some("model load failed"));
        assert_eq!(
            record.raw_result.as_ref().map(|r| r.payload_kind.as_str()),
            Some("error")
        );
    }

    #[test]
    fn error_payload_mentioning_missing_module_explains_dependencies() {
        let record = ResultNormalizer::default().normalize(
            ParsedPayload::ErrorSignaled {
                message: "No module named 'faiss'".to_string(),
            },
            &meta(),
            None,
        );

        assert!(record.summary.contains("Python dependencies missing"));
        assert!(record.summary.contains("No module named 'faiss'"));
    }

    #[test]
    fn unstructured_payload_is_used_verbatim() {
        let record = ResultNormalizer::default().normalize(
            ParsedPayload::Unstructured {
                raw_text: "Hello world".to_string(),
            },
            &meta(),
            None,
        );

        assert_eq!(record.summary, "Hello world");
        assert_eq!(record.original_text, "");
        assert_eq!(record.disease_type(), Some("General Document"));
    }

    #[test]
    fn empty_unstructured_payload_gets_placeholder() {
        let record = ResultNormalizer::default().normalize(
            ParsedPayload::Unstructured {
                raw_text: String::new(),
            },
            &meta(),
            None,
        );

        assert_eq!(record.summary, NO_SUMMARY);
    }

    #[test]
    fn degraded_record_for_missing_runtime() {
        let error = BridgeError::from(EnvironmentError::RuntimeNotFound);
        let kind = FailureKind::from_error(&error, None);
        let record = ResultNormalizer::default().degraded(&meta(), kind, &error.to_string(), None);

        assert_eq!(kind, FailureKind::RuntimeMissing);
        assert!(record.summary.contains("Python is not installed"));
        assert_eq!(record.error(), Some(error.to_string().as_str()));
        assert_eq!(record.metadata["pages"], json!("Unknown"));
        assert!(record.is_degraded());
    }

    #[test]
    fn inaccessible_runtime_keeps_the_detail() {
        let error = BridgeError::from(EnvironmentError::RuntimeInaccessible {
            executable: "/opt/python/bin/python3".to_string(),
            reason: "Permission denied (os error 13)".to_string(),
        });
        let kind = FailureKind::from_error(&error, None);
        let record = ResultNormalizer::default().degraded(&meta(), kind, &error.to_string(), None);

        assert_eq!(kind, FailureKind::Unknown);
        assert!(record.summary.contains("Python not accessible at `/opt/python/bin/python3`"));
        assert!(record.summary.contains("Permission denied"));
    }

    #[test]
    fn failure_kind_reads_stderr() {
        let error = BridgeError::from(SpawnError::Cancelled);
        assert_eq!(FailureKind::from_error(&error, None), FailureKind::Unknown);
        assert_eq!(
            FailureKind::from_error(
                &error,
                Some("ModuleNotFoundError: No module named 'torch'")
            ),
            FailureKind::DependencyMissing
        );
    }

    #[test]
    fn custom_classifier_is_used() {
        struct Fixed;
        impl DocumentClassifier for Fixed {
            fn classify(&self, _summary: &str) -> String {
                "Invoice".to_string()
            }
        }

        let record = ResultNormalizer::new(Arc::new(Fixed)).normalize(
            ParsedPayload::Unstructured {
                raw_text: "diabetes".to_string(),
            },
            &meta(),
            None,
        );

        assert_eq!(record.disease_type(), Some("Invoice"));
    }

    #[test]
    fn record_serializes_in_camel_case() {
        let record = ResultNormalizer::default().normalize(
            ParsedPayload::Unstructured {
                raw_text: "text".to_string(),
            },
            &meta(),
            None,
        );
        let value = serde_json::to_value(&record).unwrap();

        assert!(value.get("fileName").is_some());
        assert!(value.get("originalText").is_some());
        assert!(value.get("rawResult").is_none());
    }
}
