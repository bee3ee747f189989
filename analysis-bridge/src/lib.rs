pub mod classifier;
pub mod config;
pub mod environment;
pub mod error;
pub mod invoker;
pub mod normalizer;
pub mod orchestrator;
pub mod payload;
pub mod upload;

// Re-export commonly used types
pub use classifier::{DocumentClassifier, KeywordClassifier, confidence_score};
pub use config::{BridgeConfig, DEFAULT_QUERY};
pub use environment::{EnvironmentState, Provisioner, PythonProvisioner, ReadyEnvironment};
pub use error::{BridgeError, EnvironmentError, ProcessingError, Result, SpawnError};
pub use invoker::{AnalysisRequest, RawOutput, WorkerInvoker};
pub use normalizer::{AnalysisRecord, FailureKind, RequestMeta, ResultNormalizer};
pub use orchestrator::AnalysisOrchestrator;
pub use payload::{ParsedPayload, parse};
pub use upload::{DocumentUpload, ScopedDocument};
pub use tokio_util::sync::CancellationToken;
