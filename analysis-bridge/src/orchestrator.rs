//! The single entry point that turns a document path into an
//! [`AnalysisRecord`].
//!
//! Each call runs **provision → invoke → parse → normalize**:
//!
//! 1. The input document must exist. This is the only failure reported as an error
//!    ([`ProcessingError::NotFound`]); without a document there is nothing to describe.
//! 2. The environment is provisioned once per orchestrator and shared by every later
//!    call (see [`EnvironmentState`]).
//! 3. One worker process runs per call.
//! 4. Anything that goes wrong after step 1 (runtime missing, worker crash, timeout,
//!    garbage output) comes back as a *degraded* record whose summary explains the
//!    failure and whose `metadata.error` carries the raw error string.
//!
//! ```rust,no_run
//! use analysis_bridge::{AnalysisOrchestrator, BridgeConfig};
//!
//! # async fn run() -> analysis_bridge::Result<()> {
//! let orchestrator = AnalysisOrchestrator::new(BridgeConfig::from_env());
//! let record = orchestrator.process("uploads/report.pdf").await?;
//! println!("{} ({})", record.summary, record.metadata["diseaseType"]);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::DocumentClassifier;
use crate::config::BridgeConfig;
use crate::environment::{EnvironmentState, Provisioner, PythonProvisioner, ReadyEnvironment};
use crate::error::{BridgeError, ProcessingError, Result};
use crate::invoker::{AnalysisRequest, RawOutput, WorkerInvoker};
use crate::normalizer::{AnalysisRecord, FailureKind, RequestMeta, ResultNormalizer};
use crate::payload::{self, ParsedPayload};
use crate::upload::{DocumentUpload, ScopedDocument};

pub struct AnalysisOrchestrator {
    query: String,
    provisioner: Arc<dyn Provisioner>,
    environment: EnvironmentState,
    invoker: WorkerInvoker,
    normalizer: ResultNormalizer,
}

impl AnalysisOrchestrator {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            query: config.query.clone(),
            invoker: WorkerInvoker::from_config(&config),
            provisioner: Arc::new(PythonProvisioner::new(config)),
            environment: EnvironmentState::new(),
            normalizer: ResultNormalizer::default(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DocumentClassifier>) -> Self {
        self.normalizer = ResultNormalizer::new(classifier);
        self
    }

    pub fn with_invoker(mut self, invoker: WorkerInvoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn environment(&self) -> &EnvironmentState {
        &self.environment
    }

    /// Provision the environment if no call has done so yet.
    pub async fn ensure_ready(&self) -> Result<ReadyEnvironment> {
        Ok(self
            .environment
            .ensure_ready(self.provisioner.as_ref())
            .await?)
    }

    /// Analyze the document at `document_path` with the configured query.
    pub async fn process(&self, document_path: impl AsRef<Path>) -> Result<AnalysisRecord> {
        let request = AnalysisRequest::new(document_path.as_ref()).with_query(self.query.clone());
        self.process_request(request, &CancellationToken::new())
            .await
    }

    /// Like [`process`](Self::process), with an explicit query and a
    /// cancellation hook that kills the worker when triggered.
    pub async fn process_request(
        &self,
        request: AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisRecord> {
        let metadata = tokio::fs::metadata(&request.document_path)
            .await
            .map_err(|_| ProcessingError::NotFound(request.document_path.clone()))?;

        let file_name = request
            .document_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.document_path.display().to_string());

        let meta = RequestMeta {
            file_name,
            file_size_bytes: metadata.len(),
            query: request.query.clone(),
        };

        Ok(self.analyze(&request, &meta, cancel).await)
    }

    /// Analyze an uploaded document, then delete it.
    ///
    /// The file is removed on every path, including errors and cancellation.
    pub async fn process_upload(&self, upload: DocumentUpload) -> Result<AnalysisRecord> {
        let guard = ScopedDocument::new(&upload.path);

        if !tokio::fs::try_exists(guard.path()).await.unwrap_or(false) {
            return Err(ProcessingError::NotFound(upload.path).into());
        }

        info!(
            file = %upload.original_file_name,
            path = %upload.path.display(),
            bytes = upload.file_size_bytes,
            "Processing uploaded document"
        );

        let request = AnalysisRequest::new(&upload.path).with_query(self.query.clone());
        let meta = RequestMeta {
            file_name: upload.original_file_name,
            file_size_bytes: upload.file_size_bytes,
            query: request.query.clone(),
        };

        let record = self
            .analyze(&request, &meta, &CancellationToken::new())
            .await;
        guard.cleanup().await;

        Ok(record)
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
        meta: &RequestMeta,
        cancel: &CancellationToken,
    ) -> AnalysisRecord {
        let env = match self.ensure_ready().await {
            Ok(env) => env,
            Err(e) => return self.degrade(meta, &e),
        };

        let raw = match self.invoker.invoke(&env, request, cancel).await {
            Ok(raw) => raw,
            Err(e) => return self.degrade(meta, &BridgeError::from(e)),
        };

        let parsed = payload::parse(&raw);

        if let ParsedPayload::Unstructured { raw_text } = &parsed {
            if raw_text.is_empty() {
                let detail = empty_output_detail(&raw);
                warn!(exit_code = ?raw.exit_code, "Worker produced no result");
                let kind = FailureKind::from_message(&detail, Some(&raw.stderr));
                return self.normalizer.degraded(meta, kind, &detail, Some(&raw));
            }
        }

        let record = self.normalizer.normalize(parsed, meta, Some(&raw));
        info!(
            id = %record.id,
            file = %record.file_name,
            summary_length = record.summary.len(),
            original_text_length = record.original_text.len(),
            degraded = record.is_degraded(),
            "Analysis completed"
        );
        record
    }

    fn degrade(&self, meta: &RequestMeta, error: &BridgeError) -> AnalysisRecord {
        error!(file = %meta.file_name, error = %error, "Analysis failed, returning degraded record");
        let kind = FailureKind::from_error(error, None);
        self.normalizer.degraded(meta, kind, &error.to_string(), None)
    }
}

fn empty_output_detail(raw: &RawOutput) -> String {
    let exit = match (raw.exit_code, raw.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown exit status".to_string(),
    };
    match raw.stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(last) => format!("Python script returned empty output ({exit}): {last}"),
        None => format!("Python script returned empty output ({exit})"),
    }
}
