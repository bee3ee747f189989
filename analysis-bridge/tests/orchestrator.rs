#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use analysis_bridge::{
    AnalysisOrchestrator, AnalysisRequest, BridgeConfig, BridgeError, CancellationToken,
    DocumentUpload, EnvironmentError, ProcessingError, Provisioner, PythonProvisioner,
    ReadyEnvironment,
};
use async_trait::async_trait;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    document: PathBuf,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let document = dir.path().join("report.pdf");
        std::fs::write(&document, b"%PDF-1.4 fixture")?;
        Ok(Self { dir, document })
    }

    /// Writes a shell worker and returns a config that runs it through `sh`.
    fn worker(&self, body: &str) -> anyhow::Result<BridgeConfig> {
        let script = self.dir.path().join("worker.sh");
        std::fs::write(&script, body)?;
        Ok(shell_config(&script))
    }
}

fn shell_config(script: &Path) -> BridgeConfig {
    BridgeConfig::new(script)
        .with_python_path("sh")
        .with_version_args(["-c", "exit 0"])
        .with_interpreter_args(Vec::<String>::new())
        .with_well_known_paths(Vec::new())
        .with_launcher(None)
        .with_path_lookup(false)
        .with_requirements(None)
}

fn emit(json: &str) -> String {
    format!("cat <<'EOF'\n{json}\nEOF\n")
}

#[tokio::test]
async fn diabetes_summary_is_classified_and_scored() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let filler = vec!["improvement"; 240].join(" ");
    let json = format!(
        r#"{{"summary":"Patient shows signs of diabetes management improvement over 6 months {filler}","metadata":{{"pages":12}}}}"#
    );
    let config = fixture.worker(&emit(&json))?;

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert_eq!(record.disease_type(), Some("Diabetes"));
    assert_eq!(record.confidence_score(), Some("90%"));
    assert_eq!(record.metadata["pages"], 12);
    assert_eq!(record.metadata["chunks"], "Unknown");
    assert_eq!(record.file_name, "report.pdf");
    assert!(!record.is_degraded());
    Ok(())
}

#[tokio::test]
async fn worker_error_becomes_a_record() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker(&emit(r#"{"error":"model load failed"}"#))?;

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert!(record.summary.contains("model load failed"));
    assert_eq!(record.error(), Some("model load failed"));
    Ok(())
}

#[tokio::test]
async fn plain_text_output_becomes_the_summary() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker("echo 'Hello world'\n")?;

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert_eq!(record.summary, "Hello world");
    assert_eq!(record.original_text, "");
    assert_eq!(
        record.raw_result.map(|raw| raw.payload_kind),
        Some("unstructured".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn missing_document_fails_with_processing_error() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker(&emit(r#"{"summary":"never used"}"#))?;

    let result = AnalysisOrchestrator::new(config)
        .process(fixture.dir.path().join("absent.pdf"))
        .await;

    assert!(matches!(
        result,
        Err(BridgeError::Processing(ProcessingError::NotFound(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn missing_runtime_fails_provisioning_but_process_degrades() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture
        .worker(&emit(r#"{"summary":"never used"}"#))?
        .with_python_path("/nonexistent/bin/python3");

    let provisioning = PythonProvisioner::new(config.clone()).provision().await;
    assert_eq!(provisioning, Err(EnvironmentError::RuntimeNotFound));

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert!(record.summary.contains("Python is not installed"));
    assert!(record.error().is_some_and(|e| e.contains("runtime not found")));
    Ok(())
}

#[tokio::test]
async fn missing_module_on_stderr_is_reported_as_dependency_problem() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker(
        "echo 'Traceback (most recent call last):' >&2\n\
         echo \"ModuleNotFoundError: No module named 'torch'\" >&2\n\
         exit 1\n",
    )?;

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert!(record.summary.contains("Python dependencies missing"));
    assert!(record
        .error()
        .is_some_and(|e| e.contains("No module named 'torch'")));
    Ok(())
}

#[tokio::test]
async fn timeout_degrades_instead_of_hanging() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture
        .worker("sleep 10\n")?
        .with_timeout(Duration::from_millis(200));

    let record = AnalysisOrchestrator::new(config)
        .process(&fixture.document)
        .await?;

    assert!(record.is_degraded());
    assert!(record.error().is_some_and(|e| e.contains("timed out")));
    Ok(())
}

#[tokio::test]
async fn cancellation_hook_stops_the_worker() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker("sleep 10\n")?;
    let orchestrator = AnalysisOrchestrator::new(config);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let record = orchestrator
        .process_request(AnalysisRequest::new(&fixture.document), &cancel)
        .await?;

    assert!(record.error().is_some_and(|e| e.contains("cancelled")));
    Ok(())
}

#[tokio::test]
async fn uploaded_document_is_removed_after_success() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker(&emit(
        r#"{"summary":"Court filing regarding a contract dispute","originalText":"...","metadata":{"pages":2,"chunks":4}}"#,
    ))?;

    let record = AnalysisOrchestrator::new(config)
        .process_upload(DocumentUpload::new(&fixture.document, "contract.pdf", 2048))
        .await?;

    assert_eq!(record.file_name, "contract.pdf");
    assert_eq!(record.file_size, "2.00 KB");
    assert_eq!(record.disease_type(), Some("Legal Document"));
    assert_eq!(record.metadata["chunks"], 4);
    assert!(!fixture.document.exists());
    Ok(())
}

struct CountingProvisioner {
    calls: AtomicUsize,
    inner: PythonProvisioner,
}

#[async_trait]
impl Provisioner for CountingProvisioner {
    async fn provision(&self) -> Result<ReadyEnvironment, EnvironmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.provision().await
    }
}

#[tokio::test]
async fn concurrent_requests_share_one_provisioning() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.worker(&emit(r#"{"summary":"Research study on crop data"}"#))?;
    let provisioner = Arc::new(CountingProvisioner {
        calls: AtomicUsize::new(0),
        inner: PythonProvisioner::new(config.clone()),
    });
    let orchestrator =
        Arc::new(AnalysisOrchestrator::new(config).with_provisioner(provisioner.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            let document = fixture.document.clone();
            tokio::spawn(async move { orchestrator.process(document).await })
        })
        .collect();

    for handle in handles {
        let record = handle.await??;
        assert_eq!(record.disease_type(), Some("Research Document"));
    }

    assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
    assert!(orchestrator.environment().is_ready());
    Ok(())
}
