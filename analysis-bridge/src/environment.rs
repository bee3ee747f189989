//! Runtime discovery and one-time environment provisioning.
//!
//! [`PythonProvisioner`] locates an interpreter, checks that the worker script
//! is present and installs the worker's requirements. [`EnvironmentState`]
//! wraps any [`Provisioner`] so that provisioning runs once per process, no
//! matter how many requests arrive before it finishes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::EnvironmentError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const MANUAL_INSTALL_HINT: &str = "pip install torch transformers sentence-transformers langchain faiss-cpu pypdf langchain-text-splitters";

/// Proof that the runtime was located and the worker script exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEnvironment {
    pub executable: String,
    pub interpreter_args: Vec<String>,
    pub script: PathBuf,
    /// False when the dependency install ran and failed.
    pub dependencies_verified: bool,
}

impl ReadyEnvironment {
    pub fn new(executable: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            interpreter_args: Vec::new(),
            script: script.into(),
            dependencies_verified: true,
        }
    }

    pub fn with_interpreter_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }
}

/// Prepares the external runtime for worker invocations.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> Result<ReadyEnvironment, EnvironmentError>;
}

/// Provisioner for a Python worker script.
pub struct PythonProvisioner {
    config: BridgeConfig,
}

impl PythonProvisioner {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Probe each candidate in priority order; the first one that answers
    /// the version probe wins.
    pub async fn detect_runtime(&self) -> Result<String, EnvironmentError> {
        info!("Detecting Python executable");

        if let Some(explicit) = &self.config.python_path {
            match self.probe_version(explicit).await {
                Ok(version) => {
                    info!(executable = %explicit, %version, "Found Python runtime");
                    return Ok(explicit.clone());
                }
                // An existing file that will not run is a broken setup, not a missing one.
                Err(reason) if Path::new(explicit).is_file() => {
                    return Err(EnvironmentError::RuntimeInaccessible {
                        executable: explicit.clone(),
                        reason,
                    });
                }
                Err(_) => {}
            }
        }

        let mut candidates: Vec<String> = self.config.well_known_paths.clone();
        if let Some(launcher) = &self.config.launcher {
            candidates.push(launcher.clone());
        }

        for candidate in &candidates {
            if let Ok(version) = self.probe_version(candidate).await {
                info!(executable = %candidate, %version, "Found Python runtime");
                return Ok(candidate.clone());
            }
        }

        if self.config.path_lookup {
            for candidate in lookup_on_path().await {
                if let Ok(version) = self.probe_version(&candidate).await {
                    info!(executable = %candidate, %version, "Found Python runtime on PATH");
                    return Ok(candidate);
                }
            }
        }

        Err(EnvironmentError::RuntimeNotFound)
    }

    /// Run the version probe; `Err` carries why the candidate was rejected.
    async fn probe_version(&self, candidate: &str) -> Result<String, String> {
        debug!(candidate, "Trying Python path");
        let mut command = Command::new(candidate);
        command
            .args(&self.config.version_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(PROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(candidate, error = %e, "Version probe could not start");
                return Err(e.to_string());
            }
            Err(_) => {
                debug!(candidate, "Version probe timed out");
                return Err(format!("version check timed out after {PROBE_TIMEOUT:?}"));
            }
        };

        if !output.status.success() {
            debug!(candidate, status = %output.status, "Version probe failed");
            return Err(format!("version check failed with {}", output.status));
        }

        // Python 2 reports its version on stderr.
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            Ok(String::from_utf8_lossy(&output.stderr).trim().to_string())
        } else {
            Ok(stdout)
        }
    }

    /// Best-effort `pip install -r <requirements>`.
    ///
    /// A failed install does not fail provisioning: the worker may already
    /// run in an environment that has its dependencies. If they really are
    /// missing, the first analysis comes back as a degraded record that says
    /// so. Returns whether the install (if any) succeeded.
    pub async fn install_dependencies(&self, executable: &str) -> bool {
        let Some(requirements) = &self.config.requirements_path else {
            return true;
        };

        if !tokio::fs::try_exists(requirements).await.unwrap_or(false) {
            debug!(path = %requirements.display(), "No requirements file, skipping install");
            return true;
        }

        info!(path = %requirements.display(), "Installing Python dependencies");

        let result = Command::new(executable)
            .args(["-m", "pip", "install", "-r"])
            .arg(requirements)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                info!("Dependencies installed successfully");
                true
            }
            Ok(output) => {
                warn!(
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    hint = %format!("\"{executable}\" -m {MANUAL_INSTALL_HINT}"),
                    "Could not install dependencies"
                );
                false
            }
            Err(e) => {
                warn!(
                    error = %e,
                    hint = %format!("\"{executable}\" -m {MANUAL_INSTALL_HINT}"),
                    "Could not install dependencies"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Provisioner for PythonProvisioner {
    async fn provision(&self) -> Result<ReadyEnvironment, EnvironmentError> {
        info!("Checking Python environment");

        let executable = self.detect_runtime().await?;
        verify_script(&self.config.script_path).await?;
        let dependencies_verified = self.install_dependencies(&executable).await;

        info!(%executable, dependencies_verified, "Python environment is ready");

        Ok(ReadyEnvironment {
            executable,
            interpreter_args: self.config.interpreter_args.clone(),
            script: self.config.script_path.clone(),
            dependencies_verified,
        })
    }
}

async fn verify_script(script: &Path) -> Result<(), EnvironmentError> {
    match tokio::fs::metadata(script).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(EnvironmentError::ScriptMissing(script.to_path_buf())),
    }
}

#[cfg(windows)]
async fn lookup_on_path() -> Vec<String> {
    let Ok(output) = Command::new("where").arg("python").output().await else {
        warn!("Could not find Python via \"where\" command");
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_lowercase().ends_with(".exe"))
        .map(str::to_string)
        .collect()
}

#[cfg(not(windows))]
async fn lookup_on_path() -> Vec<String> {
    let Ok(output) = Command::new("which")
        .args(["python3", "python"])
        .output()
        .await
    else {
        warn!("Could not find Python via \"which\" command");
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Process-lifetime readiness state with single-flight initialization.
///
/// The first caller runs the provisioner while concurrent callers wait for
/// its outcome. Success is memoized for the rest of the process. A failure
/// is handed to everyone who was waiting on that attempt, and the next call
/// made afterwards tries again.
pub struct EnvironmentState {
    ready: OnceCell<ReadyEnvironment>,
    last_failure: Mutex<Option<(u64, EnvironmentError)>>,
    attempts: AtomicU64,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self {
            ready: OnceCell::new(),
            last_failure: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> Option<&ReadyEnvironment> {
        self.ready.get()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Number of provisioning attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    pub async fn ensure_ready(
        &self,
        provisioner: &dyn Provisioner,
    ) -> Result<ReadyEnvironment, EnvironmentError> {
        if let Some(env) = self.ready.get() {
            return Ok(env.clone());
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.last_failure.lock().await;

        if let Some(env) = self.ready.get() {
            return Ok(env.clone());
        }
        if let Some((attempt, error)) = last_failure.as_ref() {
            if *attempt > seen {
                return Err(error.clone());
            }
        }

        let outcome = provisioner.provision().await;
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;

        match outcome {
            Ok(env) => {
                let _ = self.ready.set(env.clone());
                *last_failure = None;
                Ok(env)
            }
            Err(e) => {
                warn!(attempt, error = %e, "Environment provisioning failed");
                *last_failure = Some((attempt, e.clone()));
                Err(e)
            }
        }
    }
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self::new()
    }
}
