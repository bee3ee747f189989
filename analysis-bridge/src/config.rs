use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_QUERY: &str = "Summarize this document";
pub const DEFAULT_SCRIPT_PATH: &str = "python/rag_pdf_summarizer.py";
pub const DEFAULT_REQUIREMENTS_PATH: &str = "python/requirements.txt";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Configuration for the analysis bridge.
///
/// Built from the environment with [`BridgeConfig::from_env`] or assembled
/// programmatically with the `with_*` setters.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Explicit runtime executable, probed before anything else.
    pub python_path: Option<String>,
    /// Installation paths probed after the explicit path.
    pub well_known_paths: Vec<String>,
    /// Platform launcher alias (`py` on Windows).
    pub launcher: Option<String>,
    /// Whether to fall back to a `which`/`where` lookup on the system PATH.
    pub path_lookup: bool,
    /// Arguments used to ask a candidate for its version.
    pub version_args: Vec<String>,
    /// Arguments placed before the script path when spawning the worker.
    pub interpreter_args: Vec<String>,
    pub script_path: PathBuf,
    pub requirements_path: Option<PathBuf>,
    pub query: String,
    /// No timeout unless set.
    pub timeout: Option<Duration>,
    /// Upper bound on stdout + stderr bytes captured per invocation.
    pub max_output_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            well_known_paths: default_well_known_paths(),
            launcher: Some(default_launcher().to_string()),
            path_lookup: true,
            version_args: vec!["--version".to_string()],
            interpreter_args: vec!["-u".to_string()],
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
            requirements_path: Some(PathBuf::from(DEFAULT_REQUIREMENTS_PATH)),
            query: DEFAULT_QUERY.to_string(),
            timeout: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl BridgeConfig {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            ..Self::default()
        }
    }

    /// Read configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = non_empty_var("PYTHON_PATH") {
            config.python_path = Some(path);
        }
        if let Some(script) = non_empty_var("ANALYSIS_SCRIPT") {
            config.script_path = PathBuf::from(script);
        }
        if let Some(requirements) = non_empty_var("ANALYSIS_REQUIREMENTS") {
            config.requirements_path = Some(PathBuf::from(requirements));
        }
        if let Some(query) = non_empty_var("ANALYSIS_QUERY") {
            config.query = query;
        }
        if let Some(secs) = parse_var::<u64>("ANALYSIS_TIMEOUT_SECS") {
            config.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(bytes) = parse_var::<usize>("ANALYSIS_MAX_OUTPUT_BYTES") {
            config.max_output_bytes = bytes;
        }

        config
    }

    pub fn with_python_path(mut self, path: impl Into<String>) -> Self {
        self.python_path = Some(path.into());
        self
    }

    pub fn with_well_known_paths(mut self, paths: Vec<String>) -> Self {
        self.well_known_paths = paths;
        self
    }

    pub fn with_launcher(mut self, launcher: Option<String>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_path_lookup(mut self, enabled: bool) -> Self {
        self.path_lookup = enabled;
        self
    }

    pub fn with_version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interpreter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_requirements(mut self, path: Option<PathBuf>) -> Self {
        self.requirements_path = path;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = non_empty_var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(windows)]
fn default_launcher() -> &'static str {
    "py"
}

#[cfg(not(windows))]
fn default_launcher() -> &'static str {
    "python3"
}

#[cfg(windows)]
fn default_well_known_paths() -> Vec<String> {
    let mut paths = Vec::new();
    let versions = ["314", "313", "312", "311", "310"];
    let user = std::env::var("USERNAME").ok();

    for version in versions {
        paths.push(format!("C:\\Python{version}\\python.exe"));
        if let Some(user) = &user {
            paths.push(format!(
                "C:\\Users\\{user}\\AppData\\Local\\Programs\\Python\\Python{version}\\python.exe"
            ));
        }
        paths.push(format!("C:\\Program Files\\Python{version}\\python.exe"));
    }
    if let Some(user) = &user {
        paths.push(format!("C:\\Users\\{user}\\anaconda3\\python.exe"));
    }

    paths
}

#[cfg(not(windows))]
fn default_well_known_paths() -> Vec<String> {
    [
        "/usr/local/bin/python3",
        "/usr/bin/python3",
        "/opt/homebrew/bin/python3",
        "/opt/conda/bin/python",
    ]
    .iter()
    .map(|path| path.to_string())
    .collect()
}
