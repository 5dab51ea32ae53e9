//! Run configuration consumed by the core, plus the `pyproject.toml` loader.

use log::debug;
use std::path::{Path, PathBuf};
use toml::Value;

/// Default name of the on-disk cache directory, created under the project
/// root.
pub const DEFAULT_CACHE_DIR: &str = ".presto_cache";

/// The option set the core consumes. Produced by the CLI layered over
/// `pyproject.toml`; the core never parses arguments itself.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Extra source roots prepended to the interpreter's import path.
    pub pythonpath: Vec<PathBuf>,
    /// Stop issuing plan steps after the first failed/errored outcome.
    pub fail_fast: bool,
    /// Plan only the items that failed or errored last run.
    pub last_failed: bool,
    /// Move last run's failures to the front of the plan.
    pub failed_first: bool,
    /// Redirect stdout/stderr into per-item buffers.
    pub capture_output: bool,
    /// Substring filter against item ids.
    pub pattern: Option<String>,
    /// Renderer hint carried on the run-started event.
    pub ascii_mode: bool,
    /// Cache directory; resolved against the project root when relative.
    pub cache_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pythonpath: Vec::new(),
            fail_fast: false,
            last_failed: false,
            failed_first: false,
            capture_output: true,
            pattern: None,
            ascii_mode: false,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl RunConfig {
    /// Absolute cache directory for a given project root.
    pub fn cache_dir_under(&self, root: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            root.join(&self.cache_dir)
        }
    }
}

/// Project-file configuration read from `[tool.presto]` in `pyproject.toml`.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    /// Extra source roots, relative to the project root.
    pub pythonpath: Vec<PathBuf>,
}

/// Read `[tool.presto]` from `pyproject.toml` under `root_path`. Missing or
/// malformed files degrade to defaults.
pub fn read_project_config(root_path: &Path) -> ProjectConfig {
    let pyproject_path = root_path.join("pyproject.toml");

    if !pyproject_path.exists() {
        debug!("No pyproject.toml found at {pyproject_path:?}");
        return ProjectConfig::default();
    }

    let content = match std::fs::read_to_string(&pyproject_path) {
        Ok(content) => content,
        Err(e) => {
            debug!("Failed to read pyproject.toml: {e}");
            return ProjectConfig::default();
        }
    };

    let toml_value: Value = match toml::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            debug!("Failed to parse pyproject.toml: {e}");
            return ProjectConfig::default();
        }
    };

    let mut config = ProjectConfig::default();

    let tool_table = toml_value.get("tool").and_then(|t| t.get("presto"));

    if let Some(pythonpath) = tool_table
        .and_then(|t| t.get("pythonpath"))
        .and_then(|t| t.as_array())
    {
        config.pythonpath = pythonpath
            .iter()
            .filter_map(|v| v.as_str())
            .map(PathBuf::from)
            .collect();
        debug!("Found pythonpath in pyproject.toml: {:?}", config.pythonpath);
    }

    config
}
