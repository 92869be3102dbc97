//! Run descriptions loaded from JSON files

use crate::errors::{ProcessError, Result};
use crate::execution::RunOptions;
use crate::utils::parse_size;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// A program run as described in a `--file` JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_true")]
    pub search_path: bool,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Variables set for the program, on top of the inherited environment
    /// unless `clear_env` is set
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub clear_env: bool,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub merge_stderr: bool,
    #[serde(default)]
    pub capture_stderr: bool,
    #[serde(default = "default_true")]
    pub check_status: bool,
    /// Limit on captured stdout, e.g. "10M"
    #[serde(default)]
    pub max_output: Option<String>,
}

impl RunConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            search_path: true,
            cwd: None,
            env: BTreeMap::new(),
            clear_env: false,
            uid: None,
            gid: None,
            input: None,
            merge_stderr: false,
            capture_stderr: false,
            check_status: true,
            max_output: None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(text)
            .map_err(|e| ProcessError::InvalidConfig(format!("invalid run description: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProcessError::InvalidConfig(format!("reading '{}': {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(ProcessError::InvalidConfig(
                "program must not be empty".to_string(),
            ));
        }
        self.output_limit()?;
        Ok(())
    }

    /// `max_output` in bytes
    pub fn output_limit(&self) -> Result<Option<u64>> {
        self.max_output.as_deref().map(parse_size).transpose()
    }

    /// The environment the program gets; `None` means inherit unchanged
    fn environment(&self) -> Option<BTreeMap<String, String>> {
        if self.clear_env {
            return Some(self.env.clone());
        }
        if self.env.is_empty() {
            return None;
        }

        let mut combined: BTreeMap<String, String> = std::env::vars().collect();
        for (key, value) in &self.env {
            combined.insert(key.clone(), value.clone());
        }
        Some(combined)
    }

    pub fn to_run_options(&self) -> Result<RunOptions> {
        self.validate()?;
        let mut options = RunOptions::new(&self.program)
            .search_path(self.search_path)
            .args(self.args.iter().cloned())
            .merge_stderr_to_stdout(self.merge_stderr)
            .capture_stderr(self.capture_stderr)
            .check_status(self.check_status);
        options.chdir = self.cwd.clone();
        options.uid = self.uid;
        options.gid = self.gid;
        options.environment = self.environment();
        options.input = self.input.as_ref().map(|s| s.clone().into_bytes());
        Ok(options)
    }
}
