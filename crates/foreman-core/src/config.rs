//! Configuration types for execution, workspace, storage and worker settings.

use crate::error::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{from_str, to_string_pretty};

/// Name of the project-local directory holding config and state.
pub const STATE_DIR_NAME: &str = ".foreman";

/// Complete coordinator configuration.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Scheduling configuration
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Tracked-resource configuration
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Persisted state configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Worker configuration used by the command-line front end
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Scheduling configuration.
///
/// Every field is optional in the config file; missing ones take their default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of tasks in progress at once
    pub max_parallel_workers: usize,
    /// Default per-task deadline in seconds; no deadline when absent
    pub task_deadline_seconds: Option<u64>,
    /// Reject plans whose touch set overlaps another planned or running task
    pub strict_planning: bool,
    /// How many times a failed snapshot write is retried before the commit is abandoned
    pub snapshot_retries: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: 4,
            task_deadline_seconds: None,
            strict_planning: false,
            snapshot_retries: 1,
        }
    }
}

impl ExecutionConfig {
    /// Default per-task deadline, if configured.
    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_seconds.map(Duration::from_secs)
    }
}

/// Tracked-resource configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root directory; resource keys are paths relative to it
    pub root_path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
        }
    }
}

/// Persisted state configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for state, changelog and legacy snapshots, relative to the workspace root
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(STATE_DIR_NAME),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Shell command run once per dispatched task
    #[serde(default)]
    pub command: Option<String>,
    /// Role names credited in changelog entries when the worker names none
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ForemanConfig {
    /// Config file path inside a project (`<project>/.foreman/config.toml`).
    pub fn config_path(project: &Path) -> PathBuf {
        project.join(STATE_DIR_NAME).join("config.toml")
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        if self.storage.state_dir.is_absolute() {
            self.storage.state_dir.clone()
        } else {
            self.workspace.root_path.join(&self.storage.state_dir)
        }
    }

    /// Load config from `path`, creating it with default values if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed, or created.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            let config = Self::default();
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|error| ForemanError::Config(format!("Failed to read config: {error}")))?;
        let config: Self = from_str(&contents)?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: max_parallel_workers={}, worker command {}",
            path,
            config.execution.max_parallel_workers,
            if config.worker.command.is_some() {
                "present"
            } else {
                "missing"
            }
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                ForemanError::Config(format!("Failed to create config directory: {error}"))
            })?;
        }

        let contents = to_string_pretty(self).map_err(|error| {
            ForemanError::Config(format!("Failed to serialize config: {error}"))
        })?;

        let header = "# Foreman Configuration File\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}"))
            .map_err(|error| ForemanError::Config(format!("Failed to write config: {error}")))?;

        Ok(())
    }

    /// Checks values serde cannot.
    ///
    /// # Errors
    /// Returns `Config` when `max_parallel_workers` is zero or a deadline of zero seconds is set.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_workers == 0 {
            return Err(ForemanError::Config(
                "execution.max_parallel_workers must be at least 1".to_owned(),
            ));
        }
        if self.execution.task_deadline_seconds == Some(0) {
            return Err(ForemanError::Config(
                "execution.task_deadline_seconds must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
