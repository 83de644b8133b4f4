//! On-disk project layout.
//!
//! ```text
//! <root>/.foreman/config.toml
//! <root>/.foreman/state.json       features, tasks, plans, queue
//! <root>/.foreman/changelog.jsonl  one entry per line
//! <root>/.foreman/legacy/          one file per snapshot
//! ```

use foreman_core::{ForemanConfig, ForemanError, Result};
use serde_json::{from_str, to_string_pretty};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{DirectorySink, LegacyArchive};
use crate::executor::WorkspaceState;
use crate::history::HistoryLog;
use crate::orchestrator::Orchestrator;
use crate::store::{FeatureStore, ProjectState};
use crate::worker::{CommandWorker, TaskWorker};

const STATE_FILE: &str = "state.json";
const CHANGELOG_FILE: &str = "changelog.jsonl";
const LEGACY_DIR: &str = "legacy";
const HALT_FILE: &str = "HALTED";

/// A project directory with its configuration
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config: ForemanConfig,
}

impl Project {
    /// Open the project at `directory`, writing a default config on first use.
    ///
    /// A relative `workspace.root_path` is resolved against `directory`.
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed or created.
    pub fn open(directory: &Path) -> Result<Self> {
        let config = ForemanConfig::load_or_create(&ForemanConfig::config_path(directory))?;
        Ok(Self::with_config(directory, config))
    }

    /// Use `config` instead of the project's config file
    pub fn with_config(directory: &Path, config: ForemanConfig) -> Self {
        let root = if config.workspace.root_path.is_absolute() {
            config.workspace.root_path.clone()
        } else {
            directory.join(&config.workspace.root_path)
        };
        Self { root, config }
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loaded configuration
    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    /// Directory holding persisted state
    pub fn state_dir(&self) -> PathBuf {
        if self.config.storage.state_dir.is_absolute() {
            self.config.storage.state_dir.clone()
        } else {
            self.root.join(&self.config.storage.state_dir)
        }
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    /// Read the feature store, or start an empty one.
    ///
    /// # Errors
    /// Returns an error if the state file exists but cannot be read or is inconsistent.
    pub fn load_store(&self) -> Result<FeatureStore> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(FeatureStore::new());
        }
        let contents = fs::read_to_string(&path)?;
        let state: ProjectState = from_str(&contents).map_err(|error| {
            ForemanError::Other(format!("Failed to parse {}: {error}", path.display()))
        })?;
        FeatureStore::from_state(state)
    }

    /// Build an orchestrator over the persisted state.
    ///
    /// Tasks a previous run left `InProgress` come back `Blocked`.
    ///
    /// # Errors
    /// Returns an error if any persisted artifact cannot be loaded.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let state_dir = self.state_dir();
        let archive = LegacyArchive::open(
            Box::new(DirectorySink::new(state_dir.join(LEGACY_DIR))),
            self.config.execution.snapshot_retries,
        )?;
        let history = HistoryLog::open(state_dir.join(CHANGELOG_FILE))?;

        let mut orchestrator = Orchestrator::new(
            self.config.execution.clone(),
            self.load_store()?,
            history,
            archive,
            WorkspaceState::new(self.root.clone()),
        )?
        .with_roles(self.config.worker.roles.iter().cloned())
        .with_halt(self.halt_reason()?);
        if let Some(worker) = self.command_worker() {
            orchestrator = orchestrator.with_worker(worker);
        }
        Ok(orchestrator)
    }

    /// Halt left by a previous run, if any
    fn halt_reason(&self) -> Result<Option<String>> {
        let path = self.state_dir().join(HALT_FILE);
        if path.exists() {
            Ok(Some(fs::read_to_string(path)?.trim().to_owned()))
        } else {
            Ok(None)
        }
    }

    /// The configured shell worker, if any
    pub fn command_worker(&self) -> Option<Arc<dyn TaskWorker>> {
        let command = self.config.worker.command.as_ref()?;
        let worker: Arc<dyn TaskWorker> = Arc::new(CommandWorker::new(command, self.root.clone()));
        Some(worker)
    }

    /// Persist the store and the halt marker.
    ///
    /// The state is written next to the target and renamed over it, so a crash leaves
    /// either the old or the new state.
    ///
    /// # Errors
    /// Returns an error if the state cannot be written.
    pub fn save(&self, orchestrator: &Orchestrator) -> Result<()> {
        let path = self.state_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, to_string_pretty(orchestrator.store().state())?)?;
        fs::rename(&staging, &path)?;

        let marker = self.state_dir().join(HALT_FILE);
        match orchestrator.halt_reason() {
            Some(reason) => fs::write(&marker, reason)?,
            None if marker.exists() => fs::remove_file(&marker)?,
            None => {}
        }
        tracing::debug!("Saved state to {}", path.display());
        Ok(())
    }
}
