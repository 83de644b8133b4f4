//! Append-only changelog.

use chrono::{DateTime, TimeDelta, Utc};
use foreman_core::{ChangeRecord, ChangelogEntry, ForemanError, ResourceKey, Result};
use serde_json::{from_slice, to_string};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Append-only record of completed changes.
///
/// Entries are immutable once recorded. When file backed, each entry is written as
/// one JSON line before it becomes visible in memory.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: Vec<ChangelogEntry>,
    path: Option<PathBuf>,
}

impl HistoryLog {
    /// Log kept in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) a JSON-lines changelog at `path`.
    ///
    /// A final line without its newline is what an interrupted append leaves behind.
    /// If it parses it is kept and terminated; otherwise it is cut off the file.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read, or a complete line
    /// fails to parse.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            load_entries(&path)?
        } else {
            Vec::new()
        };
        tracing::debug!("Loaded {} changelog entries from {}", entries.len(), path.display());
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an entry.
    ///
    /// The timestamp is taken now and forced strictly after the previous entry so
    /// that append order and timestamp order agree.
    ///
    /// # Errors
    /// Returns an error if the entry cannot be written; nothing is recorded then.
    pub(crate) fn record(&mut self, record: ChangeRecord) -> Result<&ChangelogEntry> {
        let now = Utc::now();
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp >= now => last.timestamp + TimeDelta::microseconds(1),
            _ => now,
        };

        let entry = ChangelogEntry {
            sequence: self.entries.len() as u64 + 1,
            timestamp,
            change_type: record.change_type,
            resource_keys: record.resource_keys,
            description: record.description,
            agent_roles: record.agent_roles,
            task_id: record.task_id,
        };

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let line = to_string(&entry)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{line}")?;
            file.sync_data()?;
        }

        tracing::info!(
            "Changelog #{} [{}] {}",
            entry.sequence,
            entry.change_type,
            entry.description
        );
        self.entries.push(entry);
        let recorded = self.entries.len() - 1;
        Ok(&self.entries[recorded])
    }

    /// All entries in append order
    pub fn entries(&self) -> &[ChangelogEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&ChangelogEntry> {
        self.entries.last()
    }

    /// Entries with `start <= timestamp < end`
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&ChangelogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.timestamp >= start && entry.timestamp < end)
            .collect()
    }

    /// Entries touching `key`
    pub fn for_resource(&self, key: &ResourceKey) -> Vec<&ChangelogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.resource_keys.contains(key))
            .collect()
    }
}

fn load_entries(path: &Path) -> Result<Vec<ChangelogEntry>> {
    let bytes = fs::read(path)?;
    let complete_len = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |newline| newline + 1);
    let (complete, tail) = bytes.split_at(complete_len);

    let mut entries = Vec::new();
    for (index, line) in complete.split(|byte| *byte == b'\n').enumerate() {
        if line.trim_ascii().is_empty() {
            continue;
        }
        let entry: ChangelogEntry = from_slice(line).map_err(|error| {
            ForemanError::Other(format!(
                "Failed to parse changelog line {}: {error}",
                index + 1
            ))
        })?;
        entries.push(entry);
    }

    if tail.trim_ascii().is_empty() {
        return Ok(entries);
    }
    match from_slice::<ChangelogEntry>(tail) {
        Ok(entry) => {
            let mut file = OpenOptions::new().append(true).open(path)?;
            writeln!(file)?;
            file.sync_data()?;
            entries.push(entry);
        }
        Err(error) => {
            tracing::warn!(
                "Dropping torn changelog line after entry {} in {}: {error}",
                entries.len(),
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(complete_len as u64)?;
            file.sync_data()?;
        }
    }
    Ok(entries)
}
