//! Command handlers for CLI operations

use anyhow::{Context as _, Result};
use core::time::Duration;
use foreman_agent::{Command, CommandOutcome, Orchestrator, Project, Verdict};
use foreman_core::{
    FeatureId, ImpactMatrix, ResourceKey, STATE_DIR_NAME, SnapshotHandle, TaskId, TaskSpec,
};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::cli::{Cli, Commands};

/// Log to `<project>/.foreman/debug.log`; stdout is reserved for command output.
///
/// # Errors
/// Returns an error if the log file cannot be opened.
pub fn init_logging(project: &Path) -> Result<()> {
    let state_dir = project.join(STATE_DIR_NAME);
    fs::create_dir_all(&state_dir)?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(state_dir.join("debug.log"))?;

    Registry::default()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman_agent=info,foreman_cli=info".into()),
        )
        .with(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_level(true),
        )
        .init();
    Ok(())
}

/// Run one CLI invocation and map its outcome to an exit code.
///
/// # Errors
/// Returns an error if project state cannot be loaded or saved, or an input file
/// cannot be read.
pub async fn handle(cli: Cli) -> Result<ExitCode> {
    let project = Project::open(&cli.project)
        .with_context(|| format!("Failed to open project at {}", cli.project.display()))?;
    let mut orchestrator = project.orchestrator()?;
    let mut stdout = io::stdout();

    let command = match cli.command {
        Commands::Status { feature, all } => {
            write_status(&mut stdout, &orchestrator, feature, all)?;
            project.save(&orchestrator)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::History { resource } => {
            write_history(&mut stdout, &orchestrator, resource.map(ResourceKey::from))?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Snapshots { resource } => {
            write_snapshots(&mut stdout, &orchestrator, resource.map(ResourceKey::from))?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Batches => {
            for (index, batch) in orchestrator.store().topological_batches().iter().enumerate() {
                let names: Vec<&str> = batch.iter().map(TaskId::as_str).collect();
                writeln!(stdout, "{}: {}", index + 1, names.join(", "))?;
            }
            return Ok(ExitCode::SUCCESS);
        }
        other => into_command(other)?,
    };

    tracing::debug!("Running {command:?}");
    let outcome = command.run(&mut orchestrator).await;
    project.save(&orchestrator)?;
    tracing::info!("Command finished: {:?}", outcome.status);
    write_outcome(&mut stdout, &outcome)?;
    Ok(ExitCode::from(outcome.status.exit_code() as u8))
}

fn into_command(command: Commands) -> Result<Command> {
    let converted = match command {
        Commands::Feature { description } => Command::Feature { description },
        Commands::Prd {
            feature,
            title,
            body,
            file,
        } => {
            let body = match file {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read PRD from {}", path.display()))?,
                None => body.unwrap_or_default(),
            };
            Command::Prd {
                feature,
                title,
                body,
            }
        }
        Commands::Tasks { feature, file } => {
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read tasks from {}", file.display()))?;
            let specs: Vec<TaskSpec> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse tasks in {}", file.display()))?;
            Command::Tasks { feature, specs }
        }
        Commands::Depend { task, on } => Command::Depend {
            task: task.into(),
            dependency: on.into(),
        },
        Commands::Plan { task, touch, notes } => Command::Plan {
            task: task.into(),
            impact_matrix: impact_matrix(&touch),
            notes,
        },
        Commands::Code { task, deadline } => Command::Code {
            task: task.into(),
            deadline: deadline.map(Duration::from_secs),
        },
        Commands::Validate { task } => Command::Verdict {
            task: task.into(),
            verdict: Verdict::Approved,
        },
        Commands::Reject { task, reason } => Command::Verdict {
            task: task.into(),
            verdict: Verdict::Rejected(reason),
        },
        Commands::Revise { task, keys } => Command::Revise {
            task: task.into(),
            touch_set: keys.into_iter().map(ResourceKey::from).collect(),
        },
        Commands::Cancel { feature } => Command::Cancel { feature },
        Commands::Archive { feature } => Command::Archive { feature },
        Commands::Snapshot { key, reason } => Command::Snapshot {
            key: key.into(),
            reason,
        },
        Commands::Revert { handle } => Command::Revert {
            handle: SnapshotHandle::from(handle.as_str()),
        },
        Commands::Resume => Command::Resume,
        Commands::Status { .. }
        | Commands::History { .. }
        | Commands::Snapshots { .. }
        | Commands::Batches => anyhow::bail!("not a state-changing command"),
    };
    Ok(converted)
}

/// `KEY` or `KEY=DESCRIPTION` pairs into an impact matrix.
fn impact_matrix(entries: &[String]) -> ImpactMatrix {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, description)) => (ResourceKey::new(key.trim()), description.trim().to_owned()),
            None => (ResourceKey::new(entry.trim()), "modify".to_owned()),
        })
        .collect()
}

fn write_outcome(out: &mut impl Write, outcome: &CommandOutcome) -> Result<()> {
    if outcome.status.is_success() {
        writeln!(out, "{}", outcome.message)?;
    } else {
        writeln!(
            out,
            "error ({}): {}",
            outcome.status.exit_code(),
            outcome.message
        )?;
    }
    Ok(())
}

fn write_status(
    out: &mut impl Write,
    orchestrator: &Orchestrator,
    only: Option<FeatureId>,
    include_archived: bool,
) -> Result<()> {
    let store = orchestrator.store();
    if let Some(reason) = orchestrator.halt_reason() {
        writeln!(out, "HALTED: {reason}")?;
    }

    for feature in store.features() {
        if only.is_some_and(|wanted| wanted != feature.id)
            || (feature.archived && !include_archived && only.is_none())
        {
            continue;
        }
        let archived = if feature.archived { " (archived)" } else { "" };
        writeln!(
            out,
            "{} [{}]{archived} {}",
            feature.id, feature.status, feature.description
        )?;
        for task in store.tasks_of(feature.id)? {
            write!(out, "  {} [{}] {}", task.id, task.status, task.description)?;
            if let Some(reason) = &task.blocked_reason {
                write!(out, " ({reason})")?;
            }
            if store.queue().contains_key(&task.id) {
                write!(out, " (queued)")?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

fn write_history(
    out: &mut impl Write,
    orchestrator: &Orchestrator,
    resource: Option<ResourceKey>,
) -> Result<()> {
    let history = orchestrator.history();
    let entries = match &resource {
        Some(key) => history.for_resource(key),
        None => history.entries().iter().collect(),
    };
    for entry in entries {
        let keys: Vec<&str> = entry.resource_keys.iter().map(ResourceKey::as_str).collect();
        writeln!(
            out,
            "#{} {} [{}] {} ({})",
            entry.sequence,
            entry.timestamp.to_rfc3339(),
            entry.change_type,
            entry.description,
            keys.join(", ")
        )?;
    }
    Ok(())
}

fn write_snapshots(
    out: &mut impl Write,
    orchestrator: &Orchestrator,
    resource: Option<ResourceKey>,
) -> Result<()> {
    let archive = orchestrator.archive();
    let snapshots = match &resource {
        Some(key) => archive.for_resource(key),
        None => archive.list(),
    };
    for snapshot in snapshots {
        writeln!(
            out,
            "{} {} ({}; revert: {})",
            snapshot.handle, snapshot.resource_key, snapshot.reason, snapshot.revert_procedure
        )?;
    }
    Ok(())
}
