use clap::{Parser, Subcommand};
use foreman_core::FeatureId;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Coordinate features and tasks across parallel workers", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, default_value = ".", help = "Project root directory")]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Create a feature")]
    Feature {
        #[arg(help = "What the feature should deliver")]
        description: String,
    },

    #[command(about = "Attach a PRD to a feature")]
    Prd {
        #[arg(help = "Feature id, e.g. F1")]
        feature: FeatureId,

        #[arg(long, help = "PRD title")]
        title: String,

        #[arg(long, conflicts_with = "file", help = "PRD body")]
        body: Option<String>,

        #[arg(long, help = "Read the PRD body from a file")]
        file: Option<PathBuf>,
    },

    #[command(about = "Create tasks under a feature from a JSON file")]
    Tasks {
        #[arg(help = "Feature id, e.g. F1")]
        feature: FeatureId,

        #[arg(help = "JSON array of task specs")]
        file: PathBuf,
    },

    #[command(about = "Make a task depend on another")]
    Depend {
        #[arg(help = "Dependent task")]
        task: String,

        #[arg(long, help = "Task it waits for")]
        on: String,
    },

    #[command(about = "Plan a task")]
    Plan {
        #[arg(help = "Task id")]
        task: String,

        #[arg(
            long = "touch",
            required = true,
            help = "Resource the plan changes, as KEY or KEY=DESCRIPTION (repeatable)"
        )]
        touch: Vec<String>,

        #[arg(long = "note", help = "Duplicate-risk note (repeatable)")]
        notes: Vec<String>,
    },

    #[command(about = "Schedule a planned task and run until idle")]
    Code {
        #[arg(help = "Task id")]
        task: String,

        #[arg(long, help = "Deadline in seconds, overriding the configured default")]
        deadline: Option<u64>,
    },

    #[command(about = "Approve an implemented task")]
    Validate {
        #[arg(help = "Task id")]
        task: String,
    },

    #[command(about = "Reject an implemented task")]
    Reject {
        #[arg(help = "Task id")]
        task: String,

        #[arg(help = "Why it was rejected")]
        reason: String,
    },

    #[command(about = "Replace a task's touch set")]
    Revise {
        #[arg(help = "Task id")]
        task: String,

        #[arg(required = true, help = "Resource keys")]
        keys: Vec<String>,
    },

    #[command(about = "Cancel a feature, blocking its unfinished tasks")]
    Cancel {
        #[arg(help = "Feature id")]
        feature: FeatureId,
    },

    #[command(about = "Archive a feature")]
    Archive {
        #[arg(help = "Feature id")]
        feature: FeatureId,
    },

    #[command(about = "Snapshot a resource into the legacy archive")]
    Snapshot {
        #[arg(help = "Resource key")]
        key: String,

        #[arg(long, default_value = "manual snapshot", help = "Why it is captured")]
        reason: String,
    },

    #[command(about = "Restore a legacy snapshot")]
    Revert {
        #[arg(help = "Snapshot handle")]
        handle: String,
    },

    #[command(about = "Resume dispatching after an integrity failure")]
    Resume,

    #[command(about = "List features and tasks")]
    Status {
        #[arg(help = "Only this feature")]
        feature: Option<FeatureId>,

        #[arg(long, help = "Include archived features")]
        all: bool,
    },

    #[command(about = "Show the changelog")]
    History {
        #[arg(long, help = "Only entries touching this resource")]
        resource: Option<String>,
    },

    #[command(about = "List legacy snapshots")]
    Snapshots {
        #[arg(long, help = "Only snapshots of this resource")]
        resource: Option<String>,
    },

    #[command(about = "Show layers of independent tasks")]
    Batches,
}
