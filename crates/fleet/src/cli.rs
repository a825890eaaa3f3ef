//! Command-line arguments

use clap::{Parser, Subcommand};
use coordination::{TaskCommand, TaskSpec, TaskStatus};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fleet", version, about = "Orchestrate agent tasks across parallel workspaces")]
pub struct Cli {
    /// Config file (defaults to $FLEET_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control loop until interrupted
    Run {
        /// Seed file applied before the first tick
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Run one tick and wait for the workspaces it admitted
    Tick,
    /// Queue a new task
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Lower runs first
        #[arg(long, default_value_t = 10)]
        priority: i64,
    },
    /// Set a task's prompt; with no text or file the prompt is cleared
    Prompt {
        id: String,
        #[arg(conflicts_with = "file")]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Stop a task and tear down its workspace
    Pause { id: String },
    /// Make a paused task eligible again
    Resume { id: String },
    /// Send a task back to the queue for a fresh attempt
    Retry { id: String },
    /// Forget a task's last error without changing its status
    ClearError { id: String },
    /// Delete a task from the queue
    Remove { id: String },
    /// Ask the running loop to reconcile immediately
    Reconcile,
    /// Show the queue
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        json: bool,
    },
    /// Check running tasks for stuck or inconsistent state
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Queue every task in a seed file
    Seed { file: PathBuf },
    /// Print the effective configuration
    Config,
}

impl Command {
    /// Inbox commands for the mutating subcommands; `None` for the rest.
    pub fn task_commands(&self) -> anyhow::Result<Option<Vec<TaskCommand>>> {
        let commands = match self {
            Self::Add {
                id,
                name,
                prompt,
                prompt_file,
                priority,
            } => {
                let prompt = read_prompt(prompt.as_deref(), prompt_file.as_ref())?;
                let mut spec = TaskSpec::new(id.clone(), prompt, *priority);
                if let Some(name) = name {
                    spec = spec.with_name(name.clone());
                }
                spec.validate()?;
                vec![TaskCommand::Enqueue { spec }]
            }
            Self::Prompt { id, text, file } => vec![TaskCommand::SetPrompt {
                id: id.clone(),
                prompt: read_prompt(text.as_deref(), file.as_ref())?,
            }],
            Self::Pause { id } => vec![TaskCommand::Pause { id: id.clone() }],
            Self::Resume { id } => vec![TaskCommand::Resume { id: id.clone() }],
            Self::Retry { id } => vec![TaskCommand::Reset { id: id.clone() }],
            Self::ClearError { id } => vec![TaskCommand::ClearError { id: id.clone() }],
            Self::Remove { id } => vec![TaskCommand::Remove { id: id.clone() }],
            Self::Reconcile => vec![TaskCommand::Reconcile],
            Self::Seed { file } => coordination::SeedFile::load(file)?
                .tasks
                .into_iter()
                .map(|spec| TaskCommand::Enqueue { spec })
                .collect(),
            _ => return Ok(None),
        };
        Ok(Some(commands))
    }
}

fn read_prompt(text: Option<&str>, file: Option<&PathBuf>) -> anyhow::Result<String> {
    match (text, file) {
        (Some(text), _) => Ok(text.to_string()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read prompt file {}: {e}", path.display())),
        (None, None) => Ok(String::new()),
    }
}
