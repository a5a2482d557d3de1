mod commands;
mod logging;
mod version;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, CommandFactory, Parser, Subcommand};
use tasksync_core::app::{App, AppOptions};
use tasksync_core::config::{find_config_path, load_config_from, ConfigError};
use tasksync_core::coordinator::{is_background_child, BACKGROUND_LOG_ENV};
use tasksync_core::credentials::CredentialResolver;
use tasksync_core::error::AppError;
use tasksync_core::registry::Registry;
use tracing::debug;

#[derive(Parser)]
#[command(name = "tasksync", version = version::FULL, about = "Task lists across backends, with offline sync")]
struct Cli {
    /// Config file (defaults to TASKSYNC_CONFIG or ~/.config/tasksync/config.toml).
    #[arg(long, global = true, env = "TASKSYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Backend to use instead of the configured default.
    #[arg(long, short = 'b', global = true)]
    backend: Option<String>,
    /// More logging (-v info, -vv debug).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show task lists
    Lists {
        #[arg(long)]
        json: bool,
    },
    /// Show the tasks of a list
    Get {
        list: String,
        /// Only these statuses (repeatable)
        #[arg(long, short = 's')]
        status: Vec<String>,
        /// Hide these statuses (repeatable)
        #[arg(long, short = 'x')]
        exclude: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Add a task
    Add {
        list: String,
        summary: String,
        #[command(flatten)]
        fields: TaskFields,
    },
    /// Change a task
    Update {
        list: String,
        /// Task uid or summary
        task: String,
        #[arg(long)]
        summary: Option<String>,
        #[command(flatten)]
        fields: TaskFields,
    },
    /// Mark a task done (or another terminal status)
    Complete {
        list: String,
        task: String,
        #[arg(long, short = 's')]
        status: Option<String>,
    },
    /// Delete a task
    Delete { list: String, task: String },
    /// Manage lists
    #[command(subcommand)]
    List(ListCommand),
    /// Synchronise the cache with the remote
    Sync(SyncArgs),
    /// Show configured backends
    Backends {
        /// Run auto-detection for each backend
        #[arg(long)]
        detect: bool,
    },
    /// Manage keyring credentials
    #[command(subcommand)]
    Credentials(CredentialsCommand),
    /// Print version information
    Version,
    #[command(name = "_internal_background_sync", hide = true)]
    BackgroundSync,
}

#[derive(Args, Debug, Default)]
pub struct TaskFields {
    #[arg(long, short = 'd')]
    pub description: Option<String>,
    /// 0 (unset) to 9, 1 is highest
    #[arg(long, short = 'p', value_parser = clap::value_parser!(u8).range(0..=9))]
    pub priority: Option<u8>,
    #[arg(long, short = 's')]
    pub status: Option<String>,
    /// YYYY-MM-DD, or "none" to clear
    #[arg(long)]
    pub due: Option<String>,
    /// YYYY-MM-DD, or "none" to clear
    #[arg(long)]
    pub start: Option<String>,
    /// Comma separated
    #[arg(long)]
    pub tags: Option<String>,
    /// Parent task uid or summary, or "none" to clear
    #[arg(long)]
    pub parent: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ListCommand {
    Create {
        name: String,
        #[arg(long, short = 'd')]
        description: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    Rename { list: String, new_name: String },
    Delete { list: String },
    /// Show deleted lists
    Trash,
    Restore { list: String },
    /// Delete a trashed list for good
    Purge { list: String },
}

#[derive(Args, Debug, Default)]
#[command(args_conflicts_with_subcommands = true)]
pub struct SyncArgs {
    #[command(subcommand)]
    pub command: Option<SyncCommand>,
    #[arg(long, conflicts_with_all = ["pull_only", "full"])]
    pub push_only: bool,
    #[arg(long, conflicts_with = "full")]
    pub pull_only: bool,
    /// Only this list
    #[arg(long)]
    pub list: Option<String>,
    /// Ignore stored etags and refetch everything
    #[arg(long)]
    pub full: bool,
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Pending and failed operations, last sync per list
    Status,
}

#[derive(Subcommand, Debug)]
pub enum CredentialsCommand {
    /// Store a secret (read from stdin when --secret is omitted)
    Set {
        backend: String,
        #[arg(long, short = 'u')]
        username: String,
        #[arg(long)]
        secret: Option<String>,
    },
    /// Show a stored secret, redacted
    Get {
        backend: String,
        #[arg(long, short = 'u')]
        username: String,
    },
    Delete {
        backend: String,
        #[arg(long, short = 'u')]
        username: String,
    },
}

fn report(err: &AppError) {
    eprintln!("Error: {err}");
    if let Some(suggestion) = &err.suggestion {
        eprintln!("Suggestion: {suggestion}");
    }
}

fn load_registry(cli: &Cli) -> Result<Registry, AppError> {
    let path = find_config_path(cli.config.as_deref())
        .ok_or_else(|| AppError::from(ConfigError::NotFound("TASKSYNC_CONFIG or ~/.config/tasksync".to_string())))?;
    let config = load_config_from(&path)?;
    Ok(Registry::from_config(&config, &CredentialResolver::new())?)
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command.as_ref() else {
        let _ = Cli::command().print_help();
        println!();
        return Ok(());
    };

    match command {
        Command::Version => {
            println!("tasksync {}", version::FULL);
            return Ok(());
        }
        Command::Credentials(sub) => return commands::credentials(sub, &CredentialResolver::new()),
        Command::Backends { detect } => return commands::backends(&load_registry(&cli)?, *detect).await,
        Command::BackgroundSync => {
            tasksync_core::background::run_background_sync(cli.config.as_deref())
                .await
                .map_err(|err| AppError::new(tasksync_core::error::ErrorKind::Internal, format!("{err:#}")))?;
            return Ok(());
        }
        _ => {}
    }

    let app = App::open(&AppOptions {
        config_path: cli.config.clone(),
        backend: cli.backend.clone(),
    })
    .await?;
    debug!(backend = app.backend_name(), "backend selected");

    let result = match command {
        Command::Lists { json } => commands::lists(&app, *json).await,
        Command::Get {
            list,
            status,
            exclude,
            json,
        } => commands::get(&app, list, status, exclude, *json).await,
        Command::Add { list, summary, fields } => commands::add(&app, list, summary, fields).await,
        Command::Update {
            list,
            task,
            summary,
            fields,
        } => commands::update(&app, list, task, summary.as_deref(), fields).await,
        Command::Complete { list, task, status } => {
            commands::complete(&app, list, task, status.as_deref()).await
        }
        Command::Delete { list, task } => commands::delete(&app, list, task).await,
        Command::List(sub) => commands::list_command(&app, sub).await,
        Command::Sync(args) => commands::sync(&app, args).await,
        Command::Version | Command::Credentials(_) | Command::Backends { .. } | Command::BackgroundSync => Ok(()),
    };

    let shutdown = app.shutdown().await;
    if shutdown.abandoned > 0 {
        debug!(abandoned = shutdown.abandoned, "background sync cut short; changes stay queued");
    }
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if matches!(cli.command, Some(Command::BackgroundSync)) || is_background_child() {
        let log_to_file = std::env::var(BACKGROUND_LOG_ENV).map(|value| value == "1").unwrap_or(false);
        logging::init_background(log_to_file);
    } else {
        logging::init(cli.verbose);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start async runtime: {err}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
