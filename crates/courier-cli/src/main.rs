//! Courier CLI
//!
//! Inspects the scheduler's task store and configuration

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_config::Config;
use courier_storage::{Store, StoreOptions, Task, TaskFilter, TaskStatus};
use courier_telegram::{TelegramMessage, TelegramUpdate};
use logging::LogManager;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Persistent per-command task scheduler for Telegram bots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (defaults to core.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Task counts per command and status
    Stats,

    /// List recent tasks
    List {
        /// Only tasks of this command
        #[arg(short, long)]
        command: Option<String>,

        /// pending, running, complete or failed
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one task with its decoded update
    Show { id: i64 },

    /// Validate the config and print the effective settings
    CheckConfig,

    /// Show log files and their size
    Logs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone())?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level().to_string());
    let _logging_guard = logging::init_logging(&log_dir(&config), &log_level)?;

    match cli.command {
        Commands::Stats => {
            let store = open_store(&config)?;
            let counts = store.counts().await?;

            println!("Courier Task Store");
            println!("==================");
            println!("Database: {}", config.db_path().display());
            if counts.is_empty() {
                println!("\nNo tasks queued.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:>8} {:>8} {:>9} {:>8} {:>8}",
                "COMMAND", "PENDING", "RUNNING", "COMPLETE", "FAILED", "TOTAL"
            );
            for row in &counts {
                println!(
                    "{:<20} {:>8} {:>8} {:>9} {:>8} {:>8}",
                    row.command,
                    row.pending,
                    row.running,
                    row.complete,
                    row.failed,
                    row.total()
                );
            }
        }

        Commands::List {
            command,
            status,
            limit,
        } => {
            let store = open_store(&config)?;
            let tasks = store
                .list(&TaskFilter {
                    command,
                    status,
                    limit,
                })
                .await?;

            if tasks.is_empty() {
                println!("No matching tasks.");
                return Ok(());
            }
            println!(
                "{:>6}  {:<16} {:<9} {:>7}  {:<20}",
                "ID", "COMMAND", "STATUS", "RETRIES", "NEXT ATTEMPT"
            );
            for task in &tasks {
                println!(
                    "{:>6}  {:<16} {:<9} {:>7}  {:<20}",
                    task.id,
                    task.command,
                    task.status,
                    format!("{}/{}", task.retry_count, task.max_retries),
                    task.next_attempt.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Show { id } => {
            let store = open_store(&config)?;
            let task = store
                .get(id)
                .await?
                .with_context(|| format!("Task {} not found", id))?;
            print_task(&task);

            if let Some(over) = config.command(&task.command) {
                println!("\nConfig override for '{}':", task.command);
                println!("  {:?}", over);
            }
        }

        Commands::CheckConfig => {
            println!("Configuration OK");
            println!("  Data dir: {}", config.data_dir().display());
            println!("  Database: {}", config.db_path().display());
            println!("  Log level: {}", config.log_level());
            println!("  Poll interval: {} ms", config.scheduler.poll_interval_ms);
            println!(
                "  Busy retry: {} x {} ms",
                config.scheduler.busy_retries, config.scheduler.busy_backoff_ms
            );

            if config.commands.is_empty() {
                println!("  Command overrides: (none)");
            } else {
                println!("  Command overrides:");
                for (name, over) in &config.commands {
                    let mut fields = Vec::new();
                    if let Some(v) = over.max_retries {
                        fields.push(format!("max_retries={}", v));
                    }
                    if let Some(v) = over.retry_delay_ms {
                        fields.push(format!("retry_delay_ms={}", v));
                    }
                    if let Some(v) = over.timeout_secs {
                        fields.push(format!("timeout_secs={}", v));
                    }
                    if let Some(v) = over.period_ms {
                        fields.push(format!("period_ms={}", v));
                    }
                    if let Some(v) = over.requests {
                        fields.push(format!("requests={}", v));
                    }
                    if let Some(v) = over.concurrency {
                        fields.push(format!("concurrency={}", v));
                    }
                    if !over.soft_success.is_empty() {
                        fields.push(format!("soft_success={:?}", over.soft_success));
                    }
                    println!("    - {}: {}", name, fields.join(", "));
                }
            }
        }

        Commands::Logs => {
            let manager = LogManager::new(log_dir(&config));
            let files = manager.log_files()?;
            println!("Log directory: {}", log_dir(&config).display());
            println!("Current log: {}", manager.current_log_path().display());
            println!(
                "Files: {} ({})",
                files.len(),
                LogManager::format_size(manager.total_size()?)
            );
            for file in files {
                println!("  {}", file.display());
            }
        }
    }

    Ok(())
}

/// Explicit `--config` must exist; a missing default config means defaults.
fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(&path).with_context(|| format!("Failed to load config {}", path));
    }
    match Config::default_path() {
        Some(path) if path.exists() => Config::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        _ => Ok(Config::default()),
    }
}

fn log_dir(config: &Config) -> PathBuf {
    config.data_dir().join("logs")
}

fn open_store(config: &Config) -> Result<Store> {
    let db_path = config.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Opening task store {}", db_path.display());

    let options = StoreOptions {
        busy_retries: config.scheduler.busy_retries,
        busy_backoff: Duration::from_millis(config.scheduler.busy_backoff_ms),
        ..StoreOptions::default()
    };
    Store::open(&db_path, options)
        .with_context(|| format!("Failed to open task store {}", db_path.display()))
}

fn print_task(task: &Task) {
    println!("Task {}", task.id);
    println!("  Command: {}", task.command);
    println!("  Status: {}", task.status);
    println!("  Attempts: {}/{}", task.retry_count, task.max_retries);
    println!("  Retry delay: {:?}", task.retry_delay);
    println!("  Created: {}", task.created_at.to_rfc3339());
    println!("  Next attempt: {}", task.next_attempt.to_rfc3339());
    match task.last_attempt {
        Some(at) => println!("  Last attempt: {}", at.to_rfc3339()),
        None => println!("  Last attempt: never"),
    }

    match serde_json::from_slice::<TelegramUpdate>(&task.payload) {
        Ok(update) => {
            println!("\nUpdate {}:", update.update_id);
            if let Some(chat_id) = update.chat_id() {
                println!("  Chat: {}", chat_id);
            }
            if let Some(user) = update.from() {
                println!(
                    "  From: {} ({})",
                    user.username.as_deref().unwrap_or("-"),
                    user.id
                );
            }
            if let Some(command) = update.bot_command() {
                println!("  Command: /{} {}", command.name, command.args.join(" "));
            } else if let Some(text) = update.text() {
                println!("  Text: {}", text);
            }
            if let Some(media) = update.message().and_then(describe_media) {
                println!("  Media: {}", media);
            }
        }
        Err(e) => println!(
            "\nPayload: {} bytes, not a Telegram update ({})",
            task.payload.len(),
            e
        ),
    }
}

/// Media kind, with the file id and size of the largest photo rendition.
fn describe_media(message: &TelegramMessage) -> Option<String> {
    let kind = message.media_kind()?;
    Some(match message.largest_photo() {
        Some(photo) => format!(
            "{} {} ({}x{})",
            kind, photo.file_id, photo.width, photo.height
        ),
        None => kind.to_string(),
    })
}
