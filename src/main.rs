use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::runtime::Runtime;

use keepsake_lib::{
    BackupInfo, Environment, RestoreOptions, StorageConfig, StorageEngine, StorageStatus,
};

#[derive(Debug, Parser)]
#[command(name = "keepsake", about = "Keepsake storage engine", version)]
struct Cli {
    /// Database environment to operate on.
    #[arg(long, global = true)]
    env: Option<Environment>,
    /// Directory holding the database files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Backup directory; defaults to `<data-dir>/backups`.
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    /// Also write logs to a daily rolling file in this directory.
    #[arg(long, global = true, env = "KEEPSAKE_LOG_DIR")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Show the active database, schema version, row counts and integrity.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Create a manual backup of the active database.
    Backup {
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List backups, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Replace the active database with a backup.
    Restore {
        filename: String,
        /// Allow a test backup to overwrite production data.
        #[arg(long)]
        skip_environment_check: bool,
        #[arg(long)]
        json: bool,
    },
    /// Delete a backup and its sidecar files.
    Delete { filename: String },
    /// Write the current expenses to a portable JSON file.
    ExportExpenses { path: PathBuf },
    /// Replace the current expenses with a JSON export of any known version.
    ImportExpenses { path: PathBuf },
    /// Take auto backups on schedule until interrupted.
    AutoBackup,
}

fn main() {
    let cli = Cli::parse();
    let log_guard = match &cli.log_dir {
        Some(dir) => match keepsake_lib::init_logging_with_file(dir) {
            Ok(guard) => Some(guard),
            Err(err) => {
                eprintln!("Error: {err:#}");
                process::exit(1);
            }
        },
        None => {
            keepsake_lib::init_logging();
            None
        }
    };

    let code = match handle_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    // Flush buffered file logs before exiting.
    drop(log_guard);
    process::exit(code);
}

fn build_config(cli: &Cli) -> StorageConfig {
    let mut config = StorageConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = Some(dir.clone());
    }
    if let Some(env) = cli.env {
        config.environment = Some(env);
    }
    config.auto_backup.enabled = matches!(cli.command, Commands::Db(DbCommand::AutoBackup));
    config
}

fn handle_cli(cli: Cli) -> Result<i32> {
    let config = build_config(&cli);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data directory {}", config.data_dir.display()))?;
    let runtime = Runtime::new().context("start async runtime")?;
    let engine = StorageEngine::new(config);

    let code = runtime.block_on(async {
        let code = match cli.command {
            Commands::Db(command) => handle_db_command(&engine, command).await,
        };
        engine.connections().close_now().await;
        code
    })?;
    Ok(code)
}

async fn handle_db_command(engine: &StorageEngine, command: DbCommand) -> Result<i32> {
    match command {
        DbCommand::Status { json } => {
            let status = engine.status().await.context("read storage status")?;
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
            Ok(if status.health.passed { 0 } else { 1 })
        }
        DbCommand::Backup { description, json } => {
            let result = engine
                .create_backup(description)
                .await
                .context("create backup")?;
            if json {
                print_json(&result)?;
            } else if let Some(backup) = &result.backup {
                println!("Backup stored at {}", backup.path.display());
            } else {
                eprintln!(
                    "Backup failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            Ok(if result.success { 0 } else { 1 })
        }
        DbCommand::List { json } => {
            let backups = engine.list_backups().await.context("list backups")?;
            if json {
                print_json(&backups)?;
            } else {
                print_backups(&backups);
            }
            Ok(0)
        }
        DbCommand::Restore {
            filename,
            skip_environment_check,
            json,
        } => {
            let options = RestoreOptions {
                skip_environment_check,
                ..RestoreOptions::default()
            };
            let result = engine
                .restore_from_backup(&filename, options)
                .await
                .context("restore backup")?;
            if json {
                print_json(&result)?;
            } else if result.success {
                println!(
                    "Restored {filename} (version {} -> {}).",
                    result.source_version.as_deref().unwrap_or("unknown"),
                    result.target_version
                );
                if let Some(safety) = &result.safety_backup {
                    println!("Pre-restore backup: {safety}");
                }
            } else {
                eprintln!(
                    "Restore refused: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                if result.requires_migration {
                    eprintln!("The backup needs a migration this build does not know.");
                }
            }
            Ok(if result.success { 0 } else { 1 })
        }
        DbCommand::Delete { filename } => {
            let result = engine.delete_backup(&filename).await.context("delete backup")?;
            if result.success {
                println!("Deleted {}", result.removed_files.join(", "));
                Ok(0)
            } else {
                eprintln!(
                    "Delete failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
                Ok(1)
            }
        }
        DbCommand::ExportExpenses { path } => {
            let export = engine
                .export_expenses_to_json(&path)
                .await
                .context("export expenses")?;
            println!(
                "Exported {} expenses to {}",
                export.expenses.len(),
                path.display()
            );
            Ok(0)
        }
        DbCommand::ImportExpenses { path } => {
            let report = engine
                .import_expenses_from_json(&path)
                .await
                .context("import expenses")?;
            if report.written {
                println!("Imported expenses from {}", path.display());
            } else {
                println!("Expenses already up to date.");
            }
            Ok(0)
        }
        DbCommand::AutoBackup => {
            let Some(scheduler) = engine.start_auto_backup() else {
                eprintln!("Auto backup is disabled.");
                return Ok(1);
            };
            let auto = &engine.config().auto_backup;
            println!(
                "Auto backup every {}h, keeping {}. Press Ctrl-C to stop.",
                auto.interval.as_secs() / 3600,
                auto.max_auto_backups
            );
            tokio::signal::ctrl_c()
                .await
                .context("wait for interrupt")?;
            scheduler.stop().await;
            Ok(0)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn print_status(status: &StorageStatus) {
    println!("Environment    : {}", status.environment);
    println!("Database       : {}", status.db_path.display());
    println!("Backups        : {}", status.backup_dir.display());
    println!(
        "Schema version : {}",
        status.schema_version.as_deref().unwrap_or("unknown")
    );
    println!(
        "Last saved     : {}",
        status.last_saved.as_deref().unwrap_or("never")
    );
    let integrity = if status.health.passed { "ok" } else { "failed" };
    println!("Integrity      : {integrity}");
    if let Some(details) = &status.health.details {
        println!("               {}", details.replace('\n', " "));
    }
    println!("\n{:<10} {:>8}", "Table", "Rows");
    println!("{:<10} {:>8}", "notes", status.notes);
    println!("{:<10} {:>8}", "expenses", status.expenses);
    println!("{:<10} {:>8}", "income", status.income);
}

fn print_backups(backups: &[BackupInfo]) {
    if backups.is_empty() {
        println!("No backups found.");
        return;
    }
    println!(
        "{:<48} {:<12} {:<11} {:<8} {:>12}",
        "File", "Kind", "Environment", "Version", "Size (bytes)"
    );
    for backup in backups {
        let kind = match backup.metadata.kind {
            keepsake_lib::BackupKind::Manual => "manual",
            keepsake_lib::BackupKind::Auto => "auto",
            keepsake_lib::BackupKind::PreRestore => "pre-restore",
        };
        println!(
            "{:<48} {:<12} {:<11} {:<8} {:>12}",
            backup.filename,
            kind,
            backup.metadata.environment.as_str(),
            backup.metadata.version,
            backup.size_bytes
        );
    }
}
