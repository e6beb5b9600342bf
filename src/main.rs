//! Binary entrypoint for the Colombier CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the data directories
//! - `user add|list` - manage breeder accounts
//! - `export --owner <id>` - print or save an owner's snapshot
//! - `import --owner <id> --input <file>` - restore a snapshot file into an owner
//! - `backup save|list|restore|delete` - per-owner backup files
//! - `archive run|notifications|push-notifications|clean-logs|clean-codes|stats|logs|archived|restore`
//!
//! Results are printed to stdout as JSON. Lifecycle failures print an error
//! object (`code`, `message`) to stderr and exit with status 1.
use std::path::Path;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde_json::{json, Value};

use colombier::config::{Config, LoggingConfig};
use colombier::lifecycle::{Lifecycle, LifecycleError, RestoreOptions};
use colombier::metrics;
use colombier::model::{RecordId, Role, Snapshot, User};
use colombier::store::Store;

#[derive(Parser)]
#[command(name = "colombier")]
#[command(about = "Export, restore, backup and archival for a pigeon breeding register")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and create the data directories
    Init,
    /// Manage breeder accounts
    #[command(subcommand)]
    User(UserCommand),
    /// Export one owner's register as a JSON snapshot
    Export {
        #[arg(long)]
        owner: RecordId,
        /// Write the snapshot here instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Restore a snapshot file into an owner
    Import {
        #[arg(long)]
        owner: RecordId,
        #[arg(short, long)]
        input: String,
        #[command(flatten)]
        restore: RestoreFlags,
    },
    /// Per-owner backup files
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Notification archival and log cleanup
    #[command(subcommand)]
    Archive(ArchiveCommand),
}

#[derive(Subcommand)]
enum UserCommand {
    Add {
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    List,
}

#[derive(Args, Clone, Copy)]
struct RestoreFlags {
    /// Delete the owner's couples (with their eggs and pigeonneaux) first
    #[arg(long)]
    clear_existing: bool,
    /// Do not restore notifications
    #[arg(long)]
    skip_notifications: bool,
}

impl From<RestoreFlags> for RestoreOptions {
    fn from(flags: RestoreFlags) -> Self {
        RestoreOptions {
            clear_existing: flags.clear_existing,
            skip_notifications: flags.skip_notifications,
        }
    }
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Export the owner and store the snapshot as a new backup
    Save {
        #[arg(long)]
        owner: RecordId,
    },
    /// List backups, newest first
    List {
        #[arg(long, required_unless_present = "all")]
        owner: Option<RecordId>,
        /// Every owner's backups (administrators)
        #[arg(long, conflicts_with = "owner")]
        all: bool,
    },
    /// Restore one of the owner's backups into the owner
    Restore {
        #[arg(long)]
        owner: RecordId,
        filename: String,
        #[command(flatten)]
        restore: RestoreFlags,
    },
    Delete {
        #[arg(long)]
        owner: RecordId,
        filename: String,
    },
}

#[derive(Subcommand)]
enum ArchiveCommand {
    /// Run every archival step and record one execution log
    Run {
        /// Operator recorded on the execution log
        #[arg(long)]
        by: Option<String>,
    },
    Notifications,
    PushNotifications,
    CleanLogs,
    CleanCodes,
    Stats,
    /// Recent execution logs
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Archived notifications, most recent first
    Archived {
        #[arg(long)]
        owner: Option<RecordId>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Put archived notifications back by original id
    Restore {
        #[arg(required = true)]
        ids: Vec<RecordId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(None, cli.verbose);
            init(&cli.config).await
        }
        command => run(&cli.config, cli.verbose, command).await,
    }
}

async fn run(config_path: &str, verbose: u8, command: Commands) -> Result<()> {
    let config = load_config(config_path).await?;
    init_logging(Some(&config.logging), verbose);

    let store = Store::open(config.db_path())?;
    let lifecycle = Lifecycle::new(store.clone(), &config);

    let result = match command {
        Commands::Init => return init(config_path).await,
        Commands::User(command) => Ok(user_command(&store, command)?),
        Commands::Export { owner, output } => match lifecycle.export.export_snapshot(owner) {
            Ok(snapshot) => match output {
                Some(path) => {
                    tokio::fs::write(&path, serde_json::to_string_pretty(&snapshot)?).await?;
                    info!("Snapshot of owner #{} written to {}", owner, path);
                    Ok(json!({ "output": path, "statistics": snapshot.statistics }))
                }
                None => Ok(serde_json::to_value(&snapshot)?),
            },
            Err(e) => Err(e),
        },
        Commands::Import {
            owner,
            input,
            restore,
        } => {
            let content = tokio::fs::read_to_string(&input)
                .await
                .map_err(|e| anyhow!("Failed to read snapshot {}: {}", input, e))?;
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => lifecycle
                    .import
                    .restore_snapshot(owner, &snapshot, restore.into())
                    .map(|v| json!(v)),
                Err(e) => Err(LifecycleError::InvalidSnapshotFormat(e.to_string())),
            }
        }
        Commands::Backup(command) => backup_command(&lifecycle, command),
        Commands::Archive(command) => archive_command(&lifecycle, command),
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            warn!("{}", e);
            let response = e.to_response(config.debug);
            eprintln!("{}", serde_json::to_string_pretty(&response)?);
            std::process::exit(1);
        }
    }
}

fn user_command(store: &Store, command: UserCommand) -> Result<Value> {
    match command {
        UserCommand::Add {
            username,
            email,
            admin,
        } => {
            colombier::validation::validate_label("username", &username)?;
            let mut user = User::new(&username, if admin { Role::Admin } else { Role::User });
            user.email = email;
            let user = store.put_user(user)?;
            info!("Created user #{} ({})", user.id, user.username);
            Ok(json!(user))
        }
        UserCommand::List => Ok(json!(store.list_users()?)),
    }
}

fn backup_command(lifecycle: &Lifecycle, command: BackupCommand) -> std::result::Result<Value, LifecycleError> {
    match command {
        BackupCommand::Save { owner } => lifecycle.save_backup(owner).map(|v| json!(v)),
        BackupCommand::List { owner, all } => match (owner, all) {
            (_, true) => lifecycle.backups.list_all_backups().map(|v| json!(v)),
            (Some(owner), false) => lifecycle.backups.list_backups(owner).map(|v| json!(v)),
            (None, false) => Ok(json!([])),
        },
        BackupCommand::Restore {
            owner,
            filename,
            restore,
        } => lifecycle
            .restore_from_backup(owner, &filename, restore.into())
            .map(|v| json!(v)),
        BackupCommand::Delete { owner, filename } => lifecycle
            .backups
            .delete_backup(owner, &filename)
            .map(|()| json!({ "deleted": filename })),
    }
}

fn archive_command(lifecycle: &Lifecycle, command: ArchiveCommand) -> std::result::Result<Value, LifecycleError> {
    let archive = &lifecycle.archive;
    match command {
        ArchiveCommand::Run { by } => archive.run_full_archive(by.as_deref()).map(|v| json!(v)),
        ArchiveCommand::Notifications => archive.archive_old_notifications().map(|v| json!(v)),
        ArchiveCommand::PushNotifications => {
            archive.archive_old_push_notifications().map(|v| json!(v))
        }
        ArchiveCommand::CleanLogs => archive.clean_old_audit_logs().map(|v| json!(v)),
        ArchiveCommand::CleanCodes => archive.clean_expired_reset_codes().map(|v| json!(v)),
        ArchiveCommand::Stats => {
            let stats = archive.get_archive_stats()?;
            Ok(json!({ "archive": stats, "process": metrics::snapshot() }))
        }
        ArchiveCommand::Logs { limit } => archive.list_execution_logs(limit).map(|v| json!(v)),
        ArchiveCommand::Archived { owner, limit } => archive
            .list_archived_notifications(owner, limit)
            .map(|v| json!(v)),
        ArchiveCommand::Restore { ids } => archive
            .restore_archived_notifications(&ids)
            .map(|restored| json!({ "restored": restored })),
    }
}

async fn load_config(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        Config::load(path).await
    } else {
        warn!("Config file {} not found, using defaults (run `colombier init` to create one)", path);
        Ok(Config::default())
    }
}

async fn init(path: &str) -> Result<()> {
    info!("Initializing new Colombier configuration");
    if Path::new(path).exists() {
        return Err(anyhow!("Refusing to overwrite existing config file {}", path));
    }
    Config::create_default(path).await?;
    info!("Configuration file created at {}", path);

    let config = Config::default();
    tokio::fs::create_dir_all(&config.storage.data_dir).await?;
    tokio::fs::create_dir_all(&config.backup.root).await?;
    Store::open(config.db_path())?;
    info!(
        "Initialized register at {} and backups at {}",
        config.db_path().display(),
        config.backup.root
    );
    Ok(())
}

fn init_logging(config: Option<&LoggingConfig>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|cfg| cfg.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .and_then(|cfg| cfg.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    let security_path = config.and_then(|cfg| cfg.security_file.clone());

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stderr);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if record.target() == "security" {
                    if let Some(ref sec_path) = security_path {
                        if let Ok(mut sf) = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(sec_path)
                        {
                            let _ = writeln!(sf, "{}", line);
                        }
                    }
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
