//! Thin command-line front-end: parse arguments, merge them over the
//! instance configuration, and hand off to the library.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::error;

use pagebackup::backup::{do_backup, BackupOptions};
use pagebackup::catalog::{self, BackupId};
use pagebackup::config::InstanceConfig;
use pagebackup::validate;
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(name = "pagebackup", version = pagebackup::PROGRAM_VERSION)]
#[command(about = "Physical page-level backups for PostgreSQL clusters")]
struct Cli {
    /// Root of the backup catalog.
    #[arg(short = 'B', long, global = true)]
    backup_path: Option<Utf8PathBuf>,

    /// Instance name inside the catalog.
    #[arg(long, global = true)]
    instance: Option<String>,

    /// Instance configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[arg(long, global = true, default_value = "plain")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take a backup of the instance.
    Backup {
        /// FULL, PAGE, PTRACK or DELTA.
        #[arg(short = 'b', long = "backup-mode")]
        mode: String,

        /// Data directory of the cluster.
        #[arg(short = 'D', long)]
        pgdata: Option<Utf8PathBuf>,

        /// Receive WAL over a replication connection.
        #[arg(long)]
        stream: bool,

        /// Use a temporary replication slot for streaming.
        #[arg(long)]
        temp_slot: bool,

        /// Number of parallel file workers.
        #[arg(short = 'j', long)]
        threads: Option<usize>,

        /// Checkpoint smoothly instead of immediately.
        #[arg(long)]
        smooth_checkpoint: bool,

        /// Skip the validation pass after the backup finishes.
        #[arg(long)]
        no_validate: bool,
    },

    /// Validate one backup, or the whole instance.
    Validate {
        /// Backup id; all backups of the instance when omitted.
        backup_id: Option<String>,
    },

    /// Scan the live data files for corruption without taking a backup.
    Checkdb {
        /// Data directory of the cluster.
        #[arg(short = 'D', long)]
        pgdata: Option<Utf8PathBuf>,

        /// Number of parallel scan workers.
        #[arg(short = 'j', long)]
        threads: Option<usize>,
    },

    /// Delete a backup from the catalog.
    Delete {
        backup_id: String,
    },

    /// List the backups of the instance.
    Show,
}

fn load_config(cli: &Cli) -> anyhow::Result<InstanceConfig> {
    let mut config = match &cli.config {
        Some(path) => InstanceConfig::load(path)?,
        None => {
            let backup_path = cli
                .backup_path
                .clone()
                .context("required parameter not specified: backup path (-B)")?;
            let instance = cli
                .instance
                .clone()
                .context("required parameter not specified: --instance")?;
            InstanceConfig::new(backup_path, instance)
        }
    };
    if let Some(backup_path) = &cli.backup_path {
        config.backup_path = backup_path.clone();
    }
    if let Some(instance) = &cli.instance {
        config.instance_name = instance.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::from_config(&cli.log_format)?)?;
    pagebackup::install_signal_handlers()?;

    let mut config = load_config(&cli)?;

    match &cli.command {
        Command::Backup {
            mode,
            pgdata,
            stream,
            temp_slot,
            threads,
            smooth_checkpoint,
            no_validate,
        } => {
            if let Some(pgdata) = pgdata {
                config.pgdata = Some(pgdata.clone());
            }
            if *stream {
                config.stream = true;
            }
            if *temp_slot {
                config.temp_slot = true;
            }
            if let Some(threads) = threads {
                config.num_threads = (*threads).max(1);
            }
            let options = BackupOptions {
                mode: mode.parse()?,
                smooth_checkpoint: *smooth_checkpoint,
                no_validate: *no_validate,
            };
            do_backup(&config, options)?;
        }

        Command::Validate { backup_id } => match backup_id {
            Some(id) => {
                let id: BackupId = id.parse()?;
                let instance_path = config.backup_instance_path();
                let mut backup = catalog::read_backup(&instance_path, id)
                    .with_context(|| format!("backup {id} not found"))?;
                validate::validate_backup(&instance_path, &mut backup, config.num_threads)?;
                if !backup.status.is_complete() {
                    error!("backup {id} is not valid");
                    std::process::exit(1);
                }
            }
            None => {
                if !validate::validate_instance(&config)? {
                    std::process::exit(1);
                }
            }
        },

        Command::Checkdb { pgdata, threads } => {
            if let Some(pgdata) = pgdata {
                config.pgdata = Some(pgdata.clone());
            }
            if let Some(threads) = threads {
                config.num_threads = (*threads).max(1);
            }
            if !pagebackup::backup::do_checkdb(&config)? {
                std::process::exit(1);
            }
        }

        Command::Delete { backup_id } => {
            let id: BackupId = backup_id.parse()?;
            catalog::do_delete(&config.backup_instance_path(), id)?;
        }

        Command::Show => {
            let backups = catalog::get_backup_list(&config.backup_instance_path())?;
            println!(
                "{:<10} {:<7} {:<9} {:>4} {:>18} {:>18} {:<10}",
                "ID", "MODE", "STATUS", "TLI", "START-LSN", "STOP-LSN", "PARENT"
            );
            for backup in &backups {
                println!(
                    "{:<10} {:<7} {:<9} {:>4} {:>18} {:>18} {:<10}",
                    backup.id().to_string(),
                    backup.backup_mode.to_string(),
                    backup.status.to_string(),
                    backup.tli,
                    backup.start_lsn.to_string(),
                    backup.stop_lsn.to_string(),
                    backup
                        .parent_backup
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}
