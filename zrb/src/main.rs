// zrb is a tool for encrypted, chunked, resumable ZFS backups to object storage.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use zrb_common::backup;
use zrb_common::cancel::CancelToken;
use zrb_common::config::{Config, Task};
use zrb_common::crypt;
use zrb_common::list;
use zrb_common::restore::{self, RestoreRequest, RestoreSource};
use zrb_common::store::{ObjectStore, S3Store};
use zrb_common::zfs::Zfs;
use zrb_common::ZrbError;

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

/// How long a cancelled run may keep shutting down gracefully
/// before the process is terminated.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The configuration file to use.
    #[arg(short, long, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,
    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    /// The local chunk staging area of a local-only backup.
    Local,
    /// The configured object storage remote.
    S3,
}

impl From<SourceArg> for RestoreSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::Local => Self::Local,
            SourceArg::S3 => Self::S3,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup of a task at the given level.
    Backup {
        /// The name of the task to back up.
        #[arg(short, long)]
        task: String,
        /// The backup level; 0 is a full backup.
        #[arg(short, long)]
        level: u32,
    },
    /// Restore a backup level of a task into a dataset.
    Restore {
        /// The name of the task to restore.
        #[arg(short, long)]
        task: String,
        /// The backup level to restore.
        #[arg(short, long)]
        level: u32,
        /// The pool/dataset to receive the stream into.
        #[arg(long)]
        target: String,
        /// The age identity file matching the backup recipient.
        #[arg(short, long)]
        identity: PathBuf,
        /// Where manifest and chunks are read from.
        #[arg(long, value_enum, default_value_t = SourceArg::S3)]
        source: SourceArg,
        /// Print what would be restored without changing anything.
        #[arg(long)]
        dry_run: bool,
        /// Pass the force flag to the receive.
        #[arg(short, long)]
        force: bool,
    },
    /// Summarize the backup chain of a task.
    List {
        /// The name of the task to list.
        #[arg(short, long)]
        task: String,
        /// Where the backup chain is read from.
        #[arg(long, value_enum, default_value_t = SourceArg::Local)]
        source: SourceArg,
    },
    /// Take a snapshot of a task's dataset for the given backup level.
    Snapshot {
        /// The name of the task to snapshot.
        #[arg(short, long)]
        task: String,
        /// The backup level the snapshot is taken for.
        #[arg(short, long)]
        level: u32,
    },
    /// Generate a fresh X25519 key pair.
    Genkey {
        /// Write the identity to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the configuration and probe remote access.
    Check,
}

fn main() {
    let cancel = CancelToken::new();

    match install_signal_handler(&cancel) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(EXIT_ERROR);
        }
    }

    match logic(&cancel) {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

/// Trips the token on SIGINT, SIGTERM or SIGHUP and escalates to process
/// termination if graceful shutdown stalls or a second signal arrives.
fn install_signal_handler(cancel: &CancelToken) -> Result<()> {
    let handler = cancel.clone();

    ctrlc::set_handler(move || {
        if handler.is_cancelled() {
            process::exit(EXIT_CANCELLED);
        }

        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, finishing up");
        handler.cancel();

        thread::spawn(|| {
            thread::sleep(SHUTDOWN_GRACE);
            process::exit(EXIT_CANCELLED);
        });
    })?;

    Ok(())
}

fn logic(cancel: &CancelToken) -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if let Commands::Genkey { output } = &cli.command {
        let (identity, recipient) = crypt::generate_keypair();

        match output {
            Some(path) => {
                crypt::write_identity_file(path, &identity, &recipient)?;
                println!("Identity written to {}", path.display());
            }
            None => println!("{}", identity),
        }

        println!("Public key: {}", recipient);
        println!("Set age_public_key to this value in the configuration.");
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    let zfs = Zfs::new();

    match cli.command {
        Commands::Backup { task, level } => {
            // Backups upload whenever a remote is configured.
            let store = match &config.s3 {
                Some(s3) => Some(S3Store::new(s3)?),
                None => None,
            };

            backup::run(
                &config,
                &task,
                level,
                &zfs,
                store.as_ref().map(|s| s as &dyn ObjectStore),
                cancel,
            )?;
        }
        Commands::Restore {
            task,
            level,
            target,
            identity,
            source,
            dry_run,
            force,
        } => {
            let store = remote_store(&config, source)?;

            restore::run(
                &config,
                &RestoreRequest {
                    task_name: &task,
                    level,
                    target: &target,
                    identity_path: &identity,
                    source: source.into(),
                    dry_run,
                    force,
                },
                &zfs,
                store.as_ref().map(|s| s as &dyn ObjectStore),
                cancel,
            )?;
        }
        Commands::List { task, source } => {
            let store = remote_store(&config, source)?;

            let listing = list::list_task(
                &config,
                &task,
                source.into(),
                store.as_ref().map(|s| s as &dyn ObjectStore),
                cancel,
            )?;

            println!("{}", listing.render());
        }
        Commands::Snapshot { task, level } => {
            let task = config.task(&task)?;
            let snapshot = zfs.create_snapshot(
                &task.pool,
                &task.dataset,
                &Task::snapshot_prefix(level),
                cancel,
            )?;

            println!("Created {}", snapshot);
        }
        Commands::Check => {
            println!("Configuration OK ({} tasks)", config.tasks.len());

            match &config.s3 {
                Some(s3) => {
                    S3Store::new(s3)?.verify_access()?;
                    println!("Remote access OK (bucket {})", s3.bucket);
                }
                None => println!("No remote configured, backups stay local"),
            }
        }
        Commands::Genkey { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

/// Connects to the remote when the requested source needs it.
fn remote_store(config: &Config, source: SourceArg) -> Result<Option<S3Store>> {
    match source {
        SourceArg::Local => Ok(None),
        SourceArg::S3 => {
            let s3 = config.s3.as_ref().ok_or(ZrbError::NoRemote)?;
            Ok(Some(S3Store::new(s3)?))
        }
    }
}
