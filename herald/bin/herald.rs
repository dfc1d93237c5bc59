//! Command-line entry point for herald
//!
//! - `herald run <RUNNER>` starts one queue runner
//! - `herald inject` hands a posting to a list
//! - `herald queue list` shows what is waiting in a queue

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{io::Read, path::PathBuf};

use clap::{Parser, Subcommand};
use herald::{Herald, RunnerKind, Slice, find_config_file};

/// A mailing list engine built from durable queues and queue runners
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version)]
struct Cli {
    /// Configuration file; found automatically when not given
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one queue runner
    Run {
        #[arg(value_enum)]
        runner: RunnerKind,

        /// The slice of the queue this runner owns
        #[arg(long, default_value_t = 0)]
        slice: u32,

        /// How many runners share the queue
        #[arg(long, default_value_t = 1)]
        slices: u32,

        /// Make a single pass over the queue and exit
        #[arg(long)]
        once: bool,
    },
    /// Queue a posting for a list
    Inject {
        /// The list to post to
        #[arg(long)]
        list: String,

        /// The message; read from stdin when not given
        file: Option<PathBuf>,
    },
    /// Queue inspection
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List the entries waiting in a queue
    List {
        /// in, out, bounces, archive, digest, hold or shunt
        queue: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let herald = Herald::load(&config_path)?;

    match cli.command {
        Commands::Run {
            runner,
            slice,
            slices,
            once,
        } => herald.run(runner, Slice { slice, slices }, once).await,
        Commands::Inject { list, file } => {
            let raw = match file {
                Some(file) => std::fs::read(&file)?,
                None => {
                    let mut raw = Vec::new();
                    std::io::stdin().read_to_end(&mut raw)?;
                    raw
                }
            };

            let token = herald.inject(&list, &raw).await?;
            println!("{token}");
            Ok(())
        }
        Commands::Queue {
            action: QueueAction::List { queue },
        } => {
            let tokens = herald.queued(&queue).await?;
            for token in &tokens {
                println!("{token}");
            }
            println!("{} entries in {queue}", tokens.len());
            Ok(())
        }
    }
}
