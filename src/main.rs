//! Caravan - bulk synchronization between a local tree and an object store
//!
//! Four operations against a directory-rooted store:
//! - upload: stage + push every file, directory and link
//! - download: replicate the store back onto local disk
//! - verify-local / verify-remote: checksum equivalence in either direction

use anyhow::{Context, Result};
use caravan::logger::{Logger, NoopLogger, TextLogger};
use caravan::manager::{RunStatus, SyncOptions, TransferManager};
use caravan::store::DirStoreClient;
use clap::{Parser, Subcommand};
use indicatif::HumanBytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exit code for an interrupted run (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Caravan - bulk synchronization between a local tree and an object store"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Maximum concurrent store connections (0 = auto)
    #[arg(short = 'n', long, default_value_t = 0)]
    connections: usize,

    /// Dispatch attempts per object before it is dead-lettered
    #[arg(long, default_value_t = 5)]
    retry_limit: u32,

    /// Write timestamped log entries to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Disable the progress display
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local directory tree into the store
    Upload { local: PathBuf, store: PathBuf },
    /// Download the store contents into a local directory
    Download { local: PathBuf, store: PathBuf },
    /// Verify the local tree against the store (ordered report)
    VerifyLocal { local: PathBuf, store: PathBuf },
    /// Verify every stored file by content checksum (concurrent)
    VerifyRemote { store: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // A first Ctrl-C asks the pipeline to wind down; blocked waits observe
    // the flag within one poll interval.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupt received, winding down...");
            cancel.store(true, Ordering::Relaxed);
        })
        .context("Error setting Ctrl-C handler")?;
    }

    // Choose logger once; zero overhead in hot paths with NoopLogger
    let logger: Arc<dyn Logger> = if let Some(ref p) = args.log_file {
        match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(_) => Arc::new(NoopLogger),
        }
    } else {
        Arc::new(NoopLogger)
    };

    let connections = if args.connections > 0 {
        args.connections
    } else {
        num_cpus::get().max(2)
    };

    let options = SyncOptions {
        retry_limit: args.retry_limit.max(1),
        show_progress: !args.quiet,
    };

    let (local, store) = match &args.command {
        Command::Upload { local, store } | Command::VerifyLocal { local, store } => {
            let local = local
                .canonicalize()
                .with_context(|| format!("Local directory {} not accessible", local.display()))?;
            (Some(local), store.clone())
        }
        Command::Download { local, store } => {
            std::fs::create_dir_all(local)
                .with_context(|| format!("Failed to create {}", local.display()))?;
            let local = local.canonicalize()?;
            (Some(local), store.clone())
        }
        Command::VerifyRemote { store } => (None, store.clone()),
    };

    let client = Arc::new(DirStoreClient::open(&store, connections)?);
    let manager = TransferManager::new(client, local, logger, cancel, options);

    let code = match args.command {
        Command::Upload { .. } => run_upload(&manager)?,
        Command::Download { .. } => run_download(&manager)?,
        Command::VerifyLocal { .. } => {
            eprintln!("Caravan - Verify Local");
            eprintln!();
            let report = manager.verify_local()?;
            report_code(report.all_match(), report.len())
        }
        Command::VerifyRemote { .. } => {
            eprintln!("Caravan - Verify Remote");
            eprintln!();
            let report = manager.verify_remote()?;
            report_code(report.all_match(), report.len())
        }
    };

    manager.close();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run_upload(manager: &TransferManager) -> Result<i32> {
    eprintln!("Caravan - Upload");
    eprintln!();

    let summary = manager.upload_all()?;
    if summary.status == RunStatus::Interrupted {
        eprintln!(
            "Interrupted after {}/{} objects",
            summary.completed, summary.totals.objects
        );
        return Ok(EXIT_INTERRUPTED);
    }

    eprintln!(
        "Uploaded {} objects ({}) in {:.1}s",
        summary.completed,
        HumanBytes(summary.bytes_transferred),
        summary.elapsed.as_secs_f64()
    );
    Ok(0)
}

fn run_download(manager: &TransferManager) -> Result<i32> {
    eprintln!("Caravan - Download");
    eprintln!();

    let summary = manager.download_all()?;
    if summary.status == RunStatus::Interrupted {
        return Ok(EXIT_INTERRUPTED);
    }
    if !summary.verified {
        eprintln!("Some objects failed to download cleanly");
        return Ok(1);
    }
    Ok(0)
}

fn report_code(all_match: bool, entries: usize) -> i32 {
    if all_match {
        eprintln!("All {} entries verified", entries);
        0
    } else {
        eprintln!("Verification failed");
        1
    }
}
