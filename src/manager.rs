//! Transfer orchestration
//!
//! `TransferManager` owns one store client and drives the four operations:
//! bulk upload, bulk download, and the two verification passes. Pools are
//! shut down by joining their handles; the upload run additionally checks
//! the settled counts against the advertised totals and fails loudly when
//! they disagree.

use crate::checksum;
use crate::client::{RemoteEntry, TransferClient};
use crate::engine::{self, EngineError, UploadContext, UploadCounters};
use crate::logger::Logger;
use crate::progress::{self, ProgressTracker};
use crate::queue::BoundedQueue;
use crate::transfer::TransferTotals;
use crate::verify::{report_row, ReportCollector, VerificationResult, VerifiedEntry, VerifyReport};
use crate::{loader, walk};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use indicatif::HumanBytes;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Interval at which blocked pool channels recheck cancellation
const CHANNEL_WAIT: Duration = Duration::from_millis(200);
const RECV_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Maximum dispatch attempts per unit before dead-lettering
    pub retry_limit: u32,
    pub show_progress: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Interrupted,
}

#[derive(Debug)]
pub struct UploadSummary {
    pub status: RunStatus,
    pub totals: TransferTotals,
    pub completed: u64,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct DownloadSummary {
    pub status: RunStatus,
    /// Remote entries seen; known only once the lazy listing is exhausted
    pub listed: u64,
    pub processed: u64,
    /// All dispatched fetches verified clean
    pub verified: bool,
}

pub struct TransferManager {
    client: Arc<dyn TransferClient>,
    local_root: Option<PathBuf>,
    logger: Arc<dyn Logger>,
    cancel: Arc<AtomicBool>,
    options: SyncOptions,
}

impl TransferManager {
    pub fn new(
        client: Arc<dyn TransferClient>,
        local_root: Option<PathBuf>,
        logger: Arc<dyn Logger>,
        cancel: Arc<AtomicBool>,
        options: SyncOptions,
    ) -> Self {
        Self {
            client,
            local_root,
            logger,
            cancel,
            options,
        }
    }

    fn local_root(&self) -> Result<&Path> {
        self.local_root
            .as_deref()
            .ok_or_else(|| anyhow!("operation requires a local working directory"))
    }

    fn status(&self) -> RunStatus {
        if self.cancel.load(Ordering::Relaxed) {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        }
    }

    /// Upload the whole local tree to the store.
    ///
    /// Every discovered object is pushed (the store overwrites
    /// idempotently) and must settle: a count mismatch after both pools
    /// drain is an error, never a hang.
    pub fn upload_all(&self) -> Result<UploadSummary> {
        let root = self.local_root()?;
        let start = Instant::now();

        let totals = walk::scan_totals(root, &*self.logger);
        if totals.objects == 0 {
            return Ok(UploadSummary {
                status: self.status(),
                totals,
                completed: 0,
                bytes_transferred: 0,
                elapsed: start.elapsed(),
            });
        }

        eprintln!(
            "Bulk upload: [{}] --> [{}]",
            root.display(),
            self.client.remote_root()
        );
        eprintln!("Total objects to upload: {}", totals.objects);
        eprintln!(
            "Total size to upload   : {} ({})",
            HumanBytes(totals.bytes),
            totals.bytes
        );

        let workers = engine::worker_count(&*self.client);
        let staging = tempfile::tempdir().context("Failed to create staging directory")?;

        let ctx = Arc::new(UploadContext {
            client: self.client.clone(),
            local_root: root.to_path_buf(),
            queue: BoundedQueue::with_capacity(2 * workers),
            counters: UploadCounters::default(),
            totals,
            progress: ProgressTracker::new(),
            logger: self.logger.clone(),
            cancel: self.cancel.clone(),
            retry_limit: self.options.retry_limit.max(1),
        });

        let loader = loader::spawn(ctx.clone(), staging.path().to_path_buf(), num_cpus::get())?;
        let handles = engine::spawn_workers(&ctx, workers)?;

        // The display attaches after the workers are already running; bytes
        // completed in the gap are caught up by the tracker.
        if self.options.show_progress {
            ctx.progress.attach(progress::byte_bar(totals.bytes));
        }

        loader
            .join()
            .map_err(|_| anyhow!("queue loader panicked"))?;
        for handle in handles {
            handle.join().map_err(|_| anyhow!("upload worker panicked"))?;
        }
        ctx.progress.finish();

        let status = self.status();
        let completed = ctx.counters.completed();
        let bytes_transferred = ctx.progress.total_bytes();
        self.logger
            .done(completed, bytes_transferred, start.elapsed().as_secs_f64());

        if status == RunStatus::Completed && completed != totals.objects {
            return Err(EngineError::CompletionMismatch {
                expected: totals.objects,
                actual: completed,
            }
            .into());
        }

        Ok(UploadSummary {
            status,
            totals,
            completed,
            bytes_transferred,
            elapsed: start.elapsed(),
        })
    }

    /// Download everything the store lists into the local tree.
    pub fn download_all(&self) -> Result<DownloadSummary> {
        let root = self.local_root()?.to_path_buf();

        let workers = engine::worker_count(&*self.client);
        let (tx, rx) = bounded::<DownloadJob>(2 * workers);
        let processed = Arc::new(AtomicU64::new(0));
        let verified = Arc::new(AtomicBool::new(true));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let client = self.client.clone();
            let logger = self.logger.clone();
            let cancel = self.cancel.clone();
            let processed = processed.clone();
            let verified = verified.clone();
            let handle = thread::Builder::new()
                .name(format!("downloader-{i}"))
                .spawn(move || loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(RECV_WAIT) {
                        Ok(job) => {
                            if !fetch_object(&*client, &*logger, &job) {
                                verified.store(false, Ordering::Relaxed);
                            }
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .context("Failed to spawn download worker")?;
            handles.push(handle);
        }
        drop(rx);

        let mut listed = 0u64;
        for entry in self.client.list()? {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            listed += 1;

            let local = self.client.to_local_path(&entry.path, &root);
            if entry.is_directory {
                if let Err(e) = reconcile_directory(&local, &entry) {
                    self.logger.error("download", &local, &e.to_string());
                    verified.store(false, Ordering::Relaxed);
                }
                processed.fetch_add(1, Ordering::Relaxed);
            } else {
                if !local.exists() {
                    if let Some(parent) = local.parent() {
                        fs::create_dir_all(parent).ok();
                    }
                }
                let job = DownloadJob {
                    remote: entry.path,
                    local,
                };
                if !send_job(&tx, job, &self.cancel) {
                    break;
                }
            }
        }

        // End of listing: disconnect so the pool drains and exits.
        drop(tx);
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow!("download worker panicked"))?;
        }

        let processed = processed.load(Ordering::Relaxed);
        eprintln!("Downloaded {}/{} objects", processed, listed);

        Ok(DownloadSummary {
            status: self.status(),
            listed,
            processed,
            verified: verified.load(Ordering::Relaxed),
        })
    }

    /// Single-threaded local-against-store verification pass.
    ///
    /// Ordering is deterministic so successive reports line up.
    pub fn verify_local(&self) -> Result<VerifyReport> {
        let root = self.local_root()?;
        let mut report = VerifyReport::default();

        for entry in walk::entries_sorted(root, &*self.logger) {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }

            let remote = self.client.to_remote_path(&entry.path, root)?;
            let result = match entry.kind {
                walk::EntryKind::Directory => self.client.verify_directory(&remote),
                walk::EntryKind::SymbolicLink => match fs::read_link(&entry.path) {
                    Ok(target) => self.client.verify_link(&remote, &target),
                    Err(_) => VerificationResult::MissingLocal,
                },
                walk::EntryKind::File => match checksum::file_checksum(&entry.path) {
                    Ok(digest) => self.client.verify_file(&remote, entry.size, &digest),
                    Err(_) => VerificationResult::MissingLocal,
                },
            };

            println!(
                "{}",
                report_row(result, &format!("{} <-> {}", entry.path.display(), remote))
            );
            report.entries.push(VerifiedEntry {
                path: remote,
                result,
            });
        }

        Ok(report)
    }

    /// Concurrent store-side verification: fetch every listed file into a
    /// discard sink so content checksums are exercised end to end.
    pub fn verify_remote(&self) -> Result<VerifyReport> {
        let workers = engine::worker_count(&*self.client);
        let (tx, rx) = bounded::<RemoteEntry>(2 * workers);
        let collector = Arc::new(ReportCollector::default());

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let client = self.client.clone();
            let logger = self.logger.clone();
            let cancel = self.cancel.clone();
            let collector = collector.clone();
            let handle = thread::Builder::new()
                .name(format!("verifier-{i}"))
                .spawn(move || loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(RECV_WAIT) {
                        Ok(entry) => {
                            let result =
                                match client.download(&entry.path, &mut io::sink()) {
                                    Ok(result) => result,
                                    Err(e) => {
                                        logger.error(
                                            "verify",
                                            Path::new(&entry.path),
                                            &e.to_string(),
                                        );
                                        VerificationResult::MissingRemote
                                    }
                                };
                            println!("{}", report_row(result, &entry.path));
                            collector.record(entry.path, result);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .context("Failed to spawn verifier")?;
            handles.push(handle);
        }
        drop(rx);

        let mut listed = 0u64;
        for entry in self.client.list()? {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if entry.is_directory {
                continue;
            }
            listed += 1;
            if !send_job(&tx, entry, &self.cancel) {
                break;
            }
        }

        drop(tx);
        for handle in handles {
            handle.join().map_err(|_| anyhow!("verifier panicked"))?;
        }

        let report = Arc::try_unwrap(collector)
            .map(ReportCollector::into_report)
            .unwrap_or_else(|arc| arc.snapshot());
        eprintln!("{}/{} files verified", report.len(), listed);

        Ok(report)
    }

    pub fn close(&self) {
        self.client.close();
    }
}

struct DownloadJob {
    remote: String,
    local: PathBuf,
}

/// Blocking bounded send that stays responsive to cancellation
fn send_job<T>(tx: &Sender<T>, job: T, cancel: &AtomicBool) -> bool {
    let mut job = job;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        match tx.send_timeout(job, CHANNEL_WAIT) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => job = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Metadata reconciliation for listed directories: create when absent,
/// otherwise align the modification time with the store.
fn reconcile_directory(local: &Path, entry: &RemoteEntry) -> Result<()> {
    match fs::metadata(local) {
        Ok(meta) => {
            let local_mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            if local_mtime != entry.modified {
                filetime::set_file_mtime(
                    local,
                    filetime::FileTime::from_system_time(entry.modified),
                )?;
            }
            Ok(())
        }
        Err(_) => Ok(fs::create_dir_all(local)?),
    }
}

/// Fetch one object to disk; returns false when verification failed.
fn fetch_object(client: &dyn TransferClient, logger: &dyn Logger, job: &DownloadJob) -> bool {
    let result = (|| -> Result<VerificationResult> {
        let file = fs::File::create(&job.local)
            .with_context(|| format!("Failed to create {}", job.local.display()))?;
        let mut writer = BufWriter::new(file);
        let result = client.download(&job.remote, &mut writer)?;
        writer.flush()?;
        Ok(result)
    })();

    match result {
        Ok(result) if result.is_ok() => {
            logger.downloaded(&job.remote, &job.local);
            true
        }
        Ok(result) => {
            logger.error("download", &job.local, &result.to_string());
            false
        }
        Err(e) => {
            logger.error("download", &job.local, &e.to_string());
            false
        }
    }
}
