//! Upload worker pool (consumer side)
//!
//! A fixed set of workers pulls units off the bounded queue and dispatches
//! them against the store. Completion is count-based: there is no
//! end-of-stream marker (several producers feed the queue concurrently, and
//! workers re-enqueue failures), so workers run until every advertised
//! object is settled one way or another.

use crate::client::TransferClient;
use crate::logger::Logger;
use crate::progress::ProgressTracker;
use crate::queue::BoundedQueue;
use crate::transfer::{ObjectUpload, TransferTotals, UploadKind};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Queue poll interval; keeps workers responsive to the termination check
const POLL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    /// Raised only after both pools have drained; distinguishes silently
    /// lost work from transient per-unit failures.
    #[error("completed {actual} of {expected} expected object uploads")]
    CompletionMismatch { expected: u64, actual: u64 },
}

/// Cross-worker settlement accounting.
///
/// `completed` is monotonic and incremented exactly once per successful
/// transfer. Dead-lettered and lost units still settle, so the pool can
/// terminate and report a mismatch instead of hanging.
#[derive(Default)]
pub struct UploadCounters {
    completed: AtomicU64,
    dead_lettered: AtomicU64,
    lost: AtomicU64,
}

impl UploadCounters {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Units that will never come through the queue again
    pub fn settled(&self) -> u64 {
        self.completed() + self.dead_lettered() + self.lost()
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the loader and the upload workers for one run
pub struct UploadContext {
    pub client: Arc<dyn TransferClient>,
    pub local_root: PathBuf,
    pub queue: BoundedQueue<ObjectUpload>,
    pub counters: UploadCounters,
    pub totals: TransferTotals,
    pub progress: ProgressTracker,
    pub logger: Arc<dyn Logger>,
    pub cancel: Arc<AtomicBool>,
    /// Maximum dispatch attempts per unit before it is dead-lettered
    pub retry_limit: u32,
}

/// Pool sizing rule: leave headroom for control and listing connections.
pub fn worker_count(client: &dyn TransferClient) -> usize {
    client.max_concurrent_connections().saturating_sub(2).max(1)
}

pub fn spawn_workers(ctx: &Arc<UploadContext>, count: usize) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let ctx = ctx.clone();
        let handle = thread::Builder::new()
            .name(format!("uploader-{i}"))
            .spawn(move || worker_loop(&ctx))
            .context("Failed to spawn upload worker")?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Select the remote operation by unit variant and perform it.
///
/// Returns the remote path for logging; all I/O is the client's.
fn dispatch(ctx: &UploadContext, unit: &ObjectUpload) -> Result<String> {
    let remote = ctx
        .client
        .to_remote_path(&unit.source, &ctx.local_root)?;

    match unit.kind {
        UploadKind::Directory => ctx.client.mkdirp(&remote)?,
        UploadKind::SymbolicLink { ref target } => ctx.client.put_link(&remote, target)?,
        UploadKind::File {
            ref staging,
            uncompressed_size,
        } => ctx.client.put_file(&remote, staging, uncompressed_size)?,
    }

    Ok(remote)
}

fn worker_loop(ctx: &UploadContext) {
    while ctx.counters.settled() < ctx.totals.objects {
        if ctx.cancel.load(Ordering::Relaxed) {
            break;
        }

        let Some(mut unit) = ctx.queue.poll(POLL_WAIT) else {
            continue;
        };

        unit.attempts += 1;
        match dispatch(ctx, &unit) {
            Ok(remote) => {
                if let Err(e) = unit.discard_staging() {
                    ctx.logger.error("cleanup", &unit.source, &e.to_string());
                }
                let bytes = unit.payload_bytes();
                if bytes > 0 {
                    ctx.progress.add(bytes);
                }
                ctx.counters.mark_completed();
                ctx.logger.uploaded(&unit.source, &remote, bytes);
            }
            Err(e) => {
                if unit.attempts >= ctx.retry_limit {
                    ctx.logger.error("upload", &unit.source, &e.to_string());
                    ctx.logger.dead_letter(&unit.source, unit.attempts);
                    let _ = unit.discard_staging();
                    ctx.counters.mark_dead_lettered();
                } else {
                    ctx.logger.retry(&unit.source, unit.attempts, &e.to_string());
                    if let Err(unit) = ctx.queue.put(unit, &ctx.cancel) {
                        let _ = unit.discard_staging();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::client::RemoteEntry;
    use crate::logger::NoopLogger;
    use crate::verify::VerificationResult;
    use crate::walk;
    use flate2::read::GzDecoder;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};
    use std::io::{Read, Write};
    use std::path::Path;
    use std::time::SystemTime;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockObject {
        File(Vec<u8>),
        Directory,
        Link(PathBuf),
    }

    /// In-memory store with per-path failure injection
    #[derive(Default)]
    pub struct MockClient {
        pub objects: Mutex<BTreeMap<String, MockObject>>,
        /// Remaining induced put failures per remote path
        pub fail_counts: Mutex<HashMap<String, u32>>,
        pub connections: usize,
    }

    impl MockClient {
        pub fn with_connections(connections: usize) -> Self {
            Self {
                connections,
                ..Self::default()
            }
        }

        pub fn fail_next_puts(&self, remote: &str, count: u32) {
            self.fail_counts.lock().insert(remote.to_string(), count);
        }

        pub fn object(&self, remote: &str) -> Option<MockObject> {
            self.objects.lock().get(remote).cloned()
        }

        fn maybe_fail(&self, remote: &str) -> Result<()> {
            let mut counts = self.fail_counts.lock();
            if let Some(remaining) = counts.get_mut(remote) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("induced failure for {remote}");
                }
            }
            Ok(())
        }
    }

    impl TransferClient for MockClient {
        fn max_concurrent_connections(&self) -> usize {
            self.connections.max(1)
        }

        fn remote_root(&self) -> String {
            "mock://store".into()
        }

        fn to_remote_path(&self, local: &Path, local_root: &Path) -> Result<String> {
            let rel = local.strip_prefix(local_root)?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Ok(parts.join("/"))
        }

        fn to_local_path(&self, remote: &str, local_root: &Path) -> PathBuf {
            let mut path = local_root.to_path_buf();
            for part in remote.split('/').filter(|p| !p.is_empty()) {
                path.push(part);
            }
            path
        }

        fn mkdirp(&self, remote: &str) -> Result<()> {
            self.maybe_fail(remote)?;
            self.objects
                .lock()
                .insert(remote.to_string(), MockObject::Directory);
            Ok(())
        }

        fn put_file(&self, remote: &str, staging: &Path, _size: u64) -> Result<()> {
            self.maybe_fail(remote)?;
            let mut content = Vec::new();
            GzDecoder::new(std::fs::File::open(staging)?).read_to_end(&mut content)?;
            self.objects
                .lock()
                .insert(remote.to_string(), MockObject::File(content));
            Ok(())
        }

        fn put_link(&self, remote: &str, target: &Path) -> Result<()> {
            self.maybe_fail(remote)?;
            self.objects
                .lock()
                .insert(remote.to_string(), MockObject::Link(target.to_path_buf()));
            Ok(())
        }

        fn list(&self) -> Result<Box<dyn Iterator<Item = RemoteEntry> + Send>> {
            let entries: Vec<RemoteEntry> = self
                .objects
                .lock()
                .iter()
                .map(|(path, obj)| RemoteEntry {
                    path: path.clone(),
                    is_directory: matches!(obj, MockObject::Directory),
                    modified: SystemTime::UNIX_EPOCH,
                })
                .collect();
            Ok(Box::new(entries.into_iter()))
        }

        fn download(&self, remote: &str, sink: &mut dyn Write) -> Result<VerificationResult> {
            match self.object(remote) {
                Some(MockObject::File(content)) => {
                    sink.write_all(&content)?;
                    Ok(VerificationResult::Ok)
                }
                Some(_) => Ok(VerificationResult::NotFile),
                None => Ok(VerificationResult::MissingRemote),
            }
        }

        fn verify_file(
            &self,
            remote: &str,
            size: u64,
            digest: &crate::checksum::Digest,
        ) -> VerificationResult {
            match self.object(remote) {
                Some(MockObject::File(content)) => {
                    if content.len() as u64 != size {
                        VerificationResult::SizeMismatch
                    } else if blake3::hash(&content).as_bytes() != digest {
                        VerificationResult::ChecksumMismatch
                    } else {
                        VerificationResult::Ok
                    }
                }
                Some(_) => VerificationResult::NotFile,
                None => VerificationResult::MissingRemote,
            }
        }

        fn verify_directory(&self, remote: &str) -> VerificationResult {
            match self.object(remote) {
                Some(MockObject::Directory) => VerificationResult::Ok,
                Some(_) => VerificationResult::NotDirectory,
                None => VerificationResult::MissingRemote,
            }
        }

        fn verify_link(&self, remote: &str, target: &Path) -> VerificationResult {
            match self.object(remote) {
                Some(MockObject::Link(stored)) if stored.as_path() == target => {
                    VerificationResult::Ok
                }
                Some(MockObject::Link(_)) => VerificationResult::LinkMismatch,
                Some(_) => VerificationResult::NotFile,
                None => VerificationResult::MissingRemote,
            }
        }

        fn close(&self) {}
    }

    pub fn context(
        client: Arc<dyn TransferClient>,
        root: &Path,
        totals: TransferTotals,
        retry_limit: u32,
    ) -> Arc<UploadContext> {
        let workers = worker_count(&*client);
        Arc::new(UploadContext {
            client,
            local_root: root.to_path_buf(),
            queue: BoundedQueue::with_capacity(2 * workers),
            counters: UploadCounters::default(),
            totals,
            progress: ProgressTracker::new(),
            logger: Arc::new(NoopLogger),
            cancel: Arc::new(AtomicBool::new(false)),
            retry_limit,
        })
    }

    /// Context over a fresh mock client, totals scanned from `root`
    pub fn context_for(root: &Path, connections: usize) -> Arc<UploadContext> {
        let totals = walk::scan_totals(root, &NoopLogger);
        context(
            Arc::new(MockClient::with_connections(connections)),
            root,
            totals,
            5,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{context, MockClient, MockObject};
    use super::*;
    use crate::staging;
    use std::fs;

    fn join_all(handles: Vec<JoinHandle<()>>) {
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn workers_settle_every_unit_exactly_once() {
        let tree = tempfile::tempdir().unwrap();
        fs::write(tree.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(tree.path().join("dir")).unwrap();

        let staging_dir = tempfile::tempdir().unwrap();
        let staged = staging::stage_file(&tree.path().join("a.txt"), staging_dir.path()).unwrap();

        let mock = Arc::new(MockClient::with_connections(4));
        let ctx = context(
            mock.clone(),
            tree.path(),
            TransferTotals {
                objects: 2,
                bytes: 10,
            },
            5,
        );

        let never = AtomicBool::new(false);
        ctx.queue
            .put(
                ObjectUpload::file(tree.path().join("a.txt"), staged.path.clone(), 10),
                &never,
            )
            .unwrap();
        ctx.queue
            .put(ObjectUpload::directory(tree.path().join("dir")), &never)
            .unwrap();

        let handles = spawn_workers(&ctx, worker_count(&*ctx.client)).unwrap();
        join_all(handles);

        assert_eq!(ctx.counters.completed(), 2);
        assert_eq!(ctx.counters.settled(), 2);
        assert_eq!(mock.object("a.txt"), Some(MockObject::File(b"0123456789".to_vec())));
        assert_eq!(mock.object("dir"), Some(MockObject::Directory));
        // Staging artifact deleted on confirmed upload.
        assert!(!staged.path.exists());
        assert_eq!(ctx.progress.total_bytes(), 10);
    }

    #[test]
    fn failed_unit_is_requeued_and_counted_once() {
        let tree = tempfile::tempdir().unwrap();
        fs::write(tree.path().join("a.txt"), b"retry me").unwrap();

        let staging_dir = tempfile::tempdir().unwrap();
        let staged = staging::stage_file(&tree.path().join("a.txt"), staging_dir.path()).unwrap();

        let mock = Arc::new(MockClient::with_connections(4));
        mock.fail_next_puts("a.txt", 2);
        let ctx = context(
            mock.clone(),
            tree.path(),
            TransferTotals {
                objects: 1,
                bytes: 8,
            },
            5,
        );

        let never = AtomicBool::new(false);
        ctx.queue
            .put(
                ObjectUpload::file(tree.path().join("a.txt"), staged.path.clone(), 8),
                &never,
            )
            .unwrap();

        let handles = spawn_workers(&ctx, 2).unwrap();
        join_all(handles);

        assert_eq!(ctx.counters.completed(), 1);
        assert_eq!(ctx.counters.dead_lettered(), 0);
        assert_eq!(mock.object("a.txt"), Some(MockObject::File(b"retry me".to_vec())));
        assert!(!staged.path.exists());
    }

    #[test]
    fn exhausted_retries_dead_letter_instead_of_hanging() {
        let tree = tempfile::tempdir().unwrap();
        fs::write(tree.path().join("a.txt"), b"doomed").unwrap();

        let staging_dir = tempfile::tempdir().unwrap();
        let staged = staging::stage_file(&tree.path().join("a.txt"), staging_dir.path()).unwrap();

        let mock = Arc::new(MockClient::with_connections(4));
        mock.fail_next_puts("a.txt", u32::MAX);
        let ctx = context(
            mock.clone(),
            tree.path(),
            TransferTotals {
                objects: 1,
                bytes: 6,
            },
            3,
        );

        let never = AtomicBool::new(false);
        ctx.queue
            .put(
                ObjectUpload::file(tree.path().join("a.txt"), staged.path.clone(), 6),
                &never,
            )
            .unwrap();

        let handles = spawn_workers(&ctx, 2).unwrap();
        join_all(handles);

        assert_eq!(ctx.counters.completed(), 0);
        assert_eq!(ctx.counters.dead_lettered(), 1);
        assert_eq!(ctx.counters.settled(), 1);
        assert!(mock.object("a.txt").is_none());
        // Dead-lettered units release their staging artifact too.
        assert!(!staged.path.exists());
        assert_eq!(ctx.progress.total_bytes(), 0);
    }

    #[test]
    fn cancellation_stops_workers_promptly() {
        let tree = tempfile::tempdir().unwrap();
        let ctx = context(
            Arc::new(MockClient::with_connections(4)),
            tree.path(),
            TransferTotals {
                objects: 100,
                bytes: 0,
            },
            5,
        );

        let handles = spawn_workers(&ctx, 2).unwrap();
        ctx.cancel.store(true, Ordering::Relaxed);
        join_all(handles);

        assert!(ctx.counters.completed() < 100);
    }
}
