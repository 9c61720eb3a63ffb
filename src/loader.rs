//! Queue loader (producer side)
//!
//! Walks the local tree once on a dedicated staging pool, turns every entry
//! into a transfer unit and pushes it onto the bounded queue. Staging is
//! CPU/disk bound while uploads are remote bound, so the pools are separate.
//! The count pass has already advertised the totals; anything that fails
//! after that point is counted as lost so the run can terminate loudly.

use crate::engine::UploadContext;
use crate::logger::Logger;
use crate::staging;
use crate::transfer::ObjectUpload;
use crate::walk::{self, EntryKind, LocalEntry};
use anyhow::{Context, Result};
use rayon::iter::{ParallelBridge, ParallelIterator};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn build_unit(entry: &LocalEntry, staging_dir: &Path, logger: &dyn Logger) -> Result<ObjectUpload> {
    match entry.kind {
        EntryKind::Directory => Ok(ObjectUpload::directory(entry.path.clone())),
        EntryKind::SymbolicLink => {
            let target = std::fs::read_link(&entry.path)
                .with_context(|| format!("Failed to read link {}", entry.path.display()))?;
            Ok(ObjectUpload::symbolic_link(entry.path.clone(), target))
        }
        EntryKind::File => {
            let staged = staging::stage_file(&entry.path, staging_dir)?;
            logger.staged(&entry.path, staged.uncompressed_size);
            Ok(ObjectUpload::file(
                entry.path.clone(),
                staged.path,
                staged.uncompressed_size,
            ))
        }
    }
}

/// Start the producer: returns a handle that completes once the traversal is
/// fully drained into the queue (or the run is cancelled).
pub fn spawn(
    ctx: Arc<UploadContext>,
    staging_dir: PathBuf,
    threads: usize,
) -> Result<JoinHandle<()>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("loader-{i}"))
        .build()
        .context("Failed to build staging pool")?;

    let handle = thread::Builder::new()
        .name("queue-loader".into())
        .spawn(move || {
            pool.install(|| {
                walk::entries(&ctx.local_root, &*ctx.logger)
                    .par_bridge()
                    .for_each(|entry| {
                        if ctx.cancel.load(Ordering::Relaxed) {
                            return;
                        }
                        match build_unit(&entry, &staging_dir, &*ctx.logger) {
                            Ok(unit) => {
                                // Workers exit once the advertised total has
                                // settled; anything still coming off the walk
                                // at that point has no consumer left.
                                let abort = || {
                                    ctx.cancel.load(Ordering::Relaxed)
                                        || ctx.counters.settled() >= ctx.totals.objects
                                };
                                if let Err(unit) = ctx.queue.put_unless(unit, abort) {
                                    let _ = unit.discard_staging();
                                }
                            }
                            Err(e) => {
                                ctx.logger.error("stage", &entry.path, &e.to_string());
                                ctx.counters.mark_lost();
                            }
                        }
                    });
            });
        })
        .context("Failed to spawn queue loader")?;

    Ok(handle)
}
