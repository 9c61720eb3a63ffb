//! Local tree traversal
//!
//! Lazy walkdir-based enumeration shared by the queue loader and the local
//! verification pass. A traversal error on one subtree is logged and that
//! subtree is skipped; it never aborts a run.

use crate::logger::Logger;
use crate::transfer::TransferTotals;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Entry classification matching the transfer unit variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    SymbolicLink,
}

#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Plain-file size; zero for directories and links
    pub size: u64,
}

fn classify(walk: WalkDir, logger: &dyn Logger) -> impl Iterator<Item = LocalEntry> + '_ {
    walk.follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_map(move |res| {
            let entry = match res {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(Path::new("")).to_path_buf();
                    logger.skipped(&path, &e.to_string());
                    return None;
                }
            };

            let ft = entry.file_type();
            let kind = if ft.is_symlink() {
                EntryKind::SymbolicLink
            } else if ft.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            // Links are not followed, so metadata here is the link's own.
            let size = if kind == EntryKind::File {
                match entry.metadata() {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        logger.skipped(entry.path(), &e.to_string());
                        return None;
                    }
                }
            } else {
                0
            };

            Some(LocalEntry {
                path: entry.into_path(),
                kind,
                size,
            })
        })
}

/// Lazy traversal in filesystem order (loader input)
pub fn entries<'a>(root: &Path, logger: &'a dyn Logger) -> impl Iterator<Item = LocalEntry> + 'a {
    classify(WalkDir::new(root), logger)
}

/// Lazy traversal in a stable name order (deterministic verification reports)
pub fn entries_sorted<'a>(
    root: &Path,
    logger: &'a dyn Logger,
) -> impl Iterator<Item = LocalEntry> + 'a {
    classify(WalkDir::new(root).sort_by_file_name(), logger)
}

/// Upfront count pass yielding the completion target.
///
/// Runs before any worker starts; entries skipped here are excluded from the
/// advertised totals so the run can still reach 100%.
pub fn scan_totals(root: &Path, logger: &dyn Logger) -> TransferTotals {
    let mut totals = TransferTotals::default();
    for entry in entries(root, logger) {
        totals.objects += 1;
        totals.bytes += entry.size;
    }
    totals
}
