//! Transfer unit model
//!
//! One `ObjectUpload` per filesystem entry discovered by the loader. The
//! variant decides which remote operation the worker dispatches.

use std::path::PathBuf;

/// What kind of object a unit carries
#[derive(Debug)]
pub enum UploadKind {
    /// Regular file, staged into a temporary upload-ready artifact
    File {
        staging: PathBuf,
        uncompressed_size: u64,
    },
    Directory,
    /// Symbolic link, uploaded as its target path (never followed)
    SymbolicLink { target: PathBuf },
}

/// A single pending upload pulled off the transfer queue by a worker.
///
/// The staging artifact of a `File` unit is exclusively owned by the unit
/// and must outlive it until the remote write is confirmed.
#[derive(Debug)]
pub struct ObjectUpload {
    /// Absolute local source path
    pub source: PathBuf,
    /// Dispatch attempts so far; bumped by whichever worker holds the unit
    pub attempts: u32,
    pub kind: UploadKind,
}

impl ObjectUpload {
    pub fn file(source: PathBuf, staging: PathBuf, uncompressed_size: u64) -> Self {
        Self {
            source,
            attempts: 0,
            kind: UploadKind::File {
                staging,
                uncompressed_size,
            },
        }
    }

    pub fn directory(source: PathBuf) -> Self {
        Self {
            source,
            attempts: 0,
            kind: UploadKind::Directory,
        }
    }

    pub fn symbolic_link(source: PathBuf, target: PathBuf) -> Self {
        Self {
            source,
            attempts: 0,
            kind: UploadKind::SymbolicLink { target },
        }
    }

    /// Bytes this unit contributes to the progress display
    pub fn payload_bytes(&self) -> u64 {
        match self.kind {
            UploadKind::File {
                uncompressed_size, ..
            } => uncompressed_size,
            _ => 0,
        }
    }

    /// Remove the staging artifact, if the unit owns one.
    ///
    /// Called on confirmed upload, dead-letter, and cancellation cleanup.
    pub fn discard_staging(&self) -> std::io::Result<()> {
        if let UploadKind::File { ref staging, .. } = self.kind {
            match std::fs::remove_file(staging) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Immutable completion target computed before any worker starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    /// Files + directories + symbolic links
    pub objects: u64,
    /// Plain-file bytes only
    pub bytes: u64,
}
