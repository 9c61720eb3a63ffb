//! Remote store contract
//!
//! The transfer engine only ever talks to the store through this trait, the
//! same seam the logging layer uses (`Arc<dyn Logger>`), so tests can swap in
//! a failure-injecting client without touching the pipeline.

use crate::checksum::Digest;
use crate::verify::VerificationResult;
use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One entry of the lazy remote listing
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Store-relative path, `/`-separated
    pub path: String,
    pub is_directory: bool,
    pub modified: SystemTime,
}

pub trait TransferClient: Send + Sync {
    /// Upper bound on simultaneous store connections; sizes every worker pool
    fn max_concurrent_connections(&self) -> usize;

    /// Human-readable store location for banners
    fn remote_root(&self) -> String;

    fn to_remote_path(&self, local: &Path, local_root: &Path) -> Result<String>;

    fn to_local_path(&self, remote: &str, local_root: &Path) -> PathBuf;

    /// Idempotent create-if-absent of a remote directory
    fn mkdirp(&self, remote: &str) -> Result<()>;

    /// Idempotent overwrite of file content from a staged artifact
    fn put_file(&self, remote: &str, staging: &Path, uncompressed_size: u64) -> Result<()>;

    /// Idempotent overwrite of a symbolic link object
    fn put_link(&self, remote: &str, target: &Path) -> Result<()>;

    /// Unordered, single-pass, lazily produced listing of the remote namespace
    fn list(&self) -> Result<Box<dyn Iterator<Item = RemoteEntry> + Send>>;

    /// Stream an object into `sink`, verifying content on the way through
    fn download(&self, remote: &str, sink: &mut dyn Write) -> Result<VerificationResult>;

    fn verify_file(&self, remote: &str, size: u64, checksum: &Digest) -> VerificationResult;

    fn verify_directory(&self, remote: &str) -> VerificationResult;

    fn verify_link(&self, remote: &str, target: &Path) -> VerificationResult;

    /// Release underlying connections
    fn close(&self);
}
