//! Directory-rooted object store
//!
//! `DirStoreClient` implements the transfer contract against a store rooted
//! at a plain directory (a mounted export or NAS path). Objects mirror the
//! local tree; file content is streamed out of the gzip staging artifact and
//! renamed into place so overwrites are atomic. Checksums and sizes recorded
//! at put time live in an append-only JSONL manifest consulted by download
//! verification.

use crate::checksum::{self, Digest};
use crate::client::{RemoteEntry, TransferClient};
use crate::verify::VerificationResult;
use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

const MANIFEST_NAME: &str = ".caravan-manifest.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ManifestRecord {
    path: String,
    size: u64,
    checksum: String,
    timestamp: String,
}

pub struct DirStoreClient {
    root: PathBuf,
    connections: usize,
    records: Mutex<HashMap<String, ManifestRecord>>,
    manifest: Mutex<File>,
}

impl DirStoreClient {
    pub fn open(root: &Path, connections: usize) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create store root {}", root.display()))?;

        let manifest_path = root.join(MANIFEST_NAME);
        let records = load_manifest(&manifest_path)?;
        let manifest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest_path)
            .context("Failed to open store manifest")?;

        Ok(Self {
            root: root.to_path_buf(),
            connections: connections.max(1),
            records: Mutex::new(records),
            manifest: Mutex::new(manifest),
        })
    }

    fn object_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote)
    }

    fn record_object(&self, remote: &str, size: u64, digest: &Digest) -> Result<()> {
        let record = ManifestRecord {
            path: remote.to_string(),
            size,
            checksum: checksum::to_hex(digest),
            timestamp: Utc::now().to_rfc3339(),
        };

        let line = serde_json::to_string(&record)?;
        {
            let mut file = self.manifest.lock();
            writeln!(file, "{}", line).context("Failed to append manifest record")?;
        }
        self.records.lock().insert(record.path.clone(), record);
        Ok(())
    }

    fn recorded(&self, remote: &str) -> Option<ManifestRecord> {
        self.records.lock().get(remote).cloned()
    }
}

fn load_manifest(path: &Path) -> Result<HashMap<String, ManifestRecord>> {
    let mut records = HashMap::new();
    if !path.exists() {
        return Ok(records);
    }
    let reader = BufReader::new(
        File::open(path).context("Failed to open store manifest for reading")?,
    );
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // Last record for a path wins; damaged lines are ignored.
        if let Ok(record) = serde_json::from_str::<ManifestRecord>(&line) {
            records.insert(record.path.clone(), record);
        }
    }
    Ok(records)
}

/// `/`-separated store path for a local path under `local_root`
fn relative_remote(local: &Path, local_root: &Path) -> Result<String> {
    let rel = local.strip_prefix(local_root).with_context(|| {
        format!(
            "{} is outside the local root {}",
            local.display(),
            local_root.display()
        )
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

impl TransferClient for DirStoreClient {
    fn max_concurrent_connections(&self) -> usize {
        self.connections
    }

    fn remote_root(&self) -> String {
        self.root.display().to_string()
    }

    fn to_remote_path(&self, local: &Path, local_root: &Path) -> Result<String> {
        relative_remote(local, local_root)
    }

    fn to_local_path(&self, remote: &str, local_root: &Path) -> PathBuf {
        let mut path = local_root.to_path_buf();
        for part in remote.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    fn mkdirp(&self, remote: &str) -> Result<()> {
        let dir = self.object_path(remote);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory {}", dir.display()))
    }

    fn put_file(&self, remote: &str, staging: &Path, _uncompressed_size: u64) -> Result<()> {
        let dest = self.object_path(remote);
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)?;

        let staged = File::open(staging)
            .with_context(|| format!("Failed to open staging artifact {}", staging.display()))?;
        let mut decoder = GzDecoder::new(BufReader::new(staged));

        let tmp = tempfile::NamedTempFile::new_in(&parent)
            .context("Failed to create store temp file")?;
        let mut writer = BufWriter::new(tmp.as_file());
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut written = 0u64;

        loop {
            let n = decoder.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            writer.write_all(&buffer[..n])?;
            written += n as u64;
        }
        writer.flush()?;
        drop(writer);

        tmp.persist(&dest)
            .with_context(|| format!("Failed to move object into place at {}", dest.display()))?;

        let digest: Digest = hasher.finalize().into();
        self.record_object(remote, written, &digest)
    }

    fn put_link(&self, remote: &str, target: &Path) -> Result<()> {
        let dest = self.object_path(remote);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        // Overwrite semantics: drop whatever held the name before.
        match fs::remove_file(&dest) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &dest)
            .with_context(|| format!("Failed to write link object {}", dest.display()))?;

        #[cfg(not(unix))]
        fs::write(&dest, target.to_string_lossy().as_bytes())
            .with_context(|| format!("Failed to write link object {}", dest.display()))?;

        Ok(())
    }

    fn list(&self) -> Result<Box<dyn Iterator<Item = RemoteEntry> + Send>> {
        let root = self.root.clone();
        let iter = WalkDir::new(self.root.clone())
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_map(move |res| {
                let entry = res.ok()?;
                let name = entry.file_name().to_string_lossy();
                // The manifest and in-flight temp files are bookkeeping, not objects.
                if name == MANIFEST_NAME || name.starts_with(".tmp") {
                    return None;
                }
                let rel = relative_remote(entry.path(), &root).ok()?;
                let meta = entry.metadata().ok()?;
                Some(RemoteEntry {
                    path: rel,
                    is_directory: meta.is_dir(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            });
        Ok(Box::new(iter))
    }

    fn download(&self, remote: &str, sink: &mut dyn Write) -> Result<VerificationResult> {
        let path = self.object_path(remote);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(VerificationResult::MissingRemote)
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open object {}", path.display()))
            }
        };
        if file.metadata()?.is_dir() {
            return Ok(VerificationResult::NotFile);
        }

        let mut reader = BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut bytes = 0u64;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            sink.write_all(&buffer[..n])?;
            bytes += n as u64;
        }

        let Some(record) = self.recorded(remote) else {
            // Nothing recorded to verify against (object placed out of band).
            return Ok(VerificationResult::Ok);
        };
        if record.size != bytes {
            return Ok(VerificationResult::SizeMismatch);
        }
        let digest: Digest = hasher.finalize().into();
        if record.checksum != checksum::to_hex(&digest) {
            return Ok(VerificationResult::ChecksumMismatch);
        }
        Ok(VerificationResult::Ok)
    }

    fn verify_file(&self, remote: &str, size: u64, digest: &Digest) -> VerificationResult {
        let path = self.object_path(remote);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return VerificationResult::MissingRemote,
        };
        if meta.is_dir() {
            return VerificationResult::NotFile;
        }
        if meta.len() != size {
            return VerificationResult::SizeMismatch;
        }
        match checksum::file_checksum(&path) {
            Ok(actual) if actual == *digest => VerificationResult::Ok,
            Ok(_) => VerificationResult::ChecksumMismatch,
            Err(_) => VerificationResult::MissingRemote,
        }
    }

    fn verify_directory(&self, remote: &str) -> VerificationResult {
        match fs::metadata(self.object_path(remote)) {
            Ok(meta) if meta.is_dir() => VerificationResult::Ok,
            Ok(_) => VerificationResult::NotDirectory,
            Err(_) => VerificationResult::MissingRemote,
        }
    }

    fn verify_link(&self, remote: &str, target: &Path) -> VerificationResult {
        let path = self.object_path(remote);

        #[cfg(unix)]
        let stored = fs::read_link(&path);
        #[cfg(not(unix))]
        let stored = fs::read_to_string(&path).map(PathBuf::from);

        match stored {
            Ok(ref stored) if stored.as_path() == target => VerificationResult::Ok,
            Ok(_) => VerificationResult::LinkMismatch,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                VerificationResult::MissingRemote
            }
            Err(_) => VerificationResult::LinkMismatch,
        }
    }

    fn close(&self) {
        let _ = self.manifest.lock().sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging;

    fn client(root: &Path) -> DirStoreClient {
        DirStoreClient::open(root, 4).unwrap()
    }

    fn stage_bytes(content: &[u8]) -> (tempfile::TempDir, PathBuf, u64) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::write(&src, content).unwrap();
        let staged = staging::stage_file(&src, dir.path()).unwrap();
        let size = staged.uncompressed_size;
        (dir, staged.path, size)
    }

    #[test]
    fn put_file_stores_plain_bytes_and_records_checksum() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        let (_guard, staged, size) = stage_bytes(b"object content");

        c.put_file("dir/a.txt", &staged, size).unwrap();
        assert_eq!(fs::read(store.path().join("dir/a.txt")).unwrap(), b"object content");

        let mut sink = Vec::new();
        assert_eq!(c.download("dir/a.txt", &mut sink).unwrap(), VerificationResult::Ok);
        assert_eq!(sink, b"object content");
    }

    #[test]
    fn put_file_overwrites_idempotently() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());

        let (_g1, staged1, size1) = stage_bytes(b"first");
        c.put_file("a.txt", &staged1, size1).unwrap();
        let (_g2, staged2, size2) = stage_bytes(b"second");
        c.put_file("a.txt", &staged2, size2).unwrap();

        assert_eq!(fs::read(store.path().join("a.txt")).unwrap(), b"second");
        let mut sink = Vec::new();
        assert_eq!(c.download("a.txt", &mut sink).unwrap(), VerificationResult::Ok);
    }

    #[test]
    fn manifest_survives_reopen() {
        let store = tempfile::tempdir().unwrap();
        {
            let c = client(store.path());
            let (_g, staged, size) = stage_bytes(b"persisted");
            c.put_file("a.txt", &staged, size).unwrap();
            c.close();
        }

        let c = client(store.path());
        let mut sink = Vec::new();
        assert_eq!(c.download("a.txt", &mut sink).unwrap(), VerificationResult::Ok);
    }

    #[test]
    fn download_detects_tampered_object() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        let (_g, staged, size) = stage_bytes(b"honest bytes");
        c.put_file("a.txt", &staged, size).unwrap();

        fs::write(store.path().join("a.txt"), b"evil  bytes!").unwrap();
        let mut sink = Vec::new();
        assert_eq!(
            c.download("a.txt", &mut sink).unwrap(),
            VerificationResult::ChecksumMismatch
        );
    }

    #[test]
    fn download_missing_object_reports_missing() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        let mut sink = Vec::new();
        assert_eq!(
            c.download("ghost", &mut sink).unwrap(),
            VerificationResult::MissingRemote
        );
    }

    #[test]
    fn list_skips_manifest_and_reports_kinds() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        c.mkdirp("dir").unwrap();
        let (_g, staged, size) = stage_bytes(b"x");
        c.put_file("dir/a.txt", &staged, size).unwrap();

        let mut listed: Vec<_> = c.list().unwrap().map(|e| (e.path, e.is_directory)).collect();
        listed.sort();
        assert_eq!(
            listed,
            vec![("dir".to_string(), true), ("dir/a.txt".to_string(), false)]
        );
    }

    #[test]
    fn verify_file_checks_size_then_checksum() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        let (_g, staged, size) = stage_bytes(b"verify me");
        c.put_file("a.txt", &staged, size).unwrap();

        let digest = checksum::file_checksum(&store.path().join("a.txt")).unwrap();
        assert_eq!(c.verify_file("a.txt", 9, &digest), VerificationResult::Ok);
        assert_eq!(
            c.verify_file("a.txt", 10, &digest),
            VerificationResult::SizeMismatch
        );
        let wrong = *blake3::hash(b"other").as_bytes();
        assert_eq!(
            c.verify_file("a.txt", 9, &wrong),
            VerificationResult::ChecksumMismatch
        );
        assert_eq!(
            c.verify_file("missing", 9, &digest),
            VerificationResult::MissingRemote
        );
    }

    #[test]
    fn mkdirp_is_idempotent() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        c.mkdirp("a/b/c").unwrap();
        c.mkdirp("a/b/c").unwrap();
        assert_eq!(c.verify_directory("a/b/c"), VerificationResult::Ok);
        assert_eq!(c.verify_directory("a/nope"), VerificationResult::MissingRemote);
    }

    #[cfg(unix)]
    #[test]
    fn link_objects_round_trip() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        c.put_link("link", Path::new("a.txt")).unwrap();
        assert_eq!(
            c.verify_link("link", Path::new("a.txt")),
            VerificationResult::Ok
        );
        assert_eq!(
            c.verify_link("link", Path::new("b.txt")),
            VerificationResult::LinkMismatch
        );
        assert_eq!(
            c.verify_link("ghost", Path::new("a.txt")),
            VerificationResult::MissingRemote
        );
    }

    #[test]
    fn path_translation_round_trips() {
        let store = tempfile::tempdir().unwrap();
        let c = client(store.path());
        let local_root = Path::new("/data/tree");
        let local = local_root.join("dir").join("a.txt");

        let remote = c.to_remote_path(&local, local_root).unwrap();
        assert_eq!(remote, "dir/a.txt");
        assert_eq!(c.to_local_path(&remote, local_root), local);
    }
}
