//! Upload staging
//!
//! Files are gzip-compressed into temporary artifacts before they hit the
//! transfer queue, so a slow remote never holds the source file open and the
//! wire payload is already final. The artifact is owned by the transfer unit
//! from here on.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct StagedObject {
    pub path: PathBuf,
    pub uncompressed_size: u64,
}

/// Compress `source` into a fresh artifact under `staging_dir`.
pub fn stage_file(source: &Path, staging_dir: &Path) -> Result<StagedObject> {
    let tmp = tempfile::Builder::new()
        .prefix("caravan-")
        .suffix(".gz")
        .tempfile_in(staging_dir)
        .context("Failed to create staging artifact")?;

    let reader = File::open(source)
        .with_context(|| format!("Failed to open {} for staging", source.display()))?;
    let mut reader = BufReader::new(reader);

    let mut encoder = GzEncoder::new(BufWriter::new(tmp.as_file()), Compression::default());
    let uncompressed_size = io::copy(&mut reader, &mut encoder)
        .with_context(|| format!("Failed to stage {}", source.display()))?;
    let mut writer = encoder.finish().context("Failed to finish gzip stream")?;
    writer.flush().context("Failed to flush staging artifact")?;
    drop(writer);

    // Persist: deletion is now the unit's responsibility, not the guard's.
    let (_, path) = tmp
        .keep()
        .context("Failed to persist staging artifact")?;

    Ok(StagedObject {
        path,
        uncompressed_size,
    })
}
