//! Checksum utilities

use anyhow::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Fast file content hashing using BLAKE3
pub fn file_checksum(path: &Path) -> Result<Digest> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024]; // 64KB chunks
    let mut file = File::open(path)?;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

pub fn to_hex(digest: &Digest) -> String {
    blake3::Hash::from_bytes(*digest).to_hex().to_string()
}

pub fn from_hex(hex: &str) -> Result<Digest> {
    let hash = blake3::Hash::from_hex(hex)?;
    Ok(*hash.as_bytes())
}
