//! Workspace archive helpers: gzip framing, object-store key layout,
//! and the compact JSON snapshot built alongside the full tar backup.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use ed_domain::error::{Error, Result};

/// Derived artifacts never included in a backup.
pub const BACKUP_EXCLUDES: &[&str] = &["node_modules", ".next", "dist", "build", ".turbo", ".git"];

/// Files above this size stay out of the JSON snapshot (the tar backup
/// still has them).
const SNAPSHOT_MAX_FILE_BYTES: u64 = 64 * 1024;

pub fn backup_key(user_id: &str, chat_id: &str) -> String {
    format!("{user_id}/{chat_id}/source_backup.tar.gz")
}

pub fn snapshot_key(user_id: &str, chat_id: &str) -> String {
    format!("{user_id}/{chat_id}/source_snapshot.json.gz")
}

pub fn chat_prefix(user_id: &str, chat_id: &str) -> String {
    format!("{user_id}/{chat_id}/")
}

/// KV hint key marking that a backup exists for the chat.
pub fn backup_hint_key(chat_id: &str) -> String {
    format!("backup:exists:{chat_id}")
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Sandbox(format!("gzip failed: {e}")))
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Sandbox(format!("gunzip failed: {e}")))?;
    Ok(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compact representation of the small text files of a workspace, for
/// fast cold reads without unpacking the tar.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// SHA-256 of the source tar, hex-encoded.
    pub digest: String,
    pub files: std::collections::BTreeMap<String, String>,
}

/// Build a gzipped [`Snapshot`] from raw tar bytes.
pub fn build_snapshot(tar_bytes: &[u8]) -> Result<Vec<u8>> {
    let digest = hex::encode(Sha256::digest(tar_bytes));
    let mut files = std::collections::BTreeMap::new();

    let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
    for entry in archive
        .entries()
        .map_err(|e| Error::Sandbox(format!("tar read failed: {e}")))?
    {
        let mut entry = entry.map_err(|e| Error::Sandbox(format!("tar entry failed: {e}")))?;
        if !entry.header().entry_type().is_file() || entry.size() > SNAPSHOT_MAX_FILE_BYTES {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| Error::Sandbox(format!("tar path failed: {e}")))?
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::Sandbox(format!("tar read failed: {e}")))?;
        // Binary files stay out of the snapshot.
        if let Ok(text) = String::from_utf8(contents) {
            files.insert(path, text);
        }
    }

    let snapshot = Snapshot { digest, files };
    gzip(serde_json::to_vec(&snapshot)?.as_slice())
}

/// Decode a gzipped snapshot object.
pub fn read_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let raw = gunzip(bytes)?;
    Ok(serde_json::from_slice(&raw)?)
}
