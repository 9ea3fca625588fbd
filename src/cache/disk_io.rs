//! Async disk I/O for cache entries and partial transfers.
//!
//! Layout under the cache directory:
//!
//! ```text
//! entries/<key>.entry     finalized entry: magic, header length, JSON header, payload
//! partial/<key>.partial   raw prefix of an interrupted download
//! ```
//!
//! Entries are written to a temporary file and renamed into place, so a
//! reader never observes a half-written entry.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::entry::{EntryMeta, ResourceKey};

const ENTRY_MAGIC: &[u8; 4] = b"LCE1";
const ENTRY_EXT: &str = "entry";
const PARTIAL_EXT: &str = "partial";
const TMP_MARKER: &str = ".tmp-";
const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum DiskIoError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt entry file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// An entry header found while scanning the cache directory.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub meta: EntryMeta,
    pub modified: SystemTime,
}

/// Disk I/O engine for entry and partial files.
#[derive(Debug)]
pub struct DiskIoEngine {
    entries_dir: PathBuf,
    partial_dir: PathBuf,
}

impl DiskIoEngine {
    /// Create the engine, ensuring both directories exist.
    pub async fn new(cache_dir: &Path) -> Result<Self, DiskIoError> {
        let entries_dir = cache_dir.join("entries");
        let partial_dir = cache_dir.join("partial");
        fs::create_dir_all(&entries_dir).await?;
        fs::create_dir_all(&partial_dir).await?;

        Ok(Self {
            entries_dir,
            partial_dir,
        })
    }

    pub fn entry_path(&self, key: &ResourceKey) -> PathBuf {
        self.entries_dir.join(format!("{key}.{ENTRY_EXT}"))
    }

    pub fn partial_path(&self, key: &ResourceKey) -> PathBuf {
        self.partial_dir.join(format!("{key}.{PARTIAL_EXT}"))
    }

    /// Atomically write an entry file.
    pub async fn write_entry(&self, meta: &EntryMeta, payload: &[u8]) -> Result<PathBuf, DiskIoError> {
        let path = self.entry_path(&meta.key);
        let tmp = self
            .entries_dir
            .join(format!("{}.{ENTRY_EXT}{TMP_MARKER}{}", meta.key, Uuid::new_v4().simple()));

        let bytes = encode_entry(meta, payload)?;
        if let Err(e) = write_and_rename(&tmp, &path, &bytes).await {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary entry file");
                }
            }
            return Err(e.into());
        }

        debug!(
            key = %meta.key,
            path = %path.display(),
            size = bytes.len(),
            codec = %meta.codec,
            "Wrote entry to disk"
        );

        Ok(path)
    }

    /// Read an entry file. `Ok(None)` if it does not exist.
    pub async fn read_entry(&self, key: &ResourceKey) -> Result<Option<(EntryMeta, Vec<u8>)>, DiskIoError> {
        let path = self.entry_path(key);
        let mut data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (meta, offset) = decode_header(&path, &data)?;
        if &meta.key != key {
            return Err(DiskIoError::Corrupt {
                path,
                reason: format!("header names key {}", meta.key),
            });
        }
        let payload = data.split_off(offset);
        if payload.len() as u64 != meta.compressed_size {
            return Err(DiskIoError::Corrupt {
                path,
                reason: format!(
                    "payload is {} bytes, header says {}",
                    payload.len(),
                    meta.compressed_size
                ),
            });
        }

        Ok(Some((meta, payload)))
    }

    /// Delete an entry file. Returns whether a file was removed.
    pub async fn delete_entry(&self, key: &ResourceKey) -> Result<bool, DiskIoError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, path = %path.display(), "Deleted entry file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Record an access durably as the entry file's modification time.
    pub async fn touch_entry(&self, key: &ResourceKey, when: SystemTime) -> Result<(), DiskIoError> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_modified(when)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(())
    }

    /// Read every entry header under the entries directory.
    ///
    /// Leftover temporary files are removed; unreadable files are skipped.
    pub async fn scan(&self) -> Result<Vec<ScannedEntry>, DiskIoError> {
        let mut found = Vec::new();
        let mut dir = fs::read_dir(&self.entries_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();

            if name.contains(TMP_MARKER) {
                match fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Removed stale temporary entry"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale temporary entry"),
                }
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }

            match read_header(&path).await {
                Ok(meta) => {
                    let modified = item
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .unwrap_or_else(|_| SystemTime::now());
                    found.push(ScannedEntry { meta, modified });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry file"),
            }
        }

        Ok(found)
    }

    /// Bytes already received for an interrupted transfer.
    pub async fn partial_len(&self, key: &ResourceKey) -> Result<u64, DiskIoError> {
        match fs::metadata(self.partial_path(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Contents of the partial file, empty if none exists.
    pub async fn read_partial(&self, key: &ResourceKey) -> Result<Vec<u8>, DiskIoError> {
        match fs::read(self.partial_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the partial file for appending; `truncate` starts it over.
    pub async fn open_partial(&self, key: &ResourceKey, truncate: bool) -> Result<fs::File, DiskIoError> {
        let mut options = fs::OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        Ok(options.open(self.partial_path(key)).await?)
    }

    pub async fn remove_partial(&self, key: &ResourceKey) -> Result<(), DiskIoError> {
        match fs::remove_file(self.partial_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every entry and partial file.
    pub async fn clear(&self) -> Result<(), DiskIoError> {
        for dir in [&self.entries_dir, &self.partial_dir] {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

async fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

/// Serialize an entry: magic, little-endian header length, JSON header, payload.
pub fn encode_entry(meta: &EntryMeta, payload: &[u8]) -> Result<Vec<u8>, DiskIoError> {
    let header = serde_json::to_vec(meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut out = Vec::with_capacity(8 + header.len() + payload.len());
    out.extend_from_slice(ENTRY_MAGIC);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parse the header of an entry file. Returns it with the payload offset.
pub fn decode_header(path: &Path, data: &[u8]) -> Result<(EntryMeta, usize), DiskIoError> {
    let corrupt = |reason: String| DiskIoError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if data.len() < 8 || &data[..4] != ENTRY_MAGIC {
        return Err(corrupt("missing entry magic".to_string()));
    }
    let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    if len > MAX_HEADER_LEN || data.len() < 8 + len {
        return Err(corrupt(format!("header length {len} out of bounds")));
    }
    let meta: EntryMeta =
        serde_json::from_slice(&data[8..8 + len]).map_err(|e| corrupt(e.to_string()))?;
    Ok((meta, 8 + len))
}

async fn read_header(path: &Path) -> Result<EntryMeta, DiskIoError> {
    let mut file = fs::File::open(path).await?;
    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix).await.map_err(|_| DiskIoError::Corrupt {
        path: path.to_path_buf(),
        reason: "file shorter than its prefix".to_string(),
    })?;
    if &prefix[..4] != ENTRY_MAGIC {
        return Err(DiskIoError::Corrupt {
            path: path.to_path_buf(),
            reason: "missing entry magic".to_string(),
        });
    }
    let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if len > MAX_HEADER_LEN {
        return Err(DiskIoError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("header length {len} out of bounds"),
        });
    }

    let mut buf = prefix.to_vec();
    buf.resize(8 + len, 0);
    file.read_exact(&mut buf[8..]).await?;
    decode_header(path, &buf).map(|(meta, _)| meta)
}
