//! File Tier - Local Persistent Warm Cache
//!
//! One record file per key under a cache directory. The record layout is
//! private to this crate (see [`CacheEntry::to_record`]).
//!
//! # Design
//!
//! - File name is the URL-encoded key, so `scan` can list keys without
//!   opening files; keys whose encoding is too long fall back to a hashed
//!   name and are resolved through the record header
//! - Writes go to a temporary file and are renamed into place, so readers
//!   never observe a torn record
//! - Best effort: any I/O problem surfaces as `TierUnavailable`

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;

use super::TierKind;
use crate::cache::entry::{fx_hash, CacheEntry, RecordHeader};
use crate::error::{Error, Result};

/// Longest encoded key used verbatim as a file name
const MAX_NAME_LEN: usize = 200;

/// Prefix of hashed file names; `@` is always percent-encoded so no encoded
/// key can start with it
const HASHED_PREFIX: &str = "@h-";

/// Prefix of in-flight temporary files
const TEMP_PREFIX: &str = "@tmp-";

/// File-backed tier
#[derive(Debug)]
pub struct FileTier {
    dir: PathBuf,
}

impl FileTier {
    /// Open (creating if needed) a file tier rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::tier(TierKind::File, format!("{}: {}", dir.display(), e)))?;
        tracing::info!("File tier opened at {}", dir.display());
        Ok(Self { dir })
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(key: &str) -> String {
        let encoded = urlencoding::encode(key);
        if encoded.len() > MAX_NAME_LEN || encoded == "." || encoded == ".." || encoded.is_empty() {
            format!("{}{:016x}", HASHED_PREFIX, fx_hash(key.as_bytes()))
        } else {
            encoded.into_owned()
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()))
    }

    fn io_error(&self, op: &str, e: std::io::Error) -> Error {
        Error::tier(TierKind::File, format!("{} in {}: {}", op, self.dir.display(), e))
    }

    /// Read an entry
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let record = match fs::read(self.path_for(key)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error("read", e)),
        };
        let entry = CacheEntry::from_record(record, TierKind::File)?;
        // A hashed name may collide with a different key
        if entry.key() != key {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Write an entry atomically
    pub async fn set(&self, entry: CacheEntry) -> Result<()> {
        let record = entry.to_record()?;
        let temp = self.temp_path();

        if let Err(e) = fs::write(&temp, &record).await {
            let _ = fs::remove_file(&temp).await;
            return Err(self.io_error("write", e));
        }
        if let Err(e) = fs::rename(&temp, self.path_for(entry.key())).await {
            let _ = fs::remove_file(&temp).await;
            return Err(self.io_error("rename", e));
        }
        Ok(())
    }

    /// Remove an entry
    pub async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error("delete", e)),
        }
    }

    /// List record files with the key each one holds
    async fn records(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| self.io_error("list", e))?;
        let mut records = Vec::new();

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| self.io_error("list", e))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let key = if name.starts_with(HASHED_PREFIX) {
                match self.read_header(&item.path()).await {
                    Some(header) => header.key,
                    None => continue,
                }
            } else {
                match urlencoding::decode(&name) {
                    Ok(key) => key.into_owned(),
                    Err(_) => continue,
                }
            };
            records.push((item.path(), key));
        }
        Ok(records)
    }

    async fn read_header(&self, path: &Path) -> Option<RecordHeader> {
        let data = fs::read(path).await.ok()?;
        RecordHeader::parse(&data).ok().map(|(header, _)| header)
    }

    /// Keys starting with `prefix`
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .map(|(_, key)| key)
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    /// Remove records expired at `now`. Unreadable records are removed too;
    /// they could never be served.
    pub async fn purge_expired(&self, now: u64) -> Result<usize> {
        let mut removed = 0;
        for (path, key) in self.records().await? {
            let expired = match self.read_header(&path).await {
                Some(header) => now >= header.expires_at,
                None => true,
            };
            if expired && self.reap_if_expired(&path, now).await {
                tracing::trace!("File tier purged {}", key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Unlink the record at `path` if it is still expired at `now`. The file
    /// is moved aside before the second check, so a fresh record renamed
    /// into place meanwhile is never the one unlinked.
    async fn reap_if_expired(&self, path: &Path, now: u64) -> bool {
        let aside = self.temp_path();
        if fs::rename(path, &aside).await.is_err() {
            return false;
        }
        let expired = match self.read_header(&aside).await {
            Some(header) => now >= header.expires_at,
            None => true,
        };
        if expired {
            return fs::remove_file(&aside).await.is_ok();
        }

        // Put the live record back unless a newer write has landed since
        match fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(_) => {
                let _ = fs::rename(&aside, path).await;
            }
        }
        let _ = fs::remove_file(&aside).await;
        false
    }

    /// Number of records
    pub async fn len(&self) -> Result<usize> {
        Ok(self.records().await?.len())
    }

    /// Remove every record
    pub async fn clear(&self) -> Result<()> {
        for (path, _) in self.records().await? {
            fs::remove_file(&path)
                .await
                .map_err(|e| self.io_error("clear", e))?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
