//! Cache Entry Types
//!
//! The entry is the unit every tier stores. Its value is kept in stored form
//! (possibly LZ4-compressed); the `compressed` flag selects the decode path.
//!
//! Slower tiers persist entries as a binary record:
//!
//! ```text
//! ┌──────────┬──────────────────┬─────────────────────┬──────────────┐
//! │ "TCE1"   │ header len (u32) │ JSON RecordHeader   │ value bytes  │
//! │ 4 bytes  │ little endian    │                     │              │
//! └──────────┴──────────────────┴─────────────────────┴──────────────┘
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::tier::TierKind;
use crate::error::{Error, Result};

/// Record magic for persisted entries
const RECORD_MAGIC: &[u8; 4] = b"TCE1";

/// Separator between key namespace segments
pub const NAMESPACE_SEPARATOR: char = ':';

/// Fast non-cryptographic hash (FxHash algorithm)
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Category of a key: its first namespace segment.
///
/// `cart:items:42` belongs to `cart`; a key without a separator is its own
/// category.
pub fn category_of(key: &str) -> &str {
    key.split(NAMESPACE_SEPARATOR).next().unwrap_or(key)
}

/// Cache entry containing stored data and lifecycle metadata
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    key: String,
    value: Bytes,
    created_at: u64,
    expires_at: u64,
    ttl_millis: u64,
    original_size: u64,
    compressed: bool,
    tier: TierKind,
}

impl CacheEntry {
    /// Create a new entry created at `now` (epoch millis) living for `ttl`.
    ///
    /// `ttl` must be non-zero; the facade rejects zero TTLs before this point.
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        original_size: u64,
        compressed: bool,
        now: u64,
        ttl: Duration,
    ) -> Self {
        let ttl_millis = (ttl.as_millis() as u64).max(1);
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: now.saturating_add(ttl_millis),
            ttl_millis,
            original_size,
            compressed,
            tier: TierKind::Memory,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored value (compressed when [`Self::is_compressed`])
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }

    /// Size of the value before compression
    #[inline]
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Tier this copy was read from or written to
    #[inline]
    pub fn tier(&self) -> TierKind {
        self.tier
    }

    /// Bytes charged against a memory budget: key plus stored value
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }

    /// Lazy expiry check
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime at `now`
    pub fn remaining(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    /// Sliding expiration: push `expires_at` out by the original TTL
    pub fn refresh(&mut self, now: u64) {
        self.expires_at = now.saturating_add(self.ttl_millis).max(self.created_at + 1);
    }

    /// Whether both copies come from the same write, whatever tier holds
    /// them or how far sliding expiration has pushed them
    pub fn same_write(&self, other: &CacheEntry) -> bool {
        self.key == other.key
            && self.created_at == other.created_at
            && self.ttl_millis == other.ttl_millis
            && self.compressed == other.compressed
            && self.value == other.value
    }

    /// Re-tag the entry for another tier
    pub fn with_tier(mut self, tier: TierKind) -> Self {
        self.tier = tier;
        self
    }

    /// Encode as a persisted record
    pub fn to_record(&self) -> Result<Bytes> {
        let header = RecordHeader {
            key: self.key.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl_millis: self.ttl_millis,
            original_size: self.original_size,
            compressed: self.compressed,
        };
        let header = serde_json::to_vec(&header)?;

        let mut buf = BytesMut::with_capacity(8 + header.len() + self.value.len());
        buf.put_slice(RECORD_MAGIC);
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.value);
        Ok(buf.freeze())
    }

    /// Decode a persisted record
    pub fn from_record(record: Bytes, tier: TierKind) -> Result<Self> {
        let (header, offset) = RecordHeader::parse(&record)?;
        Ok(Self {
            key: header.key,
            value: record.slice(offset..),
            created_at: header.created_at,
            expires_at: header.expires_at,
            ttl_millis: header.ttl_millis,
            original_size: header.original_size,
            compressed: header.compressed,
            tier,
        })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.value.len())
            .field("original_size", &self.original_size)
            .field("compressed", &self.compressed)
            .field("expires_at", &self.expires_at)
            .field("tier", &self.tier)
            .finish()
    }
}

/// Header of a persisted record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecordHeader {
    pub key: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub ttl_millis: u64,
    pub original_size: u64,
    pub compressed: bool,
}

impl RecordHeader {
    /// Parse the header, returning it with the payload offset
    pub(crate) fn parse(record: &[u8]) -> Result<(Self, usize)> {
        if record.len() < 8 || &record[..4] != RECORD_MAGIC {
            return Err(Error::Serialization("missing record magic".into()));
        }
        let len = u32::from_le_bytes([record[4], record[5], record[6], record[7]]) as usize;
        let end = 8 + len;
        if record.len() < end {
            return Err(Error::Serialization(format!(
                "truncated record header: need {} bytes, have {}",
                end,
                record.len()
            )));
        }
        let header: RecordHeader = serde_json::from_slice(&record[8..end])?;
        if header.expires_at <= header.created_at {
            return Err(Error::Serialization(format!(
                "record for {} expires before it was created",
                header.key
            )));
        }
        Ok((header, end))
    }
}

// =============================================================================
// Tests
// =============================================================================
