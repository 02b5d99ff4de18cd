//! External Tier - Shared Cold Store
//!
//! Network-backed tier shared between processes.
//!
//! # Design
//!
//! - Pluggable [`ExternalStore`] backend (HTTP key-value service, in-memory)
//! - Every call is bounded by a timeout; a timeout is a tier failure, never
//!   a cache-wide one
//! - Records are opaque bytes to the store; the TTL travels as a hint so the
//!   store can expire on its own

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};

use super::TierKind;
use crate::cache::entry::CacheEntry;
use crate::error::{Error, Result};

/// External storage backend trait
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Fetch a record
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a record with a TTL hint
    async fn put(&self, key: &str, record: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a record
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}

// =============================================================================
// HTTP Store
// =============================================================================

/// REST key-value store client.
///
/// - `GET    {endpoint}/keys/{key}` -> 200 record bytes | 404
/// - `PUT    {endpoint}/keys/{key}` with `x-ttl-seconds` header
/// - `DELETE {endpoint}/keys/{key}` -> 2xx | 404
/// - `GET    {endpoint}/keys?prefix={prefix}` -> JSON array of keys
pub struct HttpExternalStore {
    endpoint: String,
    client: Client,
}

impl HttpExternalStore {
    /// Create a client for `endpoint`
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/keys/{}", self.endpoint, urlencoding::encode(key))
    }

    fn failure(&self, op: &str, reason: impl std::fmt::Display) -> Error {
        Error::tier(
            TierKind::External,
            format!("{} {} failed: {}", op, self.endpoint, reason),
        )
    }
}

#[async_trait]
impl ExternalStore for HttpExternalStore {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let response = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| self.failure("GET", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| self.failure("GET", e))?;
                Ok(Some(body))
            }
            status => Err(self.failure("GET", status)),
        }
    }

    async fn put(&self, key: &str, record: Bytes, ttl: Duration) -> Result<()> {
        let response = self
            .client
            .put(self.key_url(key))
            .header("x-ttl-seconds", ttl.as_secs().max(1))
            .body(record)
            .send()
            .await
            .map_err(|e| self.failure("PUT", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.failure("PUT", response.status()))
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| self.failure("DELETE", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(self.failure("DELETE", status)),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/keys", self.endpoint))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| self.failure("SCAN", e))?;

        if !response.status().is_success() {
            return Err(self.failure("SCAN", response.status()));
        }
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| self.failure("SCAN", e))
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory store, for tests and single-process deployments.
///
/// Can simulate an outage or a slow network.
pub struct InMemoryExternalStore {
    storage: DashMap<String, Bytes>,
    available: AtomicBool,
    latency: RwLock<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryExternalStore {
    /// Create a new, available store
    pub fn new() -> Self {
        Self {
            storage: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (false) or recovery (true)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::tier(TierKind::External, "store offline"))
        }
    }
}

impl Default for InMemoryExternalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalStore for InMemoryExternalStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.simulate().await?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, record: Bytes, _ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.storage.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.simulate().await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.simulate().await?;
        Ok(self
            .storage
            .iter()
            .filter(|item| item.key().starts_with(prefix))
            .map(|item| item.key().clone())
            .collect())
    }
}

// =============================================================================
// External Tier
// =============================================================================

/// External tier wrapping a store with a per-call timeout
pub struct ExternalTier {
    store: Arc<dyn ExternalStore>,
    timeout: Duration,
}

impl ExternalTier {
    /// Create an external tier
    pub fn new(store: Arc<dyn ExternalStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ExternalStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, op: &str, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::tier(
                TierKind::External,
                format!(
                    "{} on {} timed out after {:?}",
                    op,
                    self.store.name(),
                    self.timeout
                ),
            )),
        }
    }

    /// Fetch an entry
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let record = self.bounded("get", self.store.get(key)).await?;
        match record {
            Some(record) => {
                let entry = CacheEntry::from_record(record, TierKind::External)?;
                Ok((entry.key() == key).then_some(entry))
            }
            None => Ok(None),
        }
    }

    /// Store an entry
    pub async fn set(&self, entry: CacheEntry) -> Result<()> {
        let record = entry.to_record()?;
        self.bounded("set", self.store.put(entry.key(), record, entry.ttl()))
            .await
    }

    /// Delete an entry
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.bounded("delete", self.store.delete(key)).await
    }

    /// Keys starting with `prefix`
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.bounded("scan", self.store.scan(prefix)).await
    }
}

// =============================================================================
// Tests
// =============================================================================
