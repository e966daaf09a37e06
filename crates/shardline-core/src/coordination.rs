//! Revisioned, hierarchical coordination store
//!
//! The fleet reads its desired state from a store shaped like etcd: string
//! keys, a global revision that increases on every write, prefix reads that
//! observe one revision, and leases whose expiry deletes attached keys.
//!
//! [`MemoryCoordinationStore`] implements the contract in-process. It backs
//! single-node deployments seeded from config, and every test.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::{Error, Result};

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// All keys under a prefix, observed at one store revision
#[derive(Debug, Clone, Default)]
pub struct PrefixRead {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Every key starting with `prefix`, sorted by key
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Extends a lease by its TTL
    ///
    /// # Errors
    /// `Error::NotFound` once the lease has expired or been revoked.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease and deletes the keys attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Creates `key` bound to `lease` unless it already exists
    ///
    /// Returns `true` when this call created the key.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool>;
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
}

impl Inner {
    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        if self.leases.remove(&id).is_none() {
            return false;
        }
        let before = self.kvs.len();
        self.kvs.retain(|_, kv| kv.lease != Some(id));
        if self.kvs.len() != before {
            self.revision += 1;
        }
        true
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> i64 {
        self.revision += 1;
        self.kvs.insert(
            key.to_string(),
            KeyValue {
                key: key.to_string(),
                value,
                mod_revision: self.revision,
                lease,
            },
        );
        self.revision
    }
}

/// In-process coordination store
///
/// Lease expiry follows `tokio::time`, so tests can drive it with a paused
/// clock.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `RemoteUnavailable` until re-enabled
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Writes a key, returning the new revision
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> i64 {
        self.inner.lock().put(key, value.into(), None)
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<i64> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.put(key, bytes))
    }

    /// Keys currently stored under `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.expire_leases();
        inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Deletes a key, returning whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let existed = inner.kvs.remove(key).is_some();
        if existed {
            inner.revision += 1;
        }
        existed
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::remote("coordination store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.expire_leases();
        Ok(inner.kvs.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.expire_leases();
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(PrefixRead {
            revision: inner.revision,
            kvs,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_available()?;
        if ttl.is_zero() {
            return Err(Error::invalid_input("lease ttl must be positive"));
        }
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.expire_leases();
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or_else(|| Error::NotFound(format!("lease {} expired", lease)))?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        self.inner.lock().drop_lease(lease);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.expire_leases();
        if !inner.leases.contains_key(&lease) {
            return Err(Error::NotFound(format!("lease {} expired", lease)));
        }
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.put(key, value, Some(lease));
        Ok(true)
    }
}
