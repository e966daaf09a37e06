//! Lease-backed fleet lock
//!
//! Replicas serving the same database serialize disruptive reloads through
//! one lock key in the coordination store. The key is attached to a lease,
//! so a crashed holder frees the lock when its lease runs out.
//!
//! ```text
//! grant lease ──► keep-alive + create_if_absent(/shardline/locks/{db}) ──► held
//!                      │ exists                                            │
//!                      ▼                                                   ▼
//!                 poll until timeout                            keep-alive every ttl/3
//!                      │                                        │
//!                      ▼                                        ▼
//!               revoke lease, LockTimeout            release: revoke lease
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationStore, LeaseId};
use crate::model::keys;
use crate::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(15);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct FleetLock {
    store: Arc<dyn CoordinationStore>,
    holder: String,
    ttl: Duration,
    timeout: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for FleetLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetLock")
            .field("holder", &self.holder)
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FleetLock {
    pub fn new(store: Arc<dyn CoordinationStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquires the lock for `database`, waiting at most the configured timeout
    ///
    /// # Errors
    /// `Error::LockTimeout` if another holder keeps the lock past the timeout.
    /// Store failures are returned as-is. No lease outlives a failed call.
    pub async fn acquire(&self, database: &str) -> Result<FleetLockGuard> {
        let key = keys::lock_key(database);
        let lease = self.store.grant_lease(self.ttl).await?;

        match self.wait_for_key(&key, lease).await {
            Ok(()) => {
                debug!(key = %key, holder = %self.holder, lease, "Fleet lock acquired");
                Ok(FleetLockGuard::start(
                    Arc::clone(&self.store),
                    key,
                    lease,
                    self.ttl,
                ))
            }
            Err(e) => {
                if let Err(revoke_err) = self.store.revoke_lease(lease).await {
                    warn!(key = %key, lease, error = %revoke_err, "Failed to revoke unused lease");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_key(&self, key: &str, lease: LeaseId) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // a fresh ttl on every attempt, including the one that wins
            self.store.keep_alive(lease).await?;
            let created = self
                .store
                .create_if_absent(key, self.holder.as_bytes().to_vec(), lease)
                .await?;
            if created {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout(key.to_string()));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Runs `f` while holding the lock, releasing it on every exit path
    pub async fn with_lock<F, Fut, T>(&self, database: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(database).await?;
        let out = f().await;
        guard.release().await;
        Ok(out)
    }
}

/// Proof of holding a fleet lock
///
/// Dropping the guard without [`release`](Self::release) still revokes the
/// lease in the background when a runtime is available.
pub struct FleetLockGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    lease: LeaseId,
    lost: Arc<AtomicBool>,
    keepalive: Option<JoinHandle<()>>,
    released: bool,
}

impl FleetLockGuard {
    fn start(store: Arc<dyn CoordinationStore>, key: String, lease: LeaseId, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let keepalive = {
            let store = Arc::clone(&store);
            let lost = Arc::clone(&lost);
            let key = key.clone();
            let period = (ttl / 3).max(Duration::from_millis(10));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if let Err(e) = store.keep_alive(lease).await {
                        warn!(key = %key, lease, error = %e, "Fleet lock lease lost");
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            })
        };

        Self {
            store,
            key,
            lease,
            lost,
            keepalive: Some(keepalive),
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// False once the keep-alive failed and the lease may have expired
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        match self.store.revoke_lease(self.lease).await {
            Ok(()) => debug!(key = %self.key, lease = self.lease, "Fleet lock released"),
            Err(e) => warn!(
                key = %self.key,
                lease = self.lease,
                error = %e,
                "Failed to revoke fleet lock lease; it will expire"
            ),
        }
    }
}

impl Drop for FleetLockGuard {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let lease = self.lease;
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.revoke_lease(lease).await {
                        warn!(key = %key, lease, error = %e, "Failed to revoke dropped lock lease");
                    }
                });
            }
            Err(_) => info!(key = %key, lease, "No runtime to revoke lock lease; it will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;

    fn lock(store: &Arc<MemoryCoordinationStore>, holder: &str) -> FleetLock {
        FleetLock::new(store.clone(), holder)
            .with_ttl(Duration::from_secs(3))
            .with_timeout(Duration::from_millis(300))
            .with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_second_acquirer_times_out() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = lock(&store, "replica-a");
        let b = lock(&store, "replica-b");

        let guard = a.acquire("ads").await.unwrap();
        assert!(guard.is_held());
        assert!(matches!(b.acquire("ads").await, Err(Error::LockTimeout(_))));

        let kv = store.get(&keys::lock_key("ads")).await.unwrap().unwrap();
        assert_eq!(kv.value, b"replica-a");

        guard.release().await;
        let guard = b.acquire("ads").await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_locks_are_per_database() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let g1 = lock(&store, "a").acquire("ads").await.unwrap();
        let g2 = lock(&store, "b").acquire("search").await.unwrap();
        g1.release().await;
        g2.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_frees_lock() {
        let store = Arc::new(MemoryCoordinationStore::new());
        // A holder that crashed: key attached to a lease nobody refreshes
        let lease = store.grant_lease(Duration::from_secs(3)).await.unwrap();
        store
            .create_if_absent(&keys::lock_key("ads"), b"dead".to_vec(), lease)
            .await
            .unwrap();

        let waiter = lock(&store, "replica-b").with_timeout(Duration::from_secs(5));
        let guard = waiter.acquire("ads").await.unwrap();
        guard.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acquisition_keeps_full_ttl() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let first = lock(&store, "replica-a").acquire("ads").await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2900)).await;
            first.release().await;
        });

        // waits almost the whole ttl of its own lease before getting the key
        let waiter = lock(&store, "replica-b").with_timeout(Duration::from_secs(5));
        let guard = waiter.acquire("ads").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(guard.is_held());
        let kv = store.get(&keys::lock_key("ads")).await.unwrap().unwrap();
        assert_eq!(kv.value, b"replica-b");
        assert!(matches!(
            lock(&store, "replica-c").acquire("ads").await,
            Err(Error::LockTimeout(_))
        ));
        guard.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_longer_than_ttl_reports_lock_timeout() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let held = lock(&store, "replica-a").acquire("ads").await.unwrap();

        let waiter = lock(&store, "replica-b").with_timeout(Duration::from_secs(10));
        assert!(matches!(waiter.acquire("ads").await, Err(Error::LockTimeout(_))));
        assert!(held.is_held());
        held.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_past_ttl() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let guard = lock(&store, "a").acquire("ads").await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(guard.is_held());
        assert!(store.get(&keys::lock_key("ads")).await.unwrap().is_some());

        guard.release().await;
        assert!(store.get(&keys::lock_key("ads")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let l = lock(&store, "a");
        let out = l.with_lock("ads", || async { 42 }).await.unwrap();
        assert_eq!(out, 42);
        assert!(store.get(&keys::lock_key("ads")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_guard_revokes_in_background() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let guard = lock(&store, "a").acquire("ads").await.unwrap();
        drop(guard);

        let guard = lock(&store, "b").acquire("ads").await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(MemoryCoordinationStore::new());
        store.set_available(false);
        assert!(matches!(
            lock(&store, "a").acquire("ads").await,
            Err(Error::RemoteUnavailable(_))
        ));
    }
}
