//! Bounded connection pool.
//!
//! A semaphore with `max_size` permits bounds how many sessions are checked
//! out; idle sessions sit in a mutex-guarded stack. A session is only opened
//! when a permit holder finds the stack empty, so the number of live
//! sessions never exceeds `max_size`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::session::{Connector, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// Fail with `PoolExhausted` instead of waiting.
    pub non_blocking: bool,
}

impl PoolConfig {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            acquire_timeout: None,
            non_blocking: false,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub live: usize,
    pub total_created: usize,
    pub peak_in_use: usize,
    pub max_size: usize,
}

struct PoolInner<C: Connector> {
    config: PoolConfig,
    connector: C,
    idle: Mutex<Vec<C::Session>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    live: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
    total_created: AtomicUsize,
}

impl<C: Connector> PoolInner<C> {
    fn checked_in(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    fn dropped_session(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A checked-out session. Hand it back with `Pool::release` or
/// `Pool::discard`; dropping it discards the session.
pub struct Lease<C: Connector> {
    session: Option<C::Session>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> Lease<C> {
    fn take(&mut self) -> Option<C::Session> {
        let session = self.session.take();
        if session.is_some() {
            self.pool.checked_in();
        }
        session
    }
}

impl<C: Connector> std::ops::Deref for Lease<C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Connector> std::ops::DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.take().is_some() {
            self.pool.dropped_session();
            debug!("lease_dropped_without_release");
        }
    }
}

pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Opens `min_size` sessions up front.
    pub async fn open(config: PoolConfig, connector: C) -> Result<Self> {
        if config.max_size == 0 {
            return Err(IngestError::config("pool max_size must be at least 1"));
        }
        if config.min_size > config.max_size {
            return Err(IngestError::config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                config.min_size, config.max_size
            )));
        }

        let mut warm = Vec::with_capacity(config.min_size);
        for _ in 0..config.min_size {
            warm.push(connector.connect().await?);
        }
        let warm_count = warm.len();

        info!(
            min_size = config.min_size,
            max_size = config.max_size,
            "pool_opened"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                config,
                connector,
                idle: Mutex::new(warm),
                closed: AtomicBool::new(false),
                live: AtomicUsize::new(warm_count),
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
                total_created: AtomicUsize::new(warm_count),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    #[cfg(test)]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Checks out an idle session, or opens one if fewer than `max_size`
    /// are checked out.
    pub async fn acquire(&self) -> Result<Lease<C>> {
        if self.is_closed() {
            return Err(IngestError::PoolClosed);
        }
        let permit = self.acquire_permit().await?;

        let session = match self.pop_idle().await {
            Some(session) => session,
            None => {
                let session = self.inner.connector.connect().await?;
                self.inner.live.fetch_add(1, Ordering::SeqCst);
                self.inner.total_created.fetch_add(1, Ordering::SeqCst);
                session
            }
        };

        let in_use = self.inner.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_in_use.fetch_max(in_use, Ordering::SeqCst);

        Ok(Lease {
            session: Some(session),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.inner.semaphore);

        if self.inner.config.non_blocking {
            return semaphore.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => IngestError::PoolClosed,
                TryAcquireError::NoPermits => IngestError::PoolExhausted {
                    waited: Duration::ZERO,
                },
            });
        }

        match self.inner.config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| IngestError::PoolExhausted { waited: timeout })?
                .map_err(|_| IngestError::PoolClosed),
            None => semaphore
                .acquire_owned()
                .await
                .map_err(|_| IngestError::PoolClosed),
        }
    }

    async fn pop_idle(&self) -> Option<C::Session> {
        let mut idle = self.inner.idle.lock().await;
        while let Some(session) = idle.pop() {
            if !session.is_broken() {
                return Some(session);
            }
            self.inner.dropped_session();
            debug!("broken_idle_session_dropped");
        }
        None
    }

    /// Returns a healthy session to the idle set. Broken sessions, and any
    /// session released after `close`, are dropped instead.
    pub async fn release(&self, mut lease: Lease<C>) {
        let Some(session) = lease.take() else {
            return;
        };
        if self.is_closed() || session.is_broken() {
            self.inner.dropped_session();
            return;
        }
        let mut idle = self.inner.idle.lock().await;
        // `close` may have drained the idle set while we waited for the lock.
        if self.is_closed() {
            drop(idle);
            self.inner.dropped_session();
            return;
        }
        idle.push(session);
        // The permit is returned when `lease` drops, after the push.
    }

    /// Drops a session after a transport failure. The next acquisition
    /// opens a replacement.
    pub async fn discard(&self, mut lease: Lease<C>) {
        if lease.take().is_some() {
            self.inner.dropped_session();
            warn!(
                live = self.inner.live.load(Ordering::SeqCst),
                "session_discarded"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes idle sessions and fails pending and future acquisitions.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();

        let drained: Vec<C::Session> = self.inner.idle.lock().await.drain(..).collect();
        let closed = drained.len();
        drop(drained);
        self.inner.live.fetch_sub(closed, Ordering::SeqCst);

        info!(
            closed,
            still_checked_out = self.inner.in_use.load(Ordering::SeqCst),
            "pool_closed"
        );
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().await.len(),
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            live: self.inner.live.load(Ordering::SeqCst),
            total_created: self.inner.total_created.load(Ordering::SeqCst),
            peak_in_use: self.inner.peak_in_use.load(Ordering::SeqCst),
            max_size: self.inner.config.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialProvider};
    use crate::memory::{MemoryConnector, MemoryDatabase};
    use tokio::sync::mpsc;

    async fn pool(min: usize, max: usize) -> Pool<MemoryConnector> {
        Pool::open(PoolConfig::new(min, max), MemoryConnector::new(MemoryDatabase::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn warms_min_size_eagerly() {
        let pool = pool(3, 8).await;
        assert_eq!(pool.connector().connects(), 3);

        let stats = pool.stats().await;
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.live, 3);

        let leases = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        assert_eq!(pool.connector().connects(), 3);

        let fourth = pool.acquire().await.unwrap();
        assert_eq!(pool.connector().connects(), 4);

        for lease in leases {
            pool.release(lease).await;
        }
        pool.release(fourth).await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.peak_in_use, 4);
    }

    #[tokio::test]
    async fn rejects_min_above_max() {
        let res = Pool::open(
            PoolConfig::new(5, 4),
            MemoryConnector::new(MemoryDatabase::new()),
        )
        .await;
        assert!(matches!(res, Err(IngestError::Config { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn excess_acquirers_block_until_release() {
        let pool = pool(0, 4).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..8 {
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let _ = tx.send(lease);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut held = Vec::new();
        while let Ok(lease) = rx.try_recv() {
            held.push(lease);
        }
        assert_eq!(held.len(), 4);
        assert_eq!(pool.stats().await.in_use, 4);

        pool.release(held.pop().unwrap()).await;
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        held.push(next);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        for lease in held.drain(..) {
            pool.release(lease).await;
        }
        for _ in 0..3 {
            let lease = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            pool.release(lease).await;
        }

        let stats = pool.stats().await;
        assert_eq!(stats.peak_in_use, 4);
        assert!(stats.total_created <= 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn never_exceeds_max_under_contention() {
        for (min, max) in [(0, 1), (2, 3), (4, 4), (1, 6)] {
            let pool = pool(min, max).await;
            let mut handles = Vec::new();
            for _ in 0..24 {
                let pool = pool.clone();
                handles.push(tokio::spawn(async move {
                    for _ in 0..20 {
                        let lease = pool.acquire().await.unwrap();
                        tokio::task::yield_now().await;
                        pool.release(lease).await;
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let stats = pool.stats().await;
            assert!(stats.peak_in_use <= max, "peak {} > max {max}", stats.peak_in_use);
            assert!(stats.live <= max);
            assert!(stats.total_created <= max);
        }
    }

    #[tokio::test]
    async fn non_blocking_mode_reports_exhaustion() {
        let pool = Pool::open(
            PoolConfig::new(0, 1).with_non_blocking(true),
            MemoryConnector::new(MemoryDatabase::new()),
        )
        .await
        .unwrap();

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, IngestError::PoolExhausted { .. }));

        pool.release(held).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_deadline_reports_exhaustion() {
        let pool = Pool::open(
            PoolConfig::new(1, 1).with_acquire_timeout(Some(Duration::from_millis(20))),
            MemoryConnector::new(MemoryDatabase::new()),
        )
        .await
        .unwrap();

        let _held = pool.acquire().await.unwrap();
        let start = tokio::time::Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert!(matches!(
            err,
            IngestError::PoolExhausted { waited } if waited == Duration::from_millis(20)
        ));
    }

    #[tokio::test]
    async fn discarded_session_is_replaced() {
        let pool = pool(1, 1).await;

        let lease = pool.acquire().await.unwrap();
        pool.discard(lease).await;
        assert_eq!(pool.stats().await.live, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.connector().connects(), 2);
        pool.release(lease).await;

        let stats = pool.stats().await;
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn dropped_lease_frees_its_slot() {
        let pool = pool(0, 1).await;
        drop(pool.acquire().await.unwrap());

        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.live, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let pool = pool(2, 4).await;
        let held = pool.acquire().await.unwrap();

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(IngestError::PoolClosed)));

        pool.release(held).await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.live, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_waiters() {
        let pool = pool(1, 1).await;
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await;

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(IngestError::PoolClosed)));
        pool.release(held).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_racing_close_leaves_nothing_idle() {
        for _ in 0..200 {
            let pool = pool(0, 2).await;
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();

            let releasers: Vec<_> = [a, b]
                .into_iter()
                .map(|lease| {
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.release(lease).await })
                })
                .collect();
            let closer = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.close().await })
            };
            for task in releasers {
                task.await.unwrap();
            }
            closer.await.unwrap();

            let stats = pool.stats().await;
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.live, 0);
            assert_eq!(stats.in_use, 0);
        }
    }

    struct CountingProvider {
        issued: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CredentialProvider for CountingProvider {
        async fn issue(&self, instance: &str) -> Result<Credential> {
            if self.fail {
                return Err(IngestError::credential(instance, "token expired"));
            }
            self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                host: "localhost".to_string(),
                port: 5432,
                database: "databricks_postgres".to_string(),
                username: "ingest".to_string(),
                password: "token".to_string(),
                issued_at: chrono::Utc::now(),
            })
        }

        async fn resolve_host(&self, _instance: &str) -> Result<String> {
            Ok("localhost".to_string())
        }
    }

    #[tokio::test]
    async fn every_new_session_gets_a_fresh_credential() {
        let provider = Arc::new(CountingProvider {
            issued: AtomicUsize::new(0),
            fail: false,
        });
        let connector =
            MemoryConnector::with_provider(MemoryDatabase::new(), provider.clone(), "my-lakebase");
        let pool = Pool::open(PoolConfig::new(2, 3), connector).await.unwrap();
        assert_eq!(provider.issued.load(Ordering::SeqCst), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(provider.issued.load(Ordering::SeqCst), 3);

        pool.discard(a).await;
        pool.release(b).await;
        pool.release(c).await;
        let _again = pool.acquire().await.unwrap();
        assert_eq!(provider.issued.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn credential_failure_aborts_open() {
        let provider = Arc::new(CountingProvider {
            issued: AtomicUsize::new(0),
            fail: true,
        });
        let connector = MemoryConnector::with_provider(MemoryDatabase::new(), provider, "my-lakebase");
        let err = Pool::open(PoolConfig::new(1, 2), connector).await.err().unwrap();
        assert_eq!(err.kind().as_str(), "credential");
    }
}
