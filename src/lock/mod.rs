//! 分布式锁服务
//!
//! 锁 = 存储中的一个键 + 绑定在键上的会话租约。获取锁是一次比较-写入事务：
//! 只有当键不存在时才写入，事务成功即代表获得锁。持有者崩溃后续约停止，
//! 租约在 TTL 内过期，键被存储删除，其他竞争者即可获得锁。
//!
//! 键布局（`{name~}` 为转义后不含 '/' 的锁名）：
//!
//! | 类型 | 键 | 获取条件 |
//! |------|----|----------|
//! | 互斥锁 | `{key_prefix}/locks/{name}` | 键不存在 |
//! | 读锁 | `{key_prefix}/rwlocks/{name~}/read/{lease}` | 写键不存在 |
//! | 写锁 | `{key_prefix}/rwlocks/{name~}/write` | 写键不存在且 `read/` 前缀下没有键 |
//!
//! 读写锁位于独立的根下且锁名被转义，任何互斥锁名或其他读写锁名都不会与之重叠。
//!
//! 读写锁不保证公平：持续有读者时写者可能一直等待。

mod handle;

pub use handle::{Lock, ReentrantLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CoordinatorConfig, LockConfig};
use crate::error::{CoordError, Result};
use crate::lease::{LeaseManager, Session};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::store::{Compare, KvStore, LeaseId, RangeOptions, Txn, TxnOp, escape_segment};

const MAX_LOCK_NAME_LEN: usize = 512;

/// 锁类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Exclusive,
    Read,
    Write,
}

/// 写入锁键的持有者信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub kind: LockKind,
    pub lease_id: LeaseId,
    pub acquired_at: DateTime<Utc>,
}

/// 获取方式
#[derive(Debug, Clone, Copy)]
enum Wait {
    /// 只尝试一次
    Once,
    /// 竞争直到超时
    Until(Duration),
}

pub struct LockService {
    leases: Arc<LeaseManager>,
    store: Arc<dyn KvStore>,
    config: LockConfig,
    prefix: String,
    rw_prefix: String,
    holder: String,
    shutdown: CancellationToken,
}

impl LockService {
    pub fn new(
        leases: Arc<LeaseManager>,
        config: &CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store: leases.store().clone(),
            leases,
            config: config.lock.clone(),
            prefix: format!("{}/locks", config.key_prefix),
            rw_prefix: format!("{}/rwlocks", config.key_prefix),
            holder: Uuid::new_v4().to_string(),
            shutdown,
        }
    }

    /// 本实例写入锁记录时使用的持有者标识
    pub fn holder_id(&self) -> &str {
        &self.holder
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl()
    }

    /// 阻塞获取互斥锁，最长等待 `acquire_timeout_ms`
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.acquire_with_timeout(key, ttl, self.config.acquire_timeout())
            .await
    }

    /// 阻塞获取互斥锁，超时返回 `Timeout`
    pub async fn acquire_with_timeout(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Lock> {
        self.obtain(key, LockKind::Exclusive, ttl, Wait::Until(timeout))
            .await
    }

    /// 只尝试一次；锁已被持有时返回 `Conflict`
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.obtain(key, LockKind::Exclusive, ttl, Wait::Once).await
    }

    /// 获取可重入锁
    pub async fn acquire_reentrant(&self, key: &str, ttl: Duration) -> Result<ReentrantLock> {
        if !self.config.enable_reentrant {
            return Err(CoordError::validation("reentrant locks are disabled"));
        }
        let lock = self.acquire(key, ttl).await?;
        Ok(ReentrantLock::new(lock))
    }

    pub async fn acquire_read_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.obtain(
            key,
            LockKind::Read,
            ttl,
            Wait::Until(self.config.acquire_timeout()),
        )
        .await
    }

    pub async fn acquire_write_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.obtain(
            key,
            LockKind::Write,
            ttl,
            Wait::Until(self.config.acquire_timeout()),
        )
        .await
    }

    pub async fn try_acquire_read_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.obtain(key, LockKind::Read, ttl, Wait::Once).await
    }

    pub async fn try_acquire_write_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.obtain(key, LockKind::Write, ttl, Wait::Once).await
    }

    /// 任意类型的锁当前是否被持有
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        validate_name(key)?;
        if self.store.get(&self.lock_key(key)).await?.is_some() {
            return Ok(true);
        }
        let base = self.rw_base(key);
        if self.store.get(&format!("{}/write", base)).await?.is_some() {
            return Ok(true);
        }
        let readers = self
            .store
            .range(&format!("{}/read/", base), RangeOptions::prefix().limit(1))
            .await?;
        Ok(!readers.kvs.is_empty())
    }

    /// 读取互斥锁当前持有者信息
    pub async fn holder(&self, key: &str) -> Result<Option<LockRecord>> {
        validate_name(key)?;
        match self.store.get(&self.lock_key(key)).await? {
            Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
            None => Ok(None),
        }
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn rw_base(&self, name: &str) -> String {
        format!("{}/{}", self.rw_prefix, escape_segment(name))
    }

    /// 计算存储键与获取条件
    fn plan(&self, name: &str, kind: LockKind, lease: LeaseId) -> (String, Vec<Compare>) {
        let base = self.rw_base(name);
        let write_key = format!("{}/write", base);
        match kind {
            LockKind::Exclusive => {
                let key = self.lock_key(name);
                (key.clone(), vec![Compare::absent(key)])
            }
            LockKind::Read => {
                let key = format!("{}/read/{:x}", base, lease);
                (
                    key.clone(),
                    vec![Compare::absent(write_key), Compare::absent(key)],
                )
            }
            LockKind::Write => (
                write_key.clone(),
                vec![
                    Compare::absent(write_key),
                    Compare::prefix_absent(format!("{}/read/", base)),
                ],
            ),
        }
    }

    async fn obtain(&self, name: &str, kind: LockKind, ttl: Duration, wait: Wait) -> Result<Lock> {
        validate_name(name)?;
        if ttl < Duration::from_secs(1) {
            return Err(CoordError::validation("lock ttl must be at least 1s"));
        }

        let logical_key = format!("lock:{}:{}", name, Uuid::new_v4());
        let session = self.leases.create_session(&logical_key, ttl).await?;
        let mut guard = SessionGuard::new(self.leases.clone(), session.clone());

        let outcome = match wait {
            Wait::Once => match self.attempt(name, kind, &session).await {
                Ok(Some(key)) => Ok(key),
                Ok(None) => Err(CoordError::lock_held(name)),
                Err(e) => Err(e),
            },
            Wait::Until(timeout) => {
                match tokio::time::timeout(timeout, self.contend(name, kind, &session)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoordError::timeout(format!(
                        "timed out after {:?} waiting for lock {}",
                        timeout, name
                    ))),
                }
            }
        };

        match outcome {
            Ok(store_key) => {
                guard.disarm();
                info!(lock = %name, kind = ?kind, lease_id = session.lease_id(), "Lock acquired");
                Ok(Lock::new(
                    name.to_string(),
                    store_key,
                    kind,
                    session,
                    self.leases.clone(),
                    self.store.clone(),
                ))
            }
            Err(e) => {
                guard.close().await;
                Err(e)
            }
        }
    }

    /// 带退避的竞争循环
    async fn contend(&self, name: &str, kind: LockKind, session: &Arc<Session>) -> Result<String> {
        let backoff = ExponentialBackoffPolicy::new(
            usize::MAX,
            Duration::from_millis(self.config.retry_initial_ms),
            Duration::from_millis(self.config.retry_max_ms),
        )
        .with_jitter(0.2);

        let mut attempt = 0usize;
        loop {
            if let Some(key) = self.attempt(name, kind, session).await? {
                return Ok(key);
            }

            attempt += 1;
            let delay = backoff.backoff_duration(attempt);
            debug!(lock = %name, attempt, delay_ms = delay.as_millis() as u64, "Lock busy, backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = session.done() => {}
            }
        }
    }

    /// 单次事务尝试，成功返回存储键
    async fn attempt(
        &self,
        name: &str,
        kind: LockKind,
        session: &Arc<Session>,
    ) -> Result<Option<String>> {
        if !session.is_alive() {
            if self.shutdown.is_cancelled() {
                return Err(CoordError::Closed);
            }
            return Err(CoordError::unavailable(format!(
                "lease lost while acquiring lock {}",
                name
            )));
        }

        let lease = session.lease_id();
        let (store_key, compares) = self.plan(name, kind, lease);
        let record = LockRecord {
            holder: self.holder.clone(),
            kind,
            lease_id: lease,
            acquired_at: Utc::now(),
        };
        let value = serde_json::to_vec(&record)?;

        let txn = Txn::new()
            .when(compares)
            .and_then([TxnOp::put(store_key.clone(), value, Some(lease))]);
        let resp = self.store.txn(txn).await?;
        Ok(resp.succeeded.then_some(store_key))
    }
}

/// 获取失败（或获取过程被丢弃）时关闭会话
struct SessionGuard {
    leases: Arc<LeaseManager>,
    session: Option<Arc<Session>>,
}

impl SessionGuard {
    fn new(leases: Arc<LeaseManager>, session: Arc<Session>) -> Self {
        Self {
            leases,
            session: Some(session),
        }
    }

    fn disarm(&mut self) {
        self.session = None;
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = self.leases.close_session(&session).await
        {
            warn!(lease_id = session.lease_id(), error = %e, "Failed to close lock session");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.leases
            .close_session_in_background(session, "lock acquisition abandoned");
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoordError::validation("lock key cannot be empty"));
    }
    if name.len() > MAX_LOCK_NAME_LEN {
        return Err(CoordError::validation(format!(
            "lock key exceeds {} bytes",
            MAX_LOCK_NAME_LEN
        )));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(CoordError::validation(
            "lock key must not start or end with '/'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::TaskScope;

    struct Fixture {
        store: Arc<MemoryStore>,
        scope: TaskScope,
        service: LockService,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let scope = TaskScope::new();
        let leases = Arc::new(LeaseManager::new(store.clone(), scope.clone()));
        let config = CoordinatorConfig::test().with_key_prefix("/t");
        let service = LockService::new(leases, &config, scope.token().clone());
        Fixture {
            store,
            scope,
            service,
        }
    }

    /// 共享同一存储的第二个客户端
    fn peer(fx: &Fixture) -> LockService {
        let leases = Arc::new(LeaseManager::new(fx.store.clone(), fx.scope.child()));
        let config = CoordinatorConfig::test().with_key_prefix("/t");
        LockService::new(leases, &config, fx.scope.token().clone())
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_try_acquire_excludes_other_clients() {
        let fx = fixture();
        let other = peer(&fx);

        let lock = fx.service.try_acquire("job:42", TTL).await.unwrap();
        assert!(lock.is_held());
        assert_eq!(lock.store_key(), "/t/locks/job:42");

        let err = other.try_acquire("job:42", TTL).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(fx.service.is_locked("job:42").await.unwrap());

        let record = fx.service.holder("job:42").await.unwrap().unwrap();
        assert_eq!(record.holder, fx.service.holder_id());
        assert_eq!(record.lease_id, lock.lease_id());

        lock.release().await.unwrap();
        assert!(!lock.is_held());
        assert!(!fx.service.is_locked("job:42").await.unwrap());
        let relock = other.try_acquire("job:42", TTL).await.unwrap();
        relock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_try_acquire_does_not_leak_leases() {
        let fx = fixture();
        let other = peer(&fx);
        let lock = fx.service.try_acquire("a", TTL).await.unwrap();
        for _ in 0..3 {
            assert!(other.try_acquire("a", TTL).await.is_err());
        }
        assert_eq!(fx.store.lease_count(), 1);
        lock.release().await.unwrap();
        assert_eq!(fx.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let fx = fixture();
        let lock = fx.service.try_acquire("a", TTL).await.unwrap();
        lock.release().await.unwrap();
        lock.release().await.unwrap();
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_waits_for_release() {
        let fx = fixture();
        let other = peer(&fx);
        let lock = fx.service.try_acquire("job", TTL).await.unwrap();

        let waiter = tokio::spawn(async move {
            other
                .acquire_with_timeout("job", TTL, Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        lock.release().await.unwrap();
        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.is_held());
        acquired.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out_and_cleans_up() {
        let fx = fixture();
        let other = peer(&fx);
        let lock = fx.service.try_acquire("job", TTL).await.unwrap();

        let err = other
            .acquire_with_timeout("job", TTL, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fx.store.lease_count(), 1);
        lock.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_holder_crash_frees_lock_after_ttl() {
        let fx = fixture();
        let other = peer(&fx);
        let lock = fx
            .service
            .try_acquire("job", Duration::from_secs(2))
            .await
            .unwrap();

        fx.store.pause_keep_alives(true);
        tokio::time::timeout(Duration::from_secs(5), lock.lost())
            .await
            .expect("lock should be lost once the lease expires");
        assert!(!lock.is_held());
        assert!(matches!(lock.ttl().await, Err(e) if e.is_not_found()));

        fx.store.pause_keep_alives(false);
        let taken = other.try_acquire("job", TTL).await.unwrap();
        assert!(taken.is_held());
        taken.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_locks_share_and_block_writer() {
        let fx = fixture();
        let other = peer(&fx);

        let r1 = fx.service.try_acquire_read_lock("doc", TTL).await.unwrap();
        let r2 = other.try_acquire_read_lock("doc", TTL).await.unwrap();
        assert_ne!(r1.store_key(), r2.store_key());

        let err = fx.service.try_acquire_write_lock("doc", TTL).await.unwrap_err();
        assert!(err.is_conflict());

        r1.release().await.unwrap();
        r2.release().await.unwrap();

        let w = fx.service.try_acquire_write_lock("doc", TTL).await.unwrap();
        assert!(other.try_acquire_read_lock("doc", TTL).await.is_err());
        assert!(other.try_acquire_write_lock("doc", TTL).await.is_err());
        w.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_counts_holders() {
        let fx = fixture();
        let other = peer(&fx);
        let lock = fx.service.acquire_reentrant("r", TTL).await.unwrap();
        lock.acquire().unwrap();
        assert_eq!(lock.holder_count(), 2);

        lock.release().await.unwrap();
        assert!(lock.is_held());
        assert!(other.try_acquire("r", TTL).await.is_err());

        lock.release().await.unwrap();
        assert!(!lock.is_held());
        assert!(lock.acquire().is_err());
        other.try_acquire("r", TTL).await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_and_renew() {
        let fx = fixture();
        let lock = fx.service.try_acquire("t", TTL).await.unwrap();
        let remaining = lock.ttl().await.unwrap();
        assert!(remaining > Duration::ZERO && remaining <= TTL);

        lock.renew(Duration::from_secs(20)).unwrap();
        assert_eq!(lock.configured_ttl(), Duration::from_secs(20));
        assert!(lock.renew(Duration::ZERO).is_err());

        lock.release().await.unwrap();
        assert!(lock.renew(TTL).is_err());
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.service.try_acquire("", TTL).await,
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            fx.service.try_acquire("a", Duration::from_millis(10)).await,
            Err(CoordError::Validation(_))
        ));
        assert_eq!(fx.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_is_closed() {
        let fx = fixture();
        fx.scope.shutdown().await;
        assert!(matches!(
            fx.service.try_acquire("a", TTL).await,
            Err(CoordError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_new_holder() {
        let fx = fixture();
        let other = peer(&fx);
        let third = peer(&fx);
        let stale = fx
            .service
            .try_acquire("job", Duration::from_secs(2))
            .await
            .unwrap();

        fx.store.pause_keep_alives(true);
        tokio::time::timeout(Duration::from_secs(5), stale.lost())
            .await
            .expect("lease should expire while keep-alives are paused");
        fx.store.pause_keep_alives(false);

        let current = other.try_acquire("job", TTL).await.unwrap();
        stale.release().await.unwrap();

        assert!(current.is_held());
        assert!(fx.store.get("/t/locks/job").await.unwrap().is_some());
        let err = third.try_acquire("job", TTL).await.unwrap_err();
        assert!(err.is_conflict());
        current.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_rw_locks_do_not_collide_with_exclusive_names() {
        let fx = fixture();
        let other = peer(&fx);

        let exclusive = fx.service.try_acquire("doc/write", TTL).await.unwrap();
        let write = other.try_acquire_write_lock("doc", TTL).await.unwrap();
        assert_ne!(exclusive.store_key(), write.store_key());
        write.release().await.unwrap();

        let reader_named = fx.service.try_acquire("doc/read/1", TTL).await.unwrap();
        let read = other.try_acquire_read_lock("doc", TTL).await.unwrap();
        let write = other.try_acquire_write_lock("doc/x", TTL).await.unwrap();
        assert!(write.is_held());

        // 嵌套名称的读写锁互不影响
        let nested_read = fx.service.try_acquire_read_lock("doc/x/y", TTL).await.unwrap();
        read.release().await.unwrap();
        let outer_write = other.try_acquire_write_lock("doc", TTL).await.unwrap();

        for lock in [exclusive, reader_named, write, nested_read, outer_write] {
            lock.release().await.unwrap();
        }
        assert_eq!(fx.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lock_is_revoked_before_shutdown_returns() {
        let fx = fixture();
        let lock = fx.service.try_acquire("job", TTL).await.unwrap();
        assert_eq!(fx.store.lease_count(), 1);

        drop(lock);
        fx.scope.shutdown().await;
        assert_eq!(fx.store.lease_count(), 0);
        assert!(fx.store.get("/t/locks/job").await.unwrap().is_none());
    }
}
