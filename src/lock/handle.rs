//! 锁句柄

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::LockKind;
use crate::error::{CoordError, Result};
use crate::lease::{LeaseManager, Session};
use crate::store::{KvStore, LeaseId};

/// 已获取的分布式锁
///
/// 锁的归属由存储中的键及其租约决定：
/// - `release()` 撤销租约，存储只删除绑定在该租约上的键
/// - 续约中断后租约在 TTL 内过期，键随之被删除，`is_held()` 变为 false
///
/// 每把锁独占一个会话，释放不会触及其他持有者写入的同名键。
/// 未显式释放就被丢弃时，由租约管理器的后台任务撤销租约。
pub struct Lock {
    name: String,
    store_key: String,
    kind: LockKind,
    session: Arc<Session>,
    leases: Arc<LeaseManager>,
    store: Arc<dyn KvStore>,
    acquired_at: DateTime<Utc>,
    ttl: Mutex<Duration>,
    released: AtomicBool,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("store_key", &self.store_key)
            .field("kind", &self.kind)
            .field("lease_id", &self.session.lease_id())
            .field("held", &self.is_held())
            .finish()
    }
}

impl Lock {
    pub(crate) fn new(
        name: String,
        store_key: String,
        kind: LockKind,
        session: Arc<Session>,
        leases: Arc<LeaseManager>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let ttl = session.lease().ttl;
        Self {
            name,
            store_key,
            kind,
            session,
            leases,
            store,
            acquired_at: Utc::now(),
            ttl: Mutex::new(ttl),
            released: AtomicBool::new(false),
        }
    }

    /// 调用方传入的锁名
    pub fn key(&self) -> &str {
        &self.name
    }

    /// 存储中的实际键
    pub fn store_key(&self) -> &str {
        &self.store_key
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn lease_id(&self) -> LeaseId {
        self.session.lease_id()
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// 最近一次 `renew` 记录的 TTL
    pub fn configured_ttl(&self) -> Duration {
        *self.ttl.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 未释放且会话仍存活
    pub fn is_held(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.session.is_alive()
    }

    /// 等待锁失效（租约丢失或被释放）
    pub async fn lost(&self) {
        self.session.done().await
    }

    /// 更新记录的 TTL
    ///
    /// 租约的实际续期由后台续约任务持续完成，这里只更新本地记录，不访问存储。
    pub fn renew(&self, ttl: Duration) -> Result<()> {
        if ttl < Duration::from_secs(1) {
            return Err(CoordError::validation("lock ttl must be at least 1s"));
        }
        if !self.is_held() {
            return Err(CoordError::lease_not_found(self.lease_id()));
        }
        *self.ttl.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = ttl;
        debug!(lock = %self.name, ttl_secs = ttl.as_secs(), "Lock ttl renewed");
        Ok(())
    }

    /// 查询租约剩余时间；租约已过期时返回 `NotFound`
    pub async fn ttl(&self) -> Result<Duration> {
        let secs = self.store.time_to_live(self.lease_id()).await?;
        Ok(Duration::from_secs(secs.max(0) as u64))
    }

    /// 释放锁
    ///
    /// 无论存储操作是否成功，本地都会标记为已释放；撤销租约失败时返回该错误。
    /// 重复释放直接返回成功。
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(lock = %self.name, "Lock already released");
            return Ok(());
        }

        match self.leases.close_session(&self.session).await {
            Ok(()) => {
                info!(lock = %self.name, kind = ?self.kind, "Lock released");
                Ok(())
            }
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to revoke lock lease");
                Err(e)
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(lock = %self.name, "Lock dropped without release, revoking in background");
        self.leases
            .close_session_in_background(self.session.clone(), "lock dropped");
    }
}

/// 可重入锁
///
/// 重入计数只在本进程内有效：同一句柄再次 `acquire()` 只增加计数，不访问存储；
/// 计数归零时才真正释放。其他进程始终在存储层竞争。
#[derive(Clone, Debug)]
pub struct ReentrantLock {
    inner: Arc<ReentrantInner>,
}

#[derive(Debug)]
struct ReentrantInner {
    lock: Lock,
    holders: Mutex<u32>,
}

impl ReentrantLock {
    pub(crate) fn new(lock: Lock) -> Self {
        Self {
            inner: Arc::new(ReentrantInner {
                lock,
                holders: Mutex::new(1),
            }),
        }
    }

    fn holders(&self) -> std::sync::MutexGuard<'_, u32> {
        self.inner
            .holders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 重入：计数加一
    pub fn acquire(&self) -> Result<()> {
        let mut holders = self.holders();
        if *holders == 0 || !self.inner.lock.is_held() {
            return Err(CoordError::lease_not_found(self.inner.lock.lease_id()));
        }
        *holders += 1;
        Ok(())
    }

    /// 计数减一，归零时释放底层锁
    pub async fn release(&self) -> Result<()> {
        let remaining = {
            let mut holders = self.holders();
            if *holders == 0 {
                return Ok(());
            }
            *holders -= 1;
            *holders
        };
        if remaining == 0 {
            self.inner.lock.release().await
        } else {
            debug!(lock = %self.inner.lock.key(), remaining, "Reentrant lock count decremented");
            Ok(())
        }
    }

    pub fn holder_count(&self) -> u32 {
        *self.holders()
    }

    pub fn is_held(&self) -> bool {
        self.holder_count() > 0 && self.inner.lock.is_held()
    }

    pub fn lock(&self) -> &Lock {
        &self.inner.lock
    }
}
