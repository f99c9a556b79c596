//! 租约与会话管理
//!
//! 会话 = 一个存活的租约 + 后台续约任务 + 存活信号。锁和注册记录只引用会话的租约 ID，
//! 租约的生命周期完全由 `LeaseManager` 负责。

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordError, Result};
use crate::store::{KeepAliveStream, KvStore, LeaseId};
use crate::task::TaskScope;

/// 租约
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
    pub created_at: DateTime<Utc>,
}

/// 会话
pub struct Session {
    lease: Lease,
    logical_key: String,
    done: CancellationToken,
    closed: AtomicBool,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &self.lease)
            .field("logical_key", &self.logical_key)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Session {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease.id
    }

    pub fn logical_key(&self) -> &str {
        &self.logical_key
    }

    /// 续约仍在进行且未被关闭
    pub fn is_alive(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// 等待会话失去存活（续约流中断、租约过期、被关闭或管理器关闭）
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// 查询存储中租约的剩余 TTL（秒）
    pub async fn remaining_ttl(&self) -> Result<i64> {
        self.store.time_to_live(self.lease.id).await
    }
}

type SessionTable = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// 租约管理器
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    sessions: SessionTable,
    scope: TaskScope,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>, scope: TaskScope) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            scope,
        }
    }

    fn table_key(logical_key: &str, ttl_secs: i64) -> String {
        format!("{}:{}", logical_key, ttl_secs)
    }

    /// 创建会话；同一逻辑键 + TTL 下已有存活会话时直接复用
    pub async fn create_session(&self, logical_key: &str, ttl: Duration) -> Result<Arc<Session>> {
        if ttl < Duration::from_secs(1) {
            return Err(CoordError::validation("session ttl must be at least 1s"));
        }
        if self.scope.is_cancelled() {
            return Err(CoordError::Closed);
        }

        let ttl_secs = ttl.as_secs() as i64;
        let table_key = Self::table_key(logical_key, ttl_secs);

        if let Some(existing) = self.live_session(&table_key).await {
            debug!(logical_key, lease_id = existing.lease_id(), "Reusing live session");
            return Ok(existing);
        }

        // 授予与续约建立期间不持有会话表锁
        let lease_id = self.store.grant(ttl_secs).await?;
        let stream = match self.store.keep_alive(lease_id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.revoke_quietly(lease_id, "keep-alive setup failure").await;
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            lease: Lease {
                id: lease_id,
                ttl: Duration::from_secs(ttl_secs as u64),
                created_at: Utc::now(),
            },
            logical_key: logical_key.to_string(),
            done: self.scope.token().child_token(),
            closed: AtomicBool::new(false),
            store: self.store.clone(),
        });

        let mut sessions = self.sessions.lock().await;
        let winner = sessions.get(&table_key).filter(|s| s.is_alive()).cloned();
        if let Some(existing) = winner {
            drop(sessions);
            debug!(logical_key, lease_id = existing.lease_id(), "Lost session race, reusing winner");
            self.revoke_quietly(lease_id, "duplicate session").await;
            return Ok(existing);
        }
        sessions.insert(table_key.clone(), session.clone());
        drop(sessions);

        self.spawn_keep_alive(table_key, session.clone(), stream);
        info!(logical_key, lease_id, ttl_secs, "Session created");
        Ok(session)
    }

    async fn live_session(&self, table_key: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(table_key) {
            Some(existing) if existing.is_alive() => Some(existing.clone()),
            Some(_) => {
                sessions.remove(table_key);
                None
            }
            None => None,
        }
    }

    async fn revoke_quietly(&self, lease_id: LeaseId, reason: &'static str) {
        if let Err(e) = self.store.revoke(lease_id).await {
            warn!(lease_id, reason, error = %e, "Failed to revoke unused lease");
        }
    }

    fn spawn_keep_alive(&self, table_key: String, session: Arc<Session>, mut stream: KeepAliveStream) {
        let sessions = self.sessions.clone();
        self.scope.spawn("lease-keep-alive", async move {
            let lease_id = session.lease_id();
            loop {
                tokio::select! {
                    _ = session.done.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(ttl)) if ttl > 0 => {
                            debug!(lease_id, ttl, "Lease keep-alive");
                        }
                        Some(Ok(_)) => {
                            warn!(lease_id, "Lease expired in store");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(lease_id, error = %e, "Lease keep-alive stream failed");
                            break;
                        }
                        None => {
                            warn!(lease_id, "Lease keep-alive stream closed");
                            break;
                        }
                    },
                }
            }

            session.done.cancel();
            let mut table = sessions.lock().await;
            if table
                .get(&table_key)
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                table.remove(&table_key);
            }
        });
    }

    /// 关闭会话：停止续约并撤销租约（幂等）
    ///
    /// 撤销会立即删除该租约绑定的所有键；租约已不存在视为成功。
    pub async fn close_session(&self, session: &Arc<Session>) -> Result<()> {
        if session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        session.done.cancel();

        {
            let mut table = self.sessions.lock().await;
            let key = Self::table_key(&session.logical_key, session.lease.ttl.as_secs() as i64);
            if table
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                table.remove(&key);
            }
        }

        match self.store.revoke(session.lease_id()).await {
            Ok(()) => {
                info!(
                    logical_key = %session.logical_key,
                    lease_id = session.lease_id(),
                    "Session closed"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(lease_id = session.lease_id(), "Lease already gone on close");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 在后台关闭会话，供无法 await 的 `Drop` 路径使用
    ///
    /// 任务登记在管理器的作用域中，作用域关闭时会等待撤销完成。
    pub(crate) fn close_session_in_background(self: &Arc<Self>, session: Arc<Session>, reason: &'static str) {
        if session.closed.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let lease_id = session.lease_id();
        let spawned = self.scope.spawn_cleanup("lease-release", async move {
            if let Err(e) = manager.close_session(&session).await {
                warn!(lease_id, reason, error = %e, "Background session close failed");
            }
        });
        if !spawned {
            warn!(lease_id, reason, "No runtime to close session, lease will expire by ttl");
        }
    }

    /// 关闭全部会话，返回第一个错误（其余错误只记录日志）
    pub async fn close_all(&self) -> Result<()> {
        let sessions: Vec<Arc<Session>> = {
            let mut table = self.sessions.lock().await;
            table.drain().map(|(_, s)| s).collect()
        };

        let mut first_err = None;
        for session in sessions {
            if let Err(e) = self.close_session(&session).await {
                warn!(lease_id = session.lease_id(), error = %e, "Failed to revoke lease on shutdown");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// 当前登记的存活会话数量
    pub async fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.is_alive())
            .count()
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }
}
