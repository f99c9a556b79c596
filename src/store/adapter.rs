//! 带超时与重试的存储装饰器

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{
    KeepAliveStream, KvStore, LeaseId, RangeOptions, RangeResponse, Revision, Txn, TxnResponse,
    WatchOptions, WatchStream,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoordError, Result};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy, retry_with_policy};

/// 存储适配器
///
/// 所有存储 I/O 的唯一出入口：每次调用都加上请求超时，并对瞬时错误按指数退避重试。
/// 流式调用（watch、keep-alive）只对建立阶段重试，建立后的中断由上层处理。
pub struct StoreAdapter {
    inner: Arc<dyn KvStore>,
    policy: Arc<dyn RetryPolicy>,
    request_timeout: Duration,
}

impl StoreAdapter {
    pub fn new(
        inner: Arc<dyn KvStore>,
        policy: Arc<dyn RetryPolicy>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            policy,
            request_timeout,
        }
    }

    pub fn from_config(inner: Arc<dyn KvStore>, config: &CoordinatorConfig) -> Self {
        Self::new(
            inner,
            Arc::new(ExponentialBackoffPolicy::from_config(&config.retry)),
            config.request_timeout(),
        )
    }

    /// 健康探测
    pub async fn ping(&self) -> Result<()> {
        self.status().await
    }

    pub fn policy(&self) -> Arc<dyn RetryPolicy> {
        self.policy.clone()
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.request_timeout;
        retry_with_policy(self.policy.as_ref(), operation, || {
            let fut = f(self.inner.clone());
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(CoordError::timeout(format!(
                        "{} exceeded {:?}",
                        operation, timeout
                    ))),
                }
            }
        })
        .await
    }
}

#[async_trait]
impl KvStore for StoreAdapter {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        self.call("range", |store| {
            let key = key.to_string();
            async move { store.range(&key, options).await }
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        self.call("put", |store| {
            let key = key.to_string();
            let value = value.clone();
            async move { store.put(&key, value, lease).await }
        })
        .await
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        self.call("delete", |store| {
            let key = key.to_string();
            async move { store.delete(&key, prefix).await }
        })
        .await
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(CoordError::validation("lease ttl must be positive"));
        }
        self.call("grant", |store| async move { store.grant(ttl_secs).await })
            .await
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        self.call("keep_alive", |store| async move { store.keep_alive(lease).await })
            .await
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.call("revoke", |store| async move { store.revoke(lease).await })
            .await
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64> {
        self.call("time_to_live", |store| async move {
            store.time_to_live(lease).await
        })
        .await
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        self.call("watch", |store| {
            let key = key.to_string();
            async move { store.watch(&key, options).await }
        })
        .await
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.call("txn", |store| {
            let txn = txn.clone();
            async move { store.txn(txn).await }
        })
        .await
    }

    async fn status(&self) -> Result<()> {
        self.call("status", |store| async move { store.status().await })
            .await
    }
}
