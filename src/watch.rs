//! 订阅通道与订阅表
//!
//! 每个订阅都有独立的有界通道和独立的分发任务，订阅之间互不阻塞。
//! 通道满时的行为由 [`OverflowPolicy`] 决定：
//!
//! - `Block`：分发任务等待消费者腾出空间（投递或阻塞，只影响该订阅本身）
//! - `DropNewest`：丢弃当前事件并记录告警（投递或丢弃）

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WatchConfig;

/// 通道满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropNewest,
}

/// 分发任务持有的发送端
pub(crate) struct EventSender<T> {
    tx: mpsc::Sender<T>,
    policy: OverflowPolicy,
    token: CancellationToken,
    target: String,
    dropped: u64,
}

impl<T> EventSender<T> {
    /// 投递一个事件；返回 false 表示订阅已结束（消费者离开或被取消）
    pub async fn deliver(&mut self, item: T) -> bool {
        match self.policy {
            OverflowPolicy::Block => tokio::select! {
                res = self.tx.send(item) => res.is_ok(),
                _ = self.token.cancelled() => false,
            },
            OverflowPolicy::DropNewest => match self.tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    warn!(
                        target_key = %self.target,
                        dropped = self.dropped,
                        "Watch subscriber is lagging, event dropped"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.token.is_cancelled()
    }
}

/// 订阅句柄
///
/// 实现 `Stream`；丢弃句柄或调用 `cancel()` 会停止对应的分发任务。
/// 通道关闭（`recv` 返回 `None`）表示订阅已终止，调用方需要重新订阅。
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 创建订阅通道，`parent` 取消时订阅一并取消
pub(crate) fn subscription<T>(
    config: &WatchConfig,
    parent: &CancellationToken,
    target: impl Into<String>,
) -> (EventSender<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
    let token = parent.child_token();
    (
        EventSender {
            tx,
            policy: config.overflow,
            token: token.clone(),
            target: target.into(),
            dropped: 0,
        },
        Subscription { rx, token },
    )
}

/// 活跃订阅表（互斥保护）
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, (String, CancellationToken)>>,
}

impl SubscriptionTable {
    pub fn insert(&self, target: &str, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, (target.to_string(), token));
        id
    }

    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.lock().drain() {
            token.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, (String, CancellationToken)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
