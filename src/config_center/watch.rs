//! 配置变更订阅
//!
//! 投递语义为至多一次：流中断后从最后一个已投递事件的下一个 revision 续订；
//! 若该 revision 已被压缩，只能从当前时刻续订，中间的变更会丢失。

use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HISTORY_SEGMENT;
use super::types::{ChangeType, ConfigChange, ConfigEntry};
use crate::error::{CoordError, Result};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::store::{EventKind, KvStore, Revision, WatchEvent, WatchOptions, WatchStream};
use crate::watch::EventSender;

pub(super) struct ConfigWatcher {
    pub store: Arc<dyn KvStore>,
    /// 存储中的 watch 键或前缀
    pub watch_key: String,
    pub prefix: bool,
    /// 配置根路径 `{key_prefix}/config/`
    pub root: String,
    pub reconnect_attempts: usize,
}

impl ConfigWatcher {
    fn options(&self, resume: Option<Revision>) -> WatchOptions {
        let options = WatchOptions {
            prefix: self.prefix,
            start_revision: None,
        };
        match resume {
            Some(revision) => options.from_revision(revision + 1),
            None => options,
        }
    }

    pub async fn open(&self, resume: Option<Revision>) -> Result<WatchStream> {
        self.store.watch(&self.watch_key, self.options(resume)).await
    }

    /// 分发循环；`resume` 为已观察到的最后 revision
    pub async fn run(
        &self,
        mut sender: EventSender<ConfigChange>,
        mut stream: WatchStream,
        mut resume: Option<Revision>,
    ) {
        let token = sender.token().clone();
        loop {
            let broken = tokio::select! {
                _ = token.cancelled() => return,
                msg = stream.next() => match msg {
                    Some(Ok(resp)) if resp.compact_revision > 0 => {
                        warn!(
                            key = %self.watch_key,
                            compact_revision = resp.compact_revision,
                            "Watch revision compacted, resuming from current revision"
                        );
                        resume = None;
                        true
                    }
                    Some(Ok(resp)) if resp.canceled => true,
                    Some(Ok(resp)) => {
                        for event in &resp.events {
                            resume = Some(resume.map_or(event.kv.mod_revision, |r| r.max(event.kv.mod_revision)));
                            if let Some(change) = self.to_change(event)
                                && !sender.deliver(change).await
                            {
                                return;
                            }
                        }
                        false
                    }
                    Some(Err(e)) => {
                        warn!(key = %self.watch_key, error = %e, "Config watch stream failed");
                        true
                    }
                    None => true,
                },
            };

            if broken {
                match self.reconnect(&token, resume).await {
                    Some(next) => stream = next,
                    None => {
                        warn!(key = %self.watch_key, "Config watch closed after reconnect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }

    async fn reconnect(
        &self,
        token: &CancellationToken,
        resume: Option<Revision>,
    ) -> Option<WatchStream> {
        let backoff = ExponentialBackoffPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .with_jitter(0.1);

        for attempt in 1..=self.reconnect_attempts {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(backoff.backoff_duration(attempt)) => {}
            }
            match self.open(resume).await {
                Ok(stream) => {
                    info!(key = %self.watch_key, attempt, resume = ?resume, "Config watch reconnected");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(key = %self.watch_key, attempt, error = %e, "Config watch reconnect failed");
                }
            }
        }
        None
    }

    /// 转换为配置变更；历史键与无法解析的记录返回 `None`
    pub fn to_change(&self, event: &WatchEvent) -> Option<ConfigChange> {
        let key = event.kv.key.strip_prefix(&self.root)?;
        if key == HISTORY_SEGMENT || key.starts_with(&format!("{}/", HISTORY_SEGMENT)) {
            return None;
        }

        let decode = |value: &[u8]| -> Result<ConfigEntry> {
            serde_json::from_slice(value).map_err(CoordError::from)
        };
        let old_value = event
            .prev_kv
            .as_ref()
            .and_then(|kv| decode(&kv.value).ok());

        let (change_type, new_value) = match event.kind {
            EventKind::Put => {
                let entry = match decode(&event.kv.value) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(key = %event.kv.key, error = %e, "Skipping malformed config record");
                        return None;
                    }
                };
                let change_type = if event.is_create() {
                    ChangeType::Create
                } else {
                    ChangeType::Update
                };
                (change_type, Some(entry))
            }
            EventKind::Delete => (ChangeType::Delete, None),
        };

        debug!(key, change_type = ?change_type, revision = event.kv.mod_revision, "Config changed");
        Some(ConfigChange {
            change_type,
            key: key.to_string(),
            old_value,
            new_value,
            timestamp: Utc::now(),
        })
    }
}
