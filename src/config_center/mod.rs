//! 配置中心
//!
//! 键布局：
//!
//! - 当前值：`{key_prefix}/config/{key}`
//! - 历史版本：`{key_prefix}/config/history/{key}/{version:020}`
//!
//! 每次写入都是一次比较-写入事务，条件为当前记录的 `mod_revision` 未变：
//!
//! - `expected_version == 0`：无条件写入，版本号为当前版本加一（冲突时自动重试）
//! - `expected_version > 0`：乐观并发，版本不一致时返回 `Conflict`，不产生任何写入
//!
//! 启用版本控制时，新版本在同一事务中写入历史；超过保留上限的旧版本由后台任务清理。

mod types;
mod watch;

pub use types::{ChangeType, ConfigChange, ConfigEntry, ConfigMeta, ConfigVersion};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConfigCenterConfig, CoordinatorConfig, WatchConfig};
use crate::error::{CoordError, ErrorCode, Result};
use crate::store::{Compare, KeyValue, KvStore, RangeOptions, Txn, TxnOp, escape_segment};
use crate::task::TaskScope;
use crate::watch::{Subscription, SubscriptionTable, subscription};
use watch::ConfigWatcher;

pub(crate) const HISTORY_SEGMENT: &str = "history";

const MAX_KEY_LEN: usize = 512;
const MAX_CAS_ATTEMPTS: usize = 16;

pub struct ConfigCenter {
    store: Arc<dyn KvStore>,
    config: ConfigCenterConfig,
    watch_config: WatchConfig,
    /// `{key_prefix}/config/`
    root: String,
    scope: TaskScope,
    subscriptions: Arc<SubscriptionTable>,
}

impl ConfigCenter {
    pub fn new(store: Arc<dyn KvStore>, config: &CoordinatorConfig, scope: TaskScope) -> Self {
        Self {
            store,
            config: config.config_center.clone(),
            watch_config: config.watch.clone(),
            root: format!("{}/config/", config.key_prefix),
            scope,
            subscriptions: Arc::new(SubscriptionTable::default()),
        }
    }

    fn config_key(&self, key: &str) -> String {
        format!("{}{}", self.root, key)
    }

    /// 单个键的历史前缀；键经过转义后不含 '/'，嵌套键的历史不会落入父键的前缀
    fn history_prefix(&self, key: &str) -> String {
        format!("{}{}/{}/", self.root, HISTORY_SEGMENT, escape_segment(key))
    }

    fn history_key(&self, key: &str, version: i64) -> String {
        format!("{}{:020}", self.history_prefix(key), version)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.scope.is_cancelled() {
            return Err(CoordError::Closed);
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<ConfigEntry> {
        validate_key(key)?;
        let kv = self.load(key).await?.ok_or_else(|| CoordError::key_not_found(key))?;
        decode_entry(&kv)
    }

    /// 读取并反序列化为具体类型
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let entry = self.get(key).await?;
        Ok(serde_json::from_value(entry.value)?)
    }

    pub async fn get_version(&self, key: &str) -> Result<i64> {
        self.get(key).await.map(|entry| entry.version)
    }

    /// 写入配置，返回写入后的版本号
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: i64,
    ) -> Result<i64> {
        self.set_with_meta(key, value, expected_version, ConfigMeta::default())
            .await
    }

    /// 序列化后写入
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected_version: i64,
    ) -> Result<i64> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, expected_version).await
    }

    /// 写入配置并记录作者与备注
    pub async fn set_with_meta(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: i64,
        meta: ConfigMeta,
    ) -> Result<i64> {
        validate_key(key)?;
        if expected_version < 0 {
            return Err(CoordError::validation("expected_version must not be negative"));
        }
        let size = serde_json::to_vec(&value)?.len();
        if size > self.config.max_value_bytes {
            return Err(CoordError::validation(format!(
                "config value for {} is {} bytes, limit is {}",
                key, size, self.config.max_value_bytes
            )));
        }
        self.ensure_open()?;

        let store_key = self.config_key(key);
        let metadata = meta.into_metadata();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.load(key).await? {
                Some(kv) => Some((decode_entry(&kv)?, kv.mod_revision)),
                None => None,
            };
            let current_version = current.as_ref().map_or(0, |(entry, _)| entry.version);
            if expected_version > 0 && current_version != expected_version {
                return Err(CoordError::version_conflict(
                    key,
                    expected_version,
                    current_version,
                ));
            }

            let now = Utc::now();
            let entry = ConfigEntry {
                key: key.to_string(),
                value: value.clone(),
                version: current_version + 1,
                created_at: current.as_ref().map_or(now, |(entry, _)| entry.created_at),
                updated_at: now,
                metadata: metadata.clone(),
            };

            let guard = match &current {
                Some((_, mod_revision)) => Compare::mod_revision(store_key.clone(), *mod_revision),
                None => Compare::absent(store_key.clone()),
            };
            let mut ops = vec![TxnOp::put(
                store_key.clone(),
                serde_json::to_vec(&entry)?,
                None,
            )];
            if self.config.enable_versioning {
                ops.push(TxnOp::put(
                    self.history_key(key, entry.version),
                    serde_json::to_vec(&ConfigVersion::from(&entry))?,
                    None,
                ));
            }

            let resp = self.store.txn(Txn::new().when([guard]).and_then(ops)).await?;
            if resp.succeeded {
                info!(
                    key,
                    version = entry.version,
                    value_preview = %preview(&entry.value),
                    "Config set"
                );
                if self.config.enable_versioning {
                    self.schedule_prune(key);
                }
                return Ok(entry.version);
            }

            if expected_version > 0 {
                let actual = self.get_version(key).await.unwrap_or(0);
                return Err(CoordError::version_conflict(key, expected_version, actual));
            }
            debug!(key, "Concurrent config write, retrying");
        }

        Err(CoordError::Conflict {
            code: ErrorCode::VersionConflict,
            reason: format!("too much contention writing config {}", key),
        })
    }

    /// 删除配置及其全部历史
    pub async fn delete(&self, key: &str, expected_version: i64) -> Result<()> {
        validate_key(key)?;
        if expected_version < 0 {
            return Err(CoordError::validation("expected_version must not be negative"));
        }
        self.ensure_open()?;

        let store_key = self.config_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let kv = self
                .load(key)
                .await?
                .ok_or_else(|| CoordError::key_not_found(key))?;
            let current = decode_entry(&kv)?;
            if expected_version > 0 && current.version != expected_version {
                return Err(CoordError::version_conflict(
                    key,
                    expected_version,
                    current.version,
                ));
            }

            let txn = Txn::new()
                .when([Compare::mod_revision(store_key.clone(), kv.mod_revision)])
                .and_then([
                    TxnOp::delete(store_key.clone()),
                    TxnOp::delete_prefix(self.history_prefix(key)),
                ]);
            if self.store.txn(txn).await?.succeeded {
                info!(key, version = current.version, "Config deleted");
                return Ok(());
            }
            debug!(key, "Concurrent config write during delete, retrying");
        }

        Err(CoordError::Conflict {
            code: ErrorCode::VersionConflict,
            reason: format!("too much contention deleting config {}", key),
        })
    }

    /// 历史版本，新版本在前；`limit == 0` 表示按保留上限返回
    pub async fn get_history(&self, key: &str, limit: usize) -> Result<Vec<ConfigVersion>> {
        validate_key(key)?;
        if !self.config.enable_versioning {
            return Ok(Vec::new());
        }

        let max = self.config.max_version_history;
        let limit = if limit == 0 { max } else { limit.min(max) };
        let resp = self
            .store
            .range(
                &self.history_prefix(key),
                RangeOptions::prefix().descending().limit(limit),
            )
            .await?;

        let mut versions = Vec::with_capacity(resp.kvs.len());
        for kv in &resp.kvs {
            match serde_json::from_slice::<ConfigVersion>(&kv.value) {
                Ok(version) => versions.push(version),
                Err(e) => warn!(key = %kv.key, error = %e, "Skipping malformed history record"),
            }
        }
        Ok(versions)
    }

    /// 前缀下的全部配置键（不含历史）
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        validate_prefix(prefix)?;
        let resp = self
            .store
            .range(&self.config_key(prefix), RangeOptions::prefix())
            .await?;
        Ok(resp
            .kvs
            .iter()
            .filter_map(|kv| kv.key.strip_prefix(&self.root))
            .filter(|key| !is_history_key(key))
            .map(str::to_string)
            .collect())
    }

    /// 前缀下的全部配置
    pub async fn get_all(&self, prefix: &str) -> Result<HashMap<String, ConfigEntry>> {
        validate_prefix(prefix)?;
        let resp = self
            .store
            .range(&self.config_key(prefix), RangeOptions::prefix())
            .await?;
        let mut entries = HashMap::new();
        for kv in &resp.kvs {
            let Some(key) = kv.key.strip_prefix(&self.root) else {
                continue;
            };
            if is_history_key(key) {
                continue;
            }
            entries.insert(key.to_string(), decode_entry(kv)?);
        }
        Ok(entries)
    }

    /// 订阅单个配置键的变更
    pub async fn watch(&self, key: &str) -> Result<Subscription<ConfigChange>> {
        validate_key(key)?;
        self.subscribe(self.config_key(key), false).await
    }

    /// 订阅前缀下的变更；空前缀表示全部配置
    pub async fn watch_prefix(&self, prefix: &str) -> Result<Subscription<ConfigChange>> {
        validate_prefix(prefix)?;
        self.subscribe(self.config_key(prefix), true).await
    }

    async fn subscribe(&self, watch_key: String, prefix: bool) -> Result<Subscription<ConfigChange>> {
        self.ensure_open()?;

        let watcher = ConfigWatcher {
            store: self.store.clone(),
            watch_key,
            prefix,
            root: self.root.clone(),
            reconnect_attempts: self.watch_config.reconnect_attempts,
        };

        // 以订阅时刻的 revision 为起点，后续重连都从这里之后续订
        let revision = self
            .store
            .range(&watcher.watch_key, RangeOptions::default().limit(1))
            .await?
            .revision;
        let stream = watcher.open(Some(revision)).await?;

        let (sender, sub) = subscription(&self.watch_config, self.scope.token(), &watcher.watch_key);
        let id = self
            .subscriptions
            .insert(&watcher.watch_key, sender.token().clone());
        let subscriptions = self.subscriptions.clone();

        debug!(key = %watcher.watch_key, prefix, revision, "Config watch started");
        self.scope.spawn("config-watch", async move {
            watcher.run(sender, stream, Some(revision)).await;
            subscriptions.remove(id);
        });
        Ok(sub)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn shutdown(&self) {
        self.subscriptions.cancel_all();
    }

    async fn load(&self, key: &str) -> Result<Option<KeyValue>> {
        self.store.get(&self.config_key(key)).await
    }

    /// 后台清理超出保留上限的历史版本
    fn schedule_prune(&self, key: &str) {
        let store = self.store.clone();
        let prefix = self.history_prefix(key);
        let max = self.config.max_version_history;
        let key = key.to_string();

        self.scope.spawn("config-history-prune", async move {
            let resp = match store
                .range(&prefix, RangeOptions::prefix().descending())
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to scan config history");
                    return;
                }
            };
            if resp.kvs.len() <= max {
                return;
            }

            let stale = &resp.kvs[max..];
            for kv in stale {
                if let Err(e) = store.delete(&kv.key, false).await {
                    warn!(history_key = %kv.key, error = %e, "Failed to prune config history");
                    return;
                }
            }
            info!(key = %key, pruned = stale.len(), "Config history pruned");
        });
    }
}

fn decode_entry(kv: &KeyValue) -> Result<ConfigEntry> {
    Ok(serde_json::from_slice(&kv.value)?)
}

fn is_history_key(key: &str) -> bool {
    key == HISTORY_SEGMENT || key.starts_with(&format!("{}/", HISTORY_SEGMENT))
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CoordError::validation("config key cannot be empty"));
    }
    validate_prefix(key)
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_KEY_LEN {
        return Err(CoordError::validation(format!(
            "config key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    if prefix.starts_with('/') {
        return Err(CoordError::validation("config key must not start with '/'"));
    }
    if is_history_key(prefix) {
        return Err(CoordError::validation(format!(
            "config keys under '{}/' are reserved",
            HISTORY_SEGMENT
        )));
    }
    Ok(())
}

/// 日志用的值预览
fn preview(value: &serde_json::Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= 50 {
        return text;
    }
    let head: String = text.chars().take(47).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        scope: TaskScope,
        center: ConfigCenter,
    }

    fn fixture_with(config: CoordinatorConfig) -> Fixture {
        let store = MemoryStore::new();
        let scope = TaskScope::new();
        let center = ConfigCenter::new(store.clone(), &config, scope.clone());
        Fixture {
            store,
            scope,
            center,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinatorConfig::test().with_key_prefix("/t"))
    }

    #[tokio::test]
    async fn test_versioned_set_and_stale_write() {
        let fx = fixture();
        let c = &fx.center;
        assert_eq!(c.set("feature.flag", json!(true), 0).await.unwrap(), 1);
        assert_eq!(c.set("feature.flag", json!(false), 1).await.unwrap(), 2);

        let err = c.set("feature.flag", json!(true), 1).await.unwrap_err();
        assert!(err.is_conflict());

        let entry = c.get("feature.flag").await.unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.value, json!(false));
        assert_eq!(c.get_version("feature.flag").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expected_version_on_missing_key_conflicts() {
        let fx = fixture();
        let err = fx.center.set("absent", json!(1), 3).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(fx.center.get("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_versions_are_strictly_increasing() {
        let fx = fixture();
        let mut last = 0;
        for i in 0..5 {
            let version = fx.center.set("counter", json!(i), 0).await.unwrap();
            assert!(version > last);
            last = version;
        }
        let entry = fx.center.get("counter").await.unwrap();
        assert!(entry.created_at <= entry.updated_at);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_limited() {
        let fx = fixture();
        for i in 1..=4 {
            fx.center
                .set_with_meta(
                    "db.pool",
                    json!(i * 10),
                    0,
                    ConfigMeta::new().with_author("ops").with_comment(format!("step {i}")),
                )
                .await
                .unwrap();
        }

        let history = fx.center.get_history("db.pool", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 4);
        assert_eq!(history[1].version, 3);
        assert_eq!(history[0].author.as_deref(), Some("ops"));
        assert_eq!(history[1].comment.as_deref(), Some("step 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_pruned_to_bound() {
        let mut config = CoordinatorConfig::test().with_key_prefix("/t");
        config.config_center.max_version_history = 3;
        let fx = fixture_with(config);

        for i in 0..12 {
            fx.center.set("k", json!(i), 0).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let raw = fx
            .store
            .range("/t/config/history/k/", RangeOptions::prefix())
            .await
            .unwrap();
        assert_eq!(raw.kvs.len(), 3);
        let history = fx.center.get_history("k", 0).await.unwrap();
        let versions: Vec<i64> = history.iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![12, 11, 10]);
    }

    #[tokio::test]
    async fn test_versioning_disabled_writes_no_history() {
        let mut config = CoordinatorConfig::test().with_key_prefix("/t");
        config.config_center.enable_versioning = false;
        let fx = fixture_with(config);
        fx.center.set("k", json!("v"), 0).await.unwrap();
        fx.center.set("k", json!("w"), 0).await.unwrap();
        assert!(fx.center.get_history("k", 10).await.unwrap().is_empty());
        assert_eq!(fx.center.get_version("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_checks_version_and_cleans_history() {
        let fx = fixture();
        fx.center.set("k", json!(1), 0).await.unwrap();
        fx.center.set("k", json!(2), 0).await.unwrap();

        assert!(fx.center.delete("k", 1).await.unwrap_err().is_conflict());
        fx.center.delete("k", 2).await.unwrap();
        assert!(fx.center.get("k").await.unwrap_err().is_not_found());

        let raw = fx
            .store
            .range("/t/config/history/k/", RangeOptions::prefix())
            .await
            .unwrap();
        assert!(raw.kvs.is_empty());
        assert!(fx.center.delete("k", 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_nested_keys_keep_separate_history() {
        let fx = fixture();
        fx.center.set("db", json!("a"), 0).await.unwrap();
        for host in ["h1", "h2", "h3"] {
            fx.center.set("db/host", json!(host), 0).await.unwrap();
        }

        let parent: Vec<_> = fx
            .center
            .get_history("db", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|v| (v.version, v.value))
            .collect();
        assert_eq!(parent, vec![(1, json!("a"))]);

        fx.center.delete("db", 0).await.unwrap();
        let child = fx.center.get_history("db/host", 0).await.unwrap();
        assert_eq!(child.len(), 3);
        assert_eq!(child[0].value, json!("h3"));
        assert_eq!(fx.center.get("db/host").await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let mut config = CoordinatorConfig::test().with_key_prefix("/t");
        config.config_center.max_value_bytes = 16;
        let fx = fixture_with(config);
        let before = fx.store.revision();

        assert!(matches!(
            fx.center.set("", json!(1), 0).await,
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            fx.center.set("history/x", json!(1), 0).await,
            Err(CoordError::Validation(_))
        ));
        assert!(matches!(
            fx.center.set("big", json!("x".repeat(64)), 0).await,
            Err(CoordError::Validation(_))
        ));
        assert_eq!(fx.store.revision(), before);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Pool {
        size: u32,
        timeout_ms: u64,
    }

    #[tokio::test]
    async fn test_typed_helpers_and_listing() {
        let fx = fixture();
        let pool = Pool {
            size: 8,
            timeout_ms: 250,
        };
        fx.center.set_as("db/pool", &pool, 0).await.unwrap();
        fx.center.set("db/url", json!("postgres://db"), 0).await.unwrap();
        fx.center.set("cache/ttl", json!(60), 0).await.unwrap();

        let loaded: Pool = fx.center.get_as("db/pool").await.unwrap();
        assert_eq!(loaded, pool);

        let mut keys = fx.center.list("db/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["db/pool".to_string(), "db/url".to_string()]);

        let all = fx.center.list("").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(fx.center.get_all("cache/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_reports_create_update_delete() {
        let fx = fixture();
        let mut sub = fx.center.watch("feature.flag").await.unwrap();

        fx.center.set("feature.flag", json!(true), 0).await.unwrap();
        fx.center.set("feature.flag", json!(false), 1).await.unwrap();
        fx.center.delete("feature.flag", 0).await.unwrap();

        let created = sub.recv().await.unwrap();
        assert_eq!(created.change_type, ChangeType::Create);
        assert_eq!(created.key, "feature.flag");
        assert_eq!(created.new_value.unwrap().value, json!(true));

        let updated = sub.recv().await.unwrap();
        assert_eq!(updated.change_type, ChangeType::Update);
        assert_eq!(updated.old_value.unwrap().version, 1);
        assert_eq!(updated.new_value.unwrap().version, 2);

        let deleted = sub.recv().await.unwrap();
        assert_eq!(deleted.change_type, ChangeType::Delete);
        assert!(deleted.new_value.is_none());
    }

    #[tokio::test]
    async fn test_watch_prefix_skips_history() {
        let fx = fixture();
        let mut sub = fx.center.watch_prefix("").await.unwrap();

        fx.center.set("a", json!(1), 0).await.unwrap();
        fx.center.set("b", json!(2), 0).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().key, "a");
        assert_eq!(sub.recv().await.unwrap().key, "b");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_resumes_without_gaps_after_break() {
        let fx = fixture();
        let mut sub = fx.center.watch_prefix("svc/").await.unwrap();

        fx.center.set("svc/a", json!(1), 0).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().key, "svc/a");

        fx.store.break_watches();
        fx.center.set("svc/b", json!(2), 0).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.key, "svc/b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_skips_compacted_gap_and_continues_live() {
        let fx = fixture();
        let mut sub = fx.center.watch_prefix("svc/").await.unwrap();

        fx.center.set("svc/a", json!(1), 0).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().key, "svc/a");

        // 断流期间的变更被压缩，续订只能从当前 revision 开始
        fx.store.break_watches();
        fx.center.set("svc/b", json!(2), 0).await.unwrap();
        fx.center.set("svc/c", json!(3), 0).await.unwrap();
        fx.store.compact(fx.store.revision());

        tokio::time::sleep(Duration::from_secs(10)).await;
        fx.center.set("svc/d", json!(4), 0).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.key, "svc/d");
        assert_eq!(change.change_type, ChangeType::Create);
        assert_eq!(fx.center.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_closes_when_store_is_gone() {
        let fx = fixture();
        let mut sub = fx.center.watch("k").await.unwrap();
        fx.store.set_unavailable(true);
        fx.store.break_watches();

        let end = tokio::time::timeout(Duration::from_secs(60), sub.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert_eq!(fx.center.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_center_rejects_writes() {
        let fx = fixture();
        fx.center.shutdown();
        fx.scope.shutdown().await;
        assert!(matches!(
            fx.center.set("k", json!(1), 0).await,
            Err(CoordError::Closed)
        ));
    }
}
