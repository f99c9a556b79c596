//! 进程内存储实现
//!
//! 与 etcd 保持一致的关键语义：全局 revision、租约到期删除绑定键、
//! 带 prev_kv 的前缀 watch、按 revision 回放、范围比较事务。
//! 另外提供故障注入（不可用、watch 断开、续约暂停、压缩），便于测试重试与重连路径。

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Compare, CompareTarget, EventKind, KeepAliveStream, KeyValue, KvStore, LeaseId, RangeOptions,
    RangeResponse, Revision, Txn, TxnOp, TxnResponse, WatchEvent, WatchOptions, WatchResponse,
    WatchStream,
};
use crate::error::{CoordError, Result};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct MemLease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct MemWatcher {
    key: String,
    prefix: bool,
    tx: mpsc::UnboundedSender<Result<WatchResponse>>,
}

impl MemWatcher {
    fn matches(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Default)]
struct MemState {
    revision: Revision,
    compacted: Revision,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, MemLease>,
    next_lease: LeaseId,
    log: Vec<WatchEvent>,
    watchers: Vec<MemWatcher>,
    unavailable: bool,
    fail_next: usize,
    keep_alive_paused: bool,
}

impl MemState {
    /// 故障注入检查 + 过期租约清理
    fn check(&mut self) -> Result<()> {
        if self.unavailable {
            return Err(CoordError::connection("memory store unavailable"));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(CoordError::connection("injected transient failure"));
        }
        self.expire(Instant::now());
        Ok(())
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let rev = self.revision + 1;
        let mut events = Vec::new();
        for key in lease.keys {
            self.remove_key(&key, rev, &mut events);
        }
        self.commit(rev, events);
        true
    }

    fn remove_key(&mut self, key: &str, rev: Revision, events: &mut Vec<WatchEvent>) {
        if let Some(prev) = self.data.remove(key) {
            if prev.lease != 0 {
                if let Some(lease) = self.leases.get_mut(&prev.lease) {
                    lease.keys.remove(key);
                }
            }
            events.push(WatchEvent {
                kind: EventKind::Delete,
                kv: KeyValue {
                    key: key.to_string(),
                    value: Vec::new(),
                    create_revision: 0,
                    mod_revision: rev,
                    version: 0,
                    lease: 0,
                },
                prev_kv: Some(prev),
            });
        }
    }

    fn apply_put(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        rev: Revision,
        events: &mut Vec<WatchEvent>,
    ) {
        let lease = lease.unwrap_or(0);
        let prev = self.data.get(key).cloned();
        if let Some(prev) = &prev {
            if prev.lease != 0 && prev.lease != lease {
                if let Some(old) = self.leases.get_mut(&prev.lease) {
                    old.keys.remove(key);
                }
            }
        }
        if lease != 0 {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(rev),
            mod_revision: rev,
            version: prev.as_ref().map(|p| p.version).unwrap_or(0) + 1,
            lease,
        };
        self.data.insert(key.to_string(), kv.clone());
        events.push(WatchEvent {
            kind: EventKind::Put,
            kv,
            prev_kv: prev,
        });
    }

    fn apply_delete(
        &mut self,
        key: &str,
        prefix: bool,
        rev: Revision,
        events: &mut Vec<WatchEvent>,
    ) -> i64 {
        let keys: Vec<String> = if prefix {
            self.data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if self.data.contains_key(key) {
            vec![key.to_string()]
        } else {
            Vec::new()
        };
        for k in &keys {
            self.remove_key(k, rev, events);
        }
        keys.len() as i64
    }

    fn ensure_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if id != 0 && !self.leases.contains_key(&id) => {
                Err(CoordError::lease_not_found(id))
            }
            _ => Ok(()),
        }
    }

    fn compare(&self, compare: &Compare) -> bool {
        let matching: Vec<&KeyValue> = if compare.prefix {
            self.data
                .range(compare.key.clone()..)
                .take_while(|(k, _)| k.starts_with(&compare.key))
                .map(|(_, v)| v)
                .collect()
        } else {
            self.data.get(&compare.key).into_iter().collect()
        };

        let check = |kv: Option<&KeyValue>| match compare.target {
            CompareTarget::CreateRevision(rev) => kv.map(|kv| kv.create_revision).unwrap_or(0) == rev,
            CompareTarget::ModRevision(rev) => kv.map(|kv| kv.mod_revision).unwrap_or(0) == rev,
            CompareTarget::Version(version) => kv.map(|kv| kv.version).unwrap_or(0) == version,
        };

        if matching.is_empty() {
            check(None)
        } else {
            matching.into_iter().all(|kv| check(Some(kv)))
        }
    }

    /// 提交一个 revision 的全部事件并通知 watcher
    fn commit(&mut self, rev: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision = rev;
        self.watchers.retain(|watcher| {
            let matched: Vec<WatchEvent> = events
                .iter()
                .filter(|e| watcher.matches(&e.kv.key))
                .cloned()
                .collect();
            if matched.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchResponse {
                    events: matched,
                    revision: rev,
                    compact_revision: 0,
                    canceled: false,
                }))
                .is_ok()
        });
        self.log.extend(events);
    }
}

/// 进程内存储
pub struct MemoryStore {
    state: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    /// 创建存储；在 tokio 运行时中调用时会启动后台过期清理任务
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(MemState {
            next_lease: 0x1000,
            ..MemState::default()
        }));

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&state);
            handle.spawn(sweep_expired(weak));
        }

        Arc::new(Self { state })
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        lock_state(&self.state)
    }

    /// 当前 revision
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// 模拟存储不可达
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// 接下来的 `count` 次调用返回瞬时连接错误
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// 断开所有活跃的 watch 流
    pub fn break_watches(&self) {
        self.lock().watchers.clear();
    }

    /// 暂停续约（模拟进程假死或网络分区），租约将按 TTL 自然过期
    pub fn pause_keep_alives(&self, paused: bool) {
        self.lock().keep_alive_paused = paused;
    }

    /// 压缩 `revision` 之前的事件历史
    pub fn compact(&self, revision: Revision) {
        let mut state = self.lock();
        state.compacted = revision;
        state.log.retain(|e| e.kv.mod_revision >= revision);
    }

    /// 活跃租约数量
    pub fn lease_count(&self) -> usize {
        let mut state = self.lock();
        state.expire(Instant::now());
        state.leases.len()
    }
}

fn lock_state(state: &Mutex<MemState>) -> MutexGuard<'_, MemState> {
    // 持锁期间不会 panic，中毒时直接沿用内部数据
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sweep_expired(state: Weak<Mutex<MemState>>) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let Some(state) = state.upgrade() else {
            break;
        };
        lock_state(&state).expire(Instant::now());
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        let mut state = self.lock();
        state.check()?;

        let mut kvs: Vec<KeyValue> = if options.prefix {
            state
                .data
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, v)| v.clone())
                .collect()
        } else {
            state.data.get(key).cloned().into_iter().collect()
        };
        if options.descending {
            kvs.reverse();
        }
        if let Some(limit) = options.limit {
            kvs.truncate(limit);
        }

        Ok(RangeResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut state = self.lock();
        state.check()?;
        state.ensure_lease(lease)?;

        let rev = state.revision + 1;
        let mut events = Vec::new();
        state.apply_put(key, value, lease, rev, &mut events);
        state.commit(rev, events);
        Ok(rev)
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        let mut state = self.lock();
        state.check()?;

        let rev = state.revision + 1;
        let mut events = Vec::new();
        let deleted = state.apply_delete(key, prefix, rev, &mut events);
        state.commit(rev, events);
        Ok(deleted)
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(CoordError::validation("lease ttl must be positive"));
        }
        let mut state = self.lock();
        state.check()?;

        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            MemLease {
                ttl: ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ttl = {
            let mut state = self.lock();
            state.check()?;
            state
                .leases
                .get(&lease)
                .map(|l| l.ttl)
                .ok_or_else(|| CoordError::lease_not_found(lease))?
        };

        let interval = Duration::from_millis((ttl as u64 * 1000 / 3).max(10));
        let weak = Arc::downgrade(&self.state);
        let stream = futures::stream::unfold(
            (weak, true, false),
            move |(weak, first, done)| async move {
                if done {
                    return None;
                }
                if !first {
                    tokio::time::sleep(interval).await;
                }
                let state = weak.upgrade()?;
                let mut guard = lock_state(&state);
                if guard.unavailable {
                    drop(guard);
                    return Some((
                        Err(CoordError::connection("memory store unavailable")),
                        (weak, false, true),
                    ));
                }
                let now = Instant::now();
                guard.expire(now);
                let paused = guard.keep_alive_paused;
                let remaining = match guard.leases.get_mut(&lease) {
                    Some(l) if !paused => {
                        l.deadline = now + Duration::from_secs(l.ttl as u64);
                        l.ttl
                    }
                    // 暂停期间只报告剩余时间，不刷新截止时间
                    Some(l) => l.deadline.saturating_duration_since(now).as_secs().max(1) as i64,
                    None => 0,
                };
                drop(guard);
                Some((Ok(remaining), (weak, false, remaining <= 0)))
            },
        );
        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        state.check()?;
        if state.drop_lease(lease) {
            Ok(())
        } else {
            Err(CoordError::lease_not_found(lease))
        }
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64> {
        let mut state = self.lock();
        state.check()?;
        let now = Instant::now();
        state
            .leases
            .get(&lease)
            .map(|l| l.deadline.saturating_duration_since(now).as_secs().max(1) as i64)
            .ok_or_else(|| CoordError::lease_not_found(lease))
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let mut state = self.lock();
        state.check()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(start) = options.start_revision {
            if start > 0 && start < state.compacted {
                let _ = tx.send(Ok(WatchResponse {
                    events: Vec::new(),
                    revision: state.revision,
                    compact_revision: state.compacted,
                    canceled: true,
                }));
                return Ok(UnboundedReceiverStream::new(rx).boxed());
            }
        }

        let watcher = MemWatcher {
            key: key.to_string(),
            prefix: options.prefix,
            tx,
        };

        // 回放起始 revision 之后的历史事件，按 revision 分批
        if let Some(start) = options.start_revision {
            let mut batch: Vec<WatchEvent> = Vec::new();
            let mut batch_rev = 0;
            for event in state
                .log
                .iter()
                .filter(|e| e.kv.mod_revision >= start && watcher.matches(&e.kv.key))
            {
                if event.kv.mod_revision != batch_rev && !batch.is_empty() {
                    let _ = watcher.tx.send(Ok(WatchResponse {
                        events: std::mem::take(&mut batch),
                        revision: batch_rev,
                        compact_revision: 0,
                        canceled: false,
                    }));
                }
                batch_rev = event.kv.mod_revision;
                batch.push(event.clone());
            }
            if !batch.is_empty() {
                let _ = watcher.tx.send(Ok(WatchResponse {
                    events: batch,
                    revision: batch_rev,
                    compact_revision: 0,
                    canceled: false,
                }));
            }
        }

        state.watchers.push(watcher);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.lock();
        state.check()?;

        let succeeded = txn.compares.iter().all(|c| state.compare(c));
        let ops = if succeeded { &txn.success } else { &txn.failure };

        // 先校验，保证事务要么全部生效要么完全不生效
        for op in ops {
            if let TxnOp::Put { lease, .. } = op {
                state.ensure_lease(*lease)?;
            }
        }

        let rev = state.revision + 1;
        let mut events = Vec::new();
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    state.apply_put(key, value.clone(), *lease, rev, &mut events);
                }
                TxnOp::Delete { key, prefix } => {
                    state.apply_delete(key, *prefix, rev, &mut events);
                }
            }
        }
        state.commit(rev, events);

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
        })
    }

    async fn status(&self) -> Result<()> {
        self.lock().check()
    }
}
