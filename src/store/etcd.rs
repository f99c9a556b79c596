//! etcd 存储实现

use async_trait::async_trait;
use etcd_client::{
    Client, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, SortOrder, SortTarget,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    Compare, CompareTarget, EventKind, KeepAliveStream, KeyValue, KvStore, LeaseId, RangeOptions,
    RangeResponse, Revision, Txn, TxnOp, TxnResponse, WatchEvent, WatchOptions, WatchResponse,
    WatchStream,
};
use crate::config::CoordinatorConfig;
use crate::error::{CoordError, Result};

/// etcd 存储
///
/// `Client` 内部基于共享的 gRPC channel，克隆开销很小；每次调用克隆一份，
/// 因此同一个 `EtcdStore` 可以被多个组件并发使用。
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// 连接 etcd
    pub async fn connect(config: &CoordinatorConfig) -> Result<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout());
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| CoordError::connection(format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> Revision {
    header.map(|h| h.revision()).unwrap_or_default()
}

fn convert_compare(compare: &Compare) -> etcd_client::Compare {
    let key = compare.key.clone();
    let cmp = match compare.target {
        CompareTarget::CreateRevision(rev) => {
            etcd_client::Compare::create_revision(key, CompareOp::Equal, rev)
        }
        CompareTarget::ModRevision(rev) => {
            etcd_client::Compare::mod_revision(key, CompareOp::Equal, rev)
        }
        CompareTarget::Version(version) => {
            etcd_client::Compare::version(key, CompareOp::Equal, version)
        }
    };
    if compare.prefix {
        cmp.with_prefix()
    } else {
        cmp
    }
}

fn convert_op(op: &TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id));
            etcd_client::TxnOp::put(key.clone(), value.clone(), options)
        }
        TxnOp::Delete { key, prefix } => {
            let options = prefix.then(|| DeleteOptions::new().with_prefix());
            etcd_client::TxnOp::delete(key.clone(), options)
        }
    }
}

fn convert_watch_response(resp: &etcd_client::WatchResponse) -> WatchResponse {
    let events = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = convert_kv(event.kv()?);
            let kind = match event.event_type() {
                EventType::Put => EventKind::Put,
                EventType::Delete => EventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                kv,
                prev_kv: event.prev_kv().map(convert_kv),
            })
        })
        .collect();

    WatchResponse {
        events,
        revision: header_revision(resp.header()),
        compact_revision: resp.compact_revision(),
        canceled: resp.canceled(),
    }
}

/// 续约流的内部状态
struct KeepAliveState {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    interval: Duration,
    first: bool,
    done: bool,
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse> {
        let mut client = self.client.clone();
        let mut opts = GetOptions::new();
        if options.prefix {
            opts = opts.with_prefix();
        }
        if options.descending {
            opts = opts.with_sort(SortTarget::Key, SortOrder::Descend);
        }
        if let Some(limit) = options.limit {
            opts = opts.with_limit(limit as i64);
        }

        let resp = client.get(key, Some(opts)).await?;
        Ok(RangeResponse {
            kvs: resp.kvs().iter().map(convert_kv).collect(),
            revision: header_revision(resp.header()),
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = client.put(key, value, options).await?;
        Ok(header_revision(resp.header()))
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        let mut client = self.client.clone();
        let options = prefix.then(|| DeleteOptions::new().with_prefix());
        let resp = client.delete(key, options).await?;
        Ok(resp.deleted())
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;

        let state = KeepAliveState {
            keeper,
            stream,
            interval: Duration::from_secs(1),
            first: true,
            done: false,
        };

        // etcd 只在收到请求时才回复续约响应，需要周期性地主动发送
        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            if !st.first {
                tokio::time::sleep(st.interval).await;
            }
            st.first = false;

            if let Err(e) = st.keeper.keep_alive().await {
                st.done = true;
                return Some((Err(CoordError::from(e)), st));
            }

            match st.stream.message().await {
                Ok(Some(resp)) => {
                    let ttl = resp.ttl();
                    if ttl > 0 {
                        st.interval = Duration::from_millis((ttl as u64 * 1000 / 3).max(200));
                    } else {
                        st.done = true;
                    }
                    Some((Ok(ttl), st))
                }
                Ok(None) => None,
                Err(e) => {
                    st.done = true;
                    Some((Err(CoordError::from(e)), st))
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<i64> {
        let mut client = self.client.clone();
        let resp = client.lease_time_to_live(lease, None).await?;
        if resp.ttl() <= 0 {
            return Err(CoordError::lease_not_found(lease));
        }
        Ok(resp.ttl())
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut opts = etcd_client::WatchOptions::new().with_prev_key();
        if options.prefix {
            opts = opts.with_prefix();
        }
        if let Some(revision) = options.start_revision {
            opts = opts.with_start_revision(revision);
        }

        let (watcher, stream) = client.watch(key, Some(opts)).await?;

        // watcher 必须与流一起存活，否则服务端会关闭 watch
        let stream = futures::stream::unfold(
            Some((watcher, stream)),
            |state| async move {
                let (watcher, mut stream) = state?;
                match stream.message().await {
                    Ok(Some(resp)) => {
                        let converted = convert_watch_response(&resp);
                        let next = if converted.canceled {
                            None
                        } else {
                            Some((watcher, stream))
                        };
                        Some((Ok(converted), next))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(CoordError::from(e)), None)),
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut client = self.client.clone();
        let request = etcd_client::Txn::new()
            .when(txn.compares.iter().map(convert_compare).collect::<Vec<_>>())
            .and_then(txn.success.iter().map(convert_op).collect::<Vec<_>>())
            .or_else(txn.failure.iter().map(convert_op).collect::<Vec<_>>());

        let resp = client.txn(request).await?;
        Ok(TxnResponse {
            succeeded: resp.succeeded(),
            revision: header_revision(resp.header()),
        })
    }

    async fn status(&self) -> Result<()> {
        let mut client = self.client.clone();
        let resp = client.status().await?;
        debug!(
            version = resp.version(),
            db_size = resp.db_size(),
            "etcd status ok"
        );
        Ok(())
    }
}
