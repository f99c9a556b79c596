//! etcd 集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_coordination_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

use flare_coordination::{ChangeType, Coordinator, CoordinatorConfig, HealthStatus, ServiceInstance};
use serde_json::json;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

/// 每个测试使用独立的键前缀，避免互相干扰
async fn open() -> Coordinator {
    let config = CoordinatorConfig::test()
        .with_endpoints(etcd_endpoints())
        .with_key_prefix(format!("/flare-test/{}", Uuid::new_v4()));
    Coordinator::open(config)
        .await
        .expect("etcd should be reachable")
}

#[tokio::test]
#[ignore]
async fn test_etcd_lock_exclusion() {
    let coord = open().await;
    let other = Coordinator::open(coord.options().clone()).await.unwrap();

    let lock = coord
        .lock()
        .acquire("job:42", Duration::from_secs(10))
        .await
        .unwrap();
    let err = other
        .lock()
        .try_acquire("job:42", Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    lock.release().await.unwrap();
    let taken = other
        .lock()
        .try_acquire("job:42", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(taken.ttl().await.unwrap() > Duration::ZERO);

    taken.release().await.unwrap();
    other.close().await.unwrap();
    coord.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_lock_released_when_coordinator_closes() {
    let holder = open().await;
    let waiter = Coordinator::open(holder.options().clone()).await.unwrap();

    let _lock = holder
        .lock()
        .try_acquire("leader", Duration::from_secs(5))
        .await
        .unwrap();

    let waiting = {
        let waiter = waiter.clone();
        tokio::spawn(async move {
            waiter
                .lock()
                .acquire_with_timeout("leader", Duration::from_secs(5), Duration::from_secs(10))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    holder.close().await.unwrap();

    let lock = waiting.await.unwrap().unwrap();
    assert!(lock.is_held());
    lock.release().await.unwrap();
    waiter.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_config_versions_and_watch() {
    let coord = open().await;
    let config = coord.config();
    let mut sub = config.watch("feature.flag").await.unwrap();

    assert_eq!(config.set("feature.flag", json!(true), 0).await.unwrap(), 1);
    assert_eq!(config.set("feature.flag", json!(false), 1).await.unwrap(), 2);
    assert!(
        config
            .set("feature.flag", json!(true), 1)
            .await
            .unwrap_err()
            .is_conflict()
    );

    let created = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(created.change_type, ChangeType::Create);
    let updated = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(updated.change_type, ChangeType::Update);
    assert_eq!(updated.new_value.unwrap().version, 2);

    let history = config.get_history("feature.flag", 0).await.unwrap();
    let versions: Vec<_> = history.iter().map(|v| v.version).collect();
    assert_eq!(versions, vec![2, 1]);

    config.delete("feature.flag", 2).await.unwrap();
    let deleted = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(deleted.change_type, ChangeType::Delete);
    assert!(config.get_history("feature.flag", 0).await.unwrap().is_empty());

    coord.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_registry_lifecycle() {
    let coord = open().await;
    let registry = coord.registry();
    let mut sub = registry.watch("api").await.unwrap();
    assert!(sub.recv().await.unwrap().is_empty());

    registry
        .register(ServiceInstance::new("api", "a1", "10.0.0.1:9000").with_version("1.2.0"))
        .await
        .unwrap();
    let snapshot = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 1);

    registry
        .update_health("api", "a1", HealthStatus::Unhealthy)
        .await
        .unwrap();
    assert!(registry.discover("api").await.unwrap().is_empty());
    let instance = registry.get_instance("api", "a1").await.unwrap();
    assert_eq!(instance.health, HealthStatus::Unhealthy);

    registry.deregister("api", "a1").await.unwrap();
    assert!(registry.get_instance("api", "a1").await.unwrap_err().is_not_found());

    coord.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_registration_expires_with_owner() {
    let owner = open().await;
    let observer = Coordinator::open(owner.options().clone()).await.unwrap();

    owner
        .registry()
        .register(ServiceInstance::new("worker", "w1", "10.0.0.5:7000"))
        .await
        .unwrap();
    assert_eq!(observer.registry().discover("worker").await.unwrap().len(), 1);

    owner.close().await.unwrap();
    assert!(observer.registry().discover("worker").await.unwrap().is_empty());

    observer.close().await.unwrap();
}
