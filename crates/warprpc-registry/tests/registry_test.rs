use std::sync::Arc;
use std::time::Duration;

use warprpc_common::config::CommonConfig;
use warprpc_common::ErrorKind;
use warprpc_registry::{
    Backend, CoordinatorConfig, CoordinatorServer, NodeTree, Registry, RegistryEntry, Role,
    ServiceUpdateEvent,
};

async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_register_then_query() {
    let registry = Registry::in_memory(Arc::new(NodeTree::new()));
    let entry = registry
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();

    let node_id = entry.node_id.clone().unwrap();
    assert!(node_id.starts_with("/warprpc/Echo/provider-127.0.0.1:9000-"));

    let providers = registry.query_providers("Echo").await.unwrap();
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].service_name, "Echo");
    assert_eq!(providers[0].role, Role::Provider);
    assert_eq!(providers[0].node_id.as_deref(), Some(node_id.as_str()));
    assert!(registry.query_consumers("Echo").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregister_twice_is_ok() {
    let registry = Registry::in_memory(Arc::new(NodeTree::new()));
    let entry = registry
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();

    registry.unregister(&entry).await.unwrap();
    registry.unregister(&entry).await.unwrap();
    assert!(registry.query_providers("Echo").await.unwrap().is_empty());

    // never registered at all
    let stranger = RegistryEntry::consumer("Other", "10.0.0.1", 0, "demo");
    registry.unregister(&stranger).await.unwrap();
}

#[tokio::test]
async fn test_query_unknown_service_is_empty() {
    let registry = Registry::in_memory(Arc::new(NodeTree::new()));
    assert!(registry.query_providers("Nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subscribe_sees_changes_from_other_process() {
    let tree = Arc::new(NodeTree::new());
    let consumer = Registry::in_memory(tree.clone());
    let provider = Registry::in_memory(tree);

    let initial = consumer.subscribe("Echo").await.unwrap();
    assert!(initial.entries.is_empty());
    let mut updates = consumer.updates();

    provider
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.service_name, "Echo");
    assert!(event.version > initial.version);
    assert_eq!(event.providers().count(), 1);
    assert_eq!(consumer.cache().providers("Echo").len(), 1);

    // provider going away shows up as well
    provider.close().await;
    wait_for(|| consumer.cache().providers("Echo").is_empty()).await;
}

#[tokio::test]
async fn test_query_reflects_applied_event_exactly() {
    let registry = Registry::in_memory(Arc::new(NodeTree::new()));
    let event = ServiceUpdateEvent {
        service_name: "Echo".to_string(),
        version: 7,
        entries: vec![
            RegistryEntry::provider("Echo", "10.0.0.1", 9001, "a"),
            RegistryEntry::provider("Echo", "10.0.0.2", 9002, "b"),
        ],
    };
    assert!(registry.apply_update(&event));

    let ports: Vec<u16> = registry
        .query_providers("Echo")
        .await
        .unwrap()
        .iter()
        .map(|e| e.port)
        .collect();
    assert_eq!(ports, vec![9001, 9002]);

    let stale = ServiceUpdateEvent {
        version: 6,
        entries: Vec::new(),
        ..event
    };
    assert!(!registry.apply_update(&stale));
    assert_eq!(registry.query_providers("Echo").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unsubscribe_drops_snapshot() {
    let registry = Registry::in_memory(Arc::new(NodeTree::new()));
    registry.subscribe("Echo").await.unwrap();
    assert!(registry.is_subscribed("Echo"));
    assert!(registry.unsubscribe("Echo"));
    assert!(!registry.is_subscribed("Echo"));
    assert!(registry.cache().snapshot("Echo").is_none());
    assert!(!registry.unsubscribe("Echo"));
}

#[tokio::test]
async fn test_session_loss_registers_owned_entries_again() {
    let tree = Arc::new(NodeTree::new());
    let provider = Registry::in_memory(tree.clone());
    let observer = Registry::in_memory(tree);

    let before = provider
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();
    provider.subscribe("Echo").await.unwrap();

    let Backend::Memory(memory) = provider.backend() else {
        panic!("expected a memory backend");
    };
    memory.expire_session();

    wait_for(|| {
        provider
            .cache()
            .owned("Echo", Role::Provider)
            .map(|e| e.node_id != before.node_id)
            .unwrap_or(false)
    })
    .await;

    let providers = observer.query_providers("Echo").await.unwrap();
    assert_eq!(providers.len(), 1);
    assert_ne!(providers[0].node_id, before.node_id);

    // the provider's own watch came back too
    wait_for(|| {
        provider
            .cache()
            .providers("Echo")
            .iter()
            .any(|e| e.node_id == providers[0].node_id)
    })
    .await;
}

#[tokio::test]
async fn test_close_unregisters_owned_entries() {
    let tree = Arc::new(NodeTree::new());
    let registry = Registry::in_memory(tree.clone());
    registry
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();
    registry
        .register(RegistryEntry::consumer("Echo", "127.0.0.1", 0, "demo"))
        .await
        .unwrap();

    registry.close().await;
    assert!(tree.children("/warprpc/Echo").unwrap().children.is_empty());

    let err = registry
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Registry);
}

#[tokio::test]
async fn test_start_against_coordinator() {
    let server = CoordinatorServer::bind(CoordinatorConfig::default().with_bind_addr("127.0.0.1:0"))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let token = server.shutdown_token();
    server.spawn();

    let config = CommonConfig::default().with_registry_addr(addr);
    let provider = Registry::start(&config).await.unwrap();
    let consumer = Registry::start(&config).await.unwrap();

    consumer.subscribe("Echo").await.unwrap();
    provider
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
        .await
        .unwrap();
    wait_for(|| consumer.cache().providers("Echo").len() == 1).await;

    provider.close().await;
    wait_for(|| consumer.cache().providers("Echo").is_empty()).await;

    consumer.close().await;
    token.cancel();
}

fn provider_ports(registry: &Registry, service: &str) -> Vec<u16> {
    registry
        .cache()
        .providers(service)
        .iter()
        .map(|e| e.port)
        .collect()
}

async fn bind_again(addr: &str) -> CoordinatorServer {
    for _ in 0..50 {
        match CoordinatorServer::bind(CoordinatorConfig::default().with_bind_addr(addr)).await {
            Ok(server) => return server,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("could not bind {} again", addr);
}

#[tokio::test]
async fn test_cache_follows_restarted_coordinator() {
    let first = CoordinatorServer::bind(CoordinatorConfig::default().with_bind_addr("127.0.0.1:0"))
        .await
        .unwrap();
    let addr = first.local_addr().unwrap().to_string();
    let first_token = first.shutdown_token();
    let first_task = first.spawn();

    let config = CommonConfig::default().with_registry_addr(addr.clone());
    let consumer = Registry::start(&config).await.unwrap();
    consumer.subscribe("Echo").await.unwrap();

    // Churn pushes the version far past where a fresh coordinator starts
    let provider = Registry::start(&config).await.unwrap();
    for port in 9000..=9010 {
        provider
            .register(RegistryEntry::provider("Echo", "127.0.0.1", port, "demo"))
            .await
            .unwrap();
    }
    wait_for(|| provider_ports(&consumer, "Echo") == vec![9010]).await;
    provider.close().await;
    wait_for(|| consumer.cache().providers("Echo").is_empty()).await;
    let before_restart = consumer.cache().snapshot("Echo").unwrap().version;
    assert!(before_restart > 10);

    first_token.cancel();
    first_task.await.unwrap().unwrap();

    let second = bind_again(&addr).await;
    let second_token = second.shutdown_token();
    second.spawn();

    let restarted = Registry::start(&config).await.unwrap();
    restarted
        .register(RegistryEntry::provider("Echo", "127.0.0.1", 9100, "demo"))
        .await
        .unwrap();

    wait_for(|| provider_ports(&consumer, "Echo") == vec![9100]).await;
    assert!(consumer.cache().snapshot("Echo").unwrap().version < before_restart);

    // and keeps following the new coordinator afterwards
    restarted.close().await;
    wait_for(|| consumer.cache().providers("Echo").is_empty()).await;

    consumer.close().await;
    second_token.cancel();
}

#[tokio::test]
async fn test_start_with_unreachable_backend() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = CommonConfig::default().with_registry_addr(addr);
    let err = Registry::start(&config).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Registry);
}
