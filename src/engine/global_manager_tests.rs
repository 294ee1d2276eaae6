// Tests for the global instance manager
use crate::{
    engine::global_manager::{GlobalInstanceManager, InstanceFilter},
    models::{FactoryRequest, IsolationContext, ManagedInstance},
    RuntimeError,
};

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Test helpers
struct Echo {
    tenant_id: String,
    label: Option<String>,
}
impl ManagedInstance for Echo {}

async fn manager_with_echo(delay: Duration) -> (GlobalInstanceManager, Arc<AtomicUsize>) {
    let manager = GlobalInstanceManager::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager
        .register_typed_factory("echo", move |request: FactoryRequest| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok::<_, RuntimeError>(Echo {
                    tenant_id: request.context.tenant_id.clone(),
                    label: request.param("label"),
                })
            }
        })
        .await;
    (manager, calls)
}

#[tokio::test]
async fn test_reuse_while_owned() {
    let (manager, calls) = manager_with_echo(Duration::ZERO).await;
    let ctx = IsolationContext::new("t1", "a1");

    let first = manager.get_typed_instance::<Echo>("echo", &ctx).await.unwrap();
    let second = manager.get_typed_instance::<Echo>("echo", &ctx).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.tenant_id, "t1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let info = manager.get_info("echo:t1:a1").await.unwrap();
    assert_eq!(info.access_count, 2);
    assert!(info.is_active);
}

#[tokio::test]
async fn test_dropped_instance_is_recreated() {
    let (manager, calls) = manager_with_echo(Duration::ZERO).await;
    let ctx = IsolationContext::new("t1", "a1");

    let first = manager
        .get_isolated_instance("echo", &ctx, HashMap::new())
        .await
        .unwrap();
    assert!(manager.contains_live("echo:t1:a1").await);
    drop(first);
    assert!(!manager.contains_live("echo:t1:a1").await);

    // a stale entry is dropped by the lookup
    assert!(manager.get_cached("echo:t1:a1").await.is_none());
    assert!(manager.get_info("echo:t1:a1").await.is_none());

    let _again = manager
        .get_isolated_instance("echo", &ctx, HashMap::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(manager.get_info("echo:t1:a1").await.unwrap().access_count, 1);
}

#[tokio::test]
async fn test_missing_or_failing_factory() {
    let manager = GlobalInstanceManager::default();
    let ctx = IsolationContext::new("t1", "a1");

    assert!(manager
        .get_isolated_instance("unknown", &ctx, HashMap::new())
        .await
        .is_none());
    assert!(matches!(
        manager.acquire("unknown", &ctx, HashMap::new()).await,
        Err(RuntimeError::FactoryNotFound(_))
    ));

    manager
        .register_typed_factory("broken", |_request: FactoryRequest| async {
            Err::<Echo, _>(RuntimeError::Factory("no backend".into()))
        })
        .await;
    assert!(manager
        .get_isolated_instance("broken", &ctx, HashMap::new())
        .await
        .is_none());
    assert_eq!(manager.get_stats().await.total_instances, 0);

    assert!(manager.unregister_factory("broken").await);
    assert!(!manager.has_factory("broken").await);
}

#[tokio::test]
async fn test_failed_creations_release_their_gates() {
    let (manager, _calls) = manager_with_echo(Duration::ZERO).await;
    manager
        .register_typed_factory("broken", |_request: FactoryRequest| async {
            Err::<Echo, _>(RuntimeError::Factory("no backend".into()))
        })
        .await;

    for i in 0..200 {
        let ctx = IsolationContext::new(&format!("t{}", i), "a1");
        assert!(manager
            .get_isolated_instance("missing", &ctx, HashMap::new())
            .await
            .is_none());
        assert!(manager
            .get_isolated_instance("broken", &ctx, HashMap::new())
            .await
            .is_none());
    }
    assert_eq!(manager.creation_gate_count(), 0);
    assert_eq!(manager.get_stats().await.total_instances, 0);

    // a successful creation keeps its gate until the entry is released
    let ctx = IsolationContext::new("t1", "a1");
    let _held = manager.acquire("echo", &ctx, HashMap::new()).await.unwrap();
    assert_eq!(manager.creation_gate_count(), 1);
    manager.release("echo:t1:a1").await;
    assert_eq!(manager.creation_gate_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_create_once() {
    let (manager, calls) = manager_with_echo(Duration::from_millis(20)).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let ctx = IsolationContext::new("t1", "a1");
            manager.acquire("echo", &ctx, HashMap::new()).await
        }));
    }

    let mut acquired = Vec::new();
    for handle in handles {
        acquired.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(acquired.iter().filter(|a| a.created).count(), 1);
    let first = acquired[0].instance.clone();
    assert!(acquired
        .iter()
        .all(|a| Arc::ptr_eq(&a.instance, &first) && a.instance_id == "echo:t1:a1"));
}

#[tokio::test]
async fn test_scopes_and_params() {
    let (manager, calls) = manager_with_echo(Duration::ZERO).await;
    let agent = manager.create_isolation_context("t1", "a1", None, None);
    let chat = manager.create_isolation_context("t1", "a1", Some("qq"), Some("c1"));
    let platform = manager.create_isolation_context("t1", "a1", Some("qq"), Some(""));

    let params = HashMap::from([("label".to_string(), json!("support"))]);
    let agent_wide = manager.acquire("echo", &agent, params).await.unwrap();
    let chat_scoped = manager.acquire("echo", &chat, HashMap::new()).await.unwrap();
    let platform_scoped = manager.acquire("echo", &platform, HashMap::new()).await.unwrap();

    assert_eq!(agent_wide.instance_id, "echo:t1:a1");
    assert_eq!(chat_scoped.instance_id, "echo:t1:a1:c1");
    assert_eq!(platform_scoped.instance_id, "echo:t1:a1:qq");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let labelled = crate::models::downcast_instance::<Echo>(agent_wide.instance.clone()).unwrap();
    assert_eq!(labelled.label.as_deref(), Some("support"));

    let chats = manager
        .get_instance_info(&InstanceFilter::default().chat_stream("c1"))
        .await;
    assert_eq!(chats.len(), 1);

    let stats = manager.get_stats().await;
    assert_eq!(stats.total_instances, 3);
    assert_eq!(stats.active_instances, 3);
    assert_eq!(stats.tenants_count, 1);
    assert_eq!(stats.agents_count, 1);
    // "global" bucket plus the c1 bucket
    assert_eq!(stats.chats_count, 2);
}

#[tokio::test]
async fn test_tenant_queries_and_clear() {
    let (manager, _calls) = manager_with_echo(Duration::ZERO).await;
    manager
        .register_typed_factory("other", |_request: FactoryRequest| async {
            Ok::<_, RuntimeError>(Echo {
                tenant_id: String::new(),
                label: None,
            })
        })
        .await;

    let mut held = Vec::new();
    for (tenant, agent, kind) in [("t1", "a1", "echo"), ("t1", "a2", "echo"), ("t1", "a1", "other"), ("t2", "a1", "echo")] {
        let ctx = IsolationContext::new(tenant, agent);
        held.push(manager.get_isolated_instance(kind, &ctx, HashMap::new()).await.unwrap());
    }

    assert_eq!(manager.tenant_ids().await, vec!["t1", "t2"]);
    let grouped = manager.get_tenant_instances("t1").await;
    assert_eq!(grouped["echo"].len(), 2);
    assert_eq!(grouped["other"].len(), 1);

    let filtered = manager
        .get_instance_info(&InstanceFilter::default().tenant("t1").agent("a1").instance_type("echo"))
        .await;
    assert_eq!(filtered.len(), 1);

    assert_eq!(manager.clear_tenant_instances("t1", Some("echo")).await, 2);
    assert_eq!(manager.get_tenant_instances("t1").await.len(), 1);
    assert_eq!(manager.clear_tenant_instances("t1", None).await, 1);
    assert_eq!(manager.tenant_ids().await, vec!["t2"]);
}

#[tokio::test]
async fn test_release_forces_fresh_instance() {
    let (manager, calls) = manager_with_echo(Duration::ZERO).await;
    let ctx = IsolationContext::new("t1", "a1");

    let first = manager.get_isolated_instance("echo", &ctx, HashMap::new()).await.unwrap();
    let released = manager.release("echo:t1:a1").await.unwrap();
    assert!(!released.is_active);
    assert!(manager.release("echo:t1:a1").await.is_none());

    // still owned by `first`, but never served again
    let second = manager.get_isolated_instance("echo", &ctx, HashMap::new()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clear_expired_instances() {
    let (manager, _calls) = manager_with_echo(Duration::ZERO).await;
    let recent = IsolationContext::new("t1", "a1");
    let idle = IsolationContext::new("t1", "a2");
    let dropped = IsolationContext::new("t1", "a3");

    let _idle = manager.get_isolated_instance("echo", &idle, HashMap::new()).await.unwrap();
    drop(manager.get_isolated_instance("echo", &dropped, HashMap::new()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _recent = manager.get_isolated_instance("echo", &recent, HashMap::new()).await.unwrap();

    let removed = manager
        .clear_expired_instances(Some(chrono::Duration::milliseconds(20)))
        .await;
    assert_eq!(removed, 2);
    assert!(manager.contains_live("echo:t1:a1").await);
    assert!(manager.get_info("echo:t1:a2").await.is_none());

    // idempotent
    assert_eq!(
        manager
            .clear_expired_instances(Some(chrono::Duration::milliseconds(20)))
            .await,
        0
    );
    assert_eq!(manager.get_stats().await.cleanup_runs, 2);
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let (manager, _calls) = manager_with_echo(Duration::ZERO).await;
    manager.start().await;
    manager.start().await;

    let ctx = IsolationContext::new("t1", "a1");
    let _held = manager.get_isolated_instance("echo", &ctx, HashMap::new()).await.unwrap();
    manager.shutdown().await;

    assert_eq!(manager.get_stats().await.total_instances, 0);
    assert!(manager.tenant_ids().await.is_empty());
}
