// Tests for the instance manager facade
use crate::{
    api::types::{InstanceRequest, QuotaSpec},
    api::InstanceManagerApi,
    models::{
        Cleanup, FactoryRequest, HealthStatus, InstanceState, ManagedInstance, QuotaType,
        ResourceType,
    },
    Result, RuntimeError,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// Test helpers
struct Session {
    agent_id: String,
    closed: AtomicBool,
}

#[async_trait]
impl Cleanup for Session {
    async fn cleanup(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ManagedInstance for Session {
    fn as_cleanup(&self) -> Option<&dyn Cleanup> {
        Some(self)
    }
}

async fn api_with_sessions() -> (InstanceManagerApi, Arc<AtomicUsize>) {
    let api = InstanceManagerApi::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    api.global_manager()
        .register_typed_factory("session", move |request: FactoryRequest| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RuntimeError>(Session {
                    agent_id: request.context.agent_id.clone(),
                    closed: AtomicBool::new(false),
                })
            }
        })
        .await;
    (api, calls)
}

async fn instances_used(api: &InstanceManagerApi, tenant_id: &str) -> f64 {
    api.resource_manager()
        .get_usage(tenant_id, Some(ResourceType::Instances))
        .await[&ResourceType::Instances]
}

#[tokio::test]
async fn test_get_reuses_and_tracks() {
    let (api, calls) = api_with_sessions().await;

    let first = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    let second = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    let third = api
        .get_typed_instance::<Session>(&InstanceRequest::new("session", "t1", "a1"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(third.agent_id, "a1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let info = api.global_manager().get_info("session:t1:a1").await.unwrap();
    assert_eq!(info.access_count, 3);
    assert_eq!(
        api.lifecycle_manager().get_instance_state("session:t1:a1").await,
        Some(InstanceState::Active)
    );
    assert!(api.monitoring().is_monitored("session:t1:a1").await);
    assert_eq!(instances_used(&api, "t1").await, 1.0);
}

#[tokio::test]
async fn test_lookup_only_never_creates() {
    let (api, calls) = api_with_sessions().await;
    let request = InstanceRequest::new("session", "t1", "a1").lookup_only();

    assert!(api.get_instance(&request).await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let _held = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    assert!(api.get_instance(&request).await.is_some());
}

#[tokio::test]
async fn test_clear_then_get_creates_fresh_instance() {
    let (api, calls) = api_with_sessions().await;

    let first = api
        .get_typed_instance::<Session>(&InstanceRequest::new("session", "t1", "a1"))
        .await
        .unwrap();
    let cleared = api.clear_tenant_instances("t1", None, true).await;
    assert_eq!(cleared.total_count, 1);
    assert_eq!(cleared.success_count, 1);
    assert!(first.closed.load(Ordering::SeqCst));
    assert!(!api.monitoring().is_monitored("session:t1:a1").await);

    let second = api
        .get_typed_instance::<Session>(&InstanceRequest::new("session", "t1", "a1"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        api.global_manager().get_info("session:t1:a1").await.unwrap().access_count,
        1
    );
}

#[tokio::test]
async fn test_instance_quota_refuses_creation() {
    let (api, calls) = api_with_sessions().await;
    let quotas = HashMap::from([(
        "instances".to_string(),
        QuotaSpec::new(QuotaType::HardLimit, 1.0),
    )]);
    assert!(api.setup_tenant_quotas("t1", quotas).await);

    let _held = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    assert!(api.get_isolated_instance("session", "t1", "a2").await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // other tenants keep the default allowance
    assert!(api.get_isolated_instance("session", "t2", "a2").await.is_some());

    let report = api.check_resource_availability("t1", "instances", 1.0).await;
    assert!(!report.available);
    assert_eq!(report.remaining, Some(0.0));
    assert!(report.error.is_none());
}

#[tokio::test]
async fn test_partial_clear_gives_quota_back() {
    let (api, _calls) = api_with_sessions().await;
    api.global_manager()
        .register_typed_factory("notes", |_request: FactoryRequest| async {
            Ok::<_, RuntimeError>(Session {
                agent_id: String::new(),
                closed: AtomicBool::new(false),
            })
        })
        .await;

    let _session = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    let _notes = api.get_isolated_instance("notes", "t1", "a1").await.unwrap();
    assert_eq!(instances_used(&api, "t1").await, 2.0);

    // without force, ACTIVE instances are deactivated before cleanup
    let cleared = api.clear_tenant_instances("t1", Some(&["session"][..]), false).await;
    assert_eq!(cleared.success_count, 1);
    assert_eq!(instances_used(&api, "t1").await, 1.0);
    assert!(api.global_manager().get_info("session:t1:a1").await.is_none());
    assert!(api.global_manager().get_info("notes:t1:a1").await.is_some());
}

#[tokio::test]
async fn test_temporary_chat_instance_is_torn_down() {
    let (api, _calls) = api_with_sessions().await;
    let request = InstanceRequest::new("session", "t1", "a1").chat_stream("c1");

    let agent = api
        .with_temporary_instance(&request, |instance| async move {
            crate::models::downcast_instance::<Session>(instance).map(|s| s.agent_id.clone())
        })
        .await;
    assert_eq!(agent.flatten().as_deref(), Some("a1"));

    assert!(api.global_manager().get_info("session:t1:a1:c1").await.is_none());
    assert!(api
        .lifecycle_manager()
        .get_instance_state("session:t1:a1:c1")
        .await
        .is_none());
    assert_eq!(instances_used(&api, "t1").await, 0.0);
}

#[tokio::test]
async fn test_batch_operations() {
    let (api, _calls) = api_with_sessions().await;
    let requests = vec![
        InstanceRequest::new("session", "t1", "a1"),
        InstanceRequest::new("session", "t1", "a2"),
        InstanceRequest::new("missing", "t1", "a1"),
    ];

    let created = api.batch_create_instances(&requests).await;
    assert_eq!(created.total_count, 3);
    assert_eq!(created.success_count, 2);
    assert_eq!(created.failure_count, 1);
    assert_eq!(created.results[2].instance_id.as_deref(), Some("missing:t1:a1"));

    // nothing owns the batch-created instances, so hold them for the check
    let _a1 = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    let _a2 = api.get_isolated_instance("session", "t1", "a2").await.unwrap();

    let checked = api.batch_health_check(Some("t1"), Some(&["session"][..])).await;
    assert_eq!(checked.total_count, 2);
    // monitored but not yet checked
    assert_eq!(checked.failure_count, 2);
    assert!(checked.results[0].message.contains("unknown"));
}

#[tokio::test]
async fn test_summary_stats_and_health() {
    let (api, _calls) = api_with_sessions().await;
    let _a1 = api.get_isolated_instance("session", "t1", "a1").await.unwrap();
    let _a2 = api.get_isolated_instance("session", "t1", "a2").await.unwrap();

    let summary = api.get_tenant_summary("t1").await;
    assert_eq!(summary.total_instances, 2);
    assert_eq!(summary.instance_counts["session"], 2);
    assert_eq!(summary.health_status.unknown, 2);
    assert_eq!(summary.resources[&ResourceType::Instances].usage, 2.0);

    let stats = api.get_system_stats().await;
    assert_eq!(stats.global_manager.total_instances, 2);
    assert_eq!(stats.monitoring.stats.total_instances, 2);

    let report = api.health_check().await;
    assert_eq!(report.overall_status, HealthStatus::Healthy);
    assert_eq!(report.components.len(), 5);

    let unknown = api.check_resource_availability("t1", "gpu", 1.0).await;
    assert!(!unknown.available);
    assert!(unknown.error.is_some());
}

#[tokio::test]
async fn test_shutdown_cleans_everything() {
    let (api, _calls) = api_with_sessions().await;
    api.start().await;

    let held = api
        .get_typed_instance::<Session>(&InstanceRequest::new("session", "t1", "a1"))
        .await
        .unwrap();
    api.shutdown().await;

    assert!(held.closed.load(Ordering::SeqCst));
    assert_eq!(api.global_manager().get_stats().await.total_instances, 0);
    assert!(api.lifecycle_manager().list_instances(None).await.is_empty());
    assert_eq!(instances_used(&api, "t1").await, 0.0);
}
