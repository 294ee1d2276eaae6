// Tests for the tenant resource manager
use crate::{
    config::ResourceManagerConfig,
    engine::resources::TenantResourceManager,
    models::{AlertLevel, QuotaType, ResourceQuota, ResourceType},
};

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Test helpers
fn bare_manager() -> TenantResourceManager {
    TenantResourceManager::with_defaults(ResourceManagerConfig::default(), HashMap::new())
}

fn requests_quota(limit: f64) -> ResourceQuota {
    ResourceQuota::new(ResourceType::Requests, QuotaType::HardLimit, limit)
}

#[tokio::test]
async fn test_threshold_alerts() {
    let manager = bare_manager();
    assert!(manager.set_quota("t1", requests_quota(100.0)).await);

    assert!(manager.record_usage("t1", ResourceType::Requests, 79.0, None).await.is_empty());

    let warning = manager.record_usage("t1", ResourceType::Requests, 1.0, None).await;
    assert_eq!(warning.len(), 1);
    assert_eq!(warning[0].level, AlertLevel::Warning);
    assert_eq!(warning[0].current_usage, 80.0);

    // still warning territory, already alerted
    assert!(manager.record_usage("t1", ResourceType::Requests, 1.0, None).await.is_empty());

    let critical = manager.record_usage("t1", ResourceType::Requests, 14.0, None).await;
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].level, AlertLevel::Critical);
    assert!(manager.record_usage("t1", ResourceType::Requests, 10.0, None).await.is_empty());

    assert_eq!(manager.get_alerts("t1", Some(false)).await.len(), 2);
    let stats = manager.get_global_stats().await;
    assert_eq!(stats.quota_violations, 2);
    assert_eq!(stats.active_alerts, 2);
    assert_eq!(stats.total_resource_requests, 5);
}

#[tokio::test]
async fn test_resolved_alert_can_fire_again() {
    let manager = bare_manager();
    manager.set_quota("t1", requests_quota(10.0)).await;

    let raised = manager.record_usage("t1", ResourceType::Requests, 8.0, None).await;
    let alert_id = raised[0].alert_id;
    assert!(manager.resolve_alert("t1", alert_id).await);
    assert!(!manager.resolve_alert("t1", alert_id).await);
    assert!(!manager.resolve_alert("t2", alert_id).await);

    let resolved = manager.get_alerts("t1", Some(true)).await;
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].resolved_at.is_some());

    let again = manager.record_usage("t1", ResourceType::Requests, 0.5, None).await;
    assert_eq!(again.len(), 1);
    assert_eq!(manager.get_alerts("t1", None).await.len(), 2);
}

#[tokio::test]
async fn test_availability_never_changes_usage() {
    let manager = bare_manager();
    let (available, remaining) = manager
        .check_availability("t1", ResourceType::Instances, 1000.0)
        .await;
    assert!(available);
    assert!(remaining.is_infinite());

    manager
        .set_quota(
            "t1",
            ResourceQuota::new(ResourceType::Instances, QuotaType::HardLimit, 2.0),
        )
        .await;
    manager.record_usage("t1", ResourceType::Instances, 1.0, None).await;
    assert_eq!(
        manager.check_availability("t1", ResourceType::Instances, 1.0).await,
        (true, 1.0)
    );
    assert_eq!(
        manager.check_availability("t1", ResourceType::Instances, 2.0).await,
        (false, 1.0)
    );
    assert_eq!(
        manager.get_usage("t1", Some(ResourceType::Instances)).await[&ResourceType::Instances],
        1.0
    );
}

#[tokio::test]
async fn test_usage_never_negative() {
    let manager = bare_manager();
    manager.record_usage("t1", ResourceType::Memory, -5.0, None).await;
    assert_eq!(manager.get_usage("t1", None).await[&ResourceType::Memory], 0.0);

    manager.record_usage("t1", ResourceType::Memory, 3.0, None).await;
    manager.record_usage("t1", ResourceType::Memory, -10.0, None).await;
    assert_eq!(manager.get_usage("t1", None).await[&ResourceType::Memory], 0.0);

    // untouched resources read as zero
    assert_eq!(manager.get_usage("t1", Some(ResourceType::Disk)).await[&ResourceType::Disk], 0.0);
}

#[tokio::test]
async fn test_reset_interval_zeroes_usage() {
    let manager = bare_manager();
    manager
        .set_quota(
            "t1",
            requests_quota(100.0).with_reset_interval(Duration::from_millis(50)),
        )
        .await;

    manager.record_usage("t1", ResourceType::Requests, 90.0, None).await;
    assert_eq!(
        manager.check_availability("t1", ResourceType::Requests, 20.0).await,
        (false, 10.0)
    );

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(manager.get_usage("t1", Some(ResourceType::Requests)).await[&ResourceType::Requests], 0.0);
    assert!(manager.check_availability("t1", ResourceType::Requests, 20.0).await.0);

    manager.record_usage("t1", ResourceType::Requests, 5.0, None).await;
    assert_eq!(manager.get_quota("t1", ResourceType::Requests).await.unwrap().current_usage, 5.0);
}

#[tokio::test]
async fn test_alert_callbacks() {
    let manager = bare_manager();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    manager
        .add_alert_callback(move |alert| {
            assert_eq!(alert.tenant_id, "t1");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    manager.set_quota("t1", requests_quota(10.0)).await;
    manager.record_usage("t1", ResourceType::Requests, 9.0, None).await;
    manager.record_usage("t1", ResourceType::Requests, 1.0, None).await;
    manager.record_usage("t1", ResourceType::Requests, 1.0, None).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let manager = TenantResourceManager::with_defaults(
        ResourceManagerConfig {
            history_capacity: 3,
            ..ResourceManagerConfig::default()
        },
        HashMap::new(),
    );

    for amount in [1.0, 2.0, 3.0, 4.0] {
        let metadata = HashMap::from([("step".to_string(), json!(amount))]);
        manager
            .record_usage("t1", ResourceType::Tokens, amount, Some(metadata))
            .await;
    }
    manager.record_usage("t1", ResourceType::Cpu, 1.0, None).await;

    let history = manager.get_usage_history("t1", None, 60).await;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].amount, 3.0);

    let tokens = manager
        .get_usage_history("t1", Some(ResourceType::Tokens), 60)
        .await;
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[1].usage_value, 10.0);
    assert_eq!(tokens[1].metadata["step"], json!(4.0));
}

#[tokio::test]
async fn test_invalid_quotas_rejected() {
    let manager = bare_manager();
    assert!(!manager.set_quota("t1", requests_quota(-1.0)).await);
    assert!(!manager.set_quota("t1", requests_quota(f64::NAN)).await);
    assert!(!manager.set_quota("t1", requests_quota(10.0).with_thresholds(0.9, 0.5)).await);
    assert!(!manager.set_quota("t1", requests_quota(10.0).with_thresholds(0.5, 1.5)).await);
    assert!(manager.get_quota("t1", ResourceType::Requests).await.is_none());
}

#[tokio::test]
async fn test_default_quotas_apply_without_tenant_quota() {
    let manager = TenantResourceManager::default();
    manager.record_usage("t1", ResourceType::Instances, 3.0, None).await;

    let quota = manager.get_quota("t1", ResourceType::Instances).await.unwrap();
    assert_eq!(quota.limit_value, 100.0);
    assert_eq!(quota.current_usage, 3.0);

    // a tenant quota overrides the default only for that tenant
    manager
        .set_quota("t1", ResourceQuota::new(ResourceType::Instances, QuotaType::HardLimit, 5.0))
        .await;
    assert_eq!(manager.get_quota("t1", ResourceType::Instances).await.unwrap().limit_value, 5.0);
    assert_eq!(manager.get_quota("t2", ResourceType::Instances).await.unwrap().limit_value, 100.0);
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let manager = bare_manager();
    manager.set_quota("t1", requests_quota(500.0)).await;
    manager
        .set_quota(
            "t1",
            ResourceQuota::new(ResourceType::Memory, QuotaType::SoftLimit, 256.0)
                .with_thresholds(0.7, 0.9),
        )
        .await;

    let exported = manager.export_tenant_config("t1").await.unwrap();
    let mut document: Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(document["quotas"].as_array().unwrap().len(), 2);
    document["tenant_id"] = json!("t2");

    let applied = manager
        .import_tenant_config(&document.to_string())
        .await
        .unwrap();
    assert_eq!(applied, 2);
    let memory = manager.get_quota("t2", ResourceType::Memory).await.unwrap();
    assert_eq!(memory.limit_value, 256.0);
    assert_eq!(memory.warning_threshold, 0.7);

    assert!(manager.import_tenant_config("not json").await.is_err());
}

#[tokio::test]
async fn test_tenant_stats_and_suggestions() {
    let manager = bare_manager();
    manager
        .set_quota("t1", ResourceQuota::new(ResourceType::Instances, QuotaType::HardLimit, 10.0))
        .await;
    manager.set_quota("t1", requests_quota(1000.0)).await;

    manager.record_usage("t1", ResourceType::Instances, 9.6, None).await;
    for _ in 0..20 {
        manager.record_usage("t1", ResourceType::Requests, 1.0, None).await;
    }

    let stats = manager.get_tenant_stats("t1").await;
    let instances = &stats.resources[&ResourceType::Instances];
    assert_eq!(instances.limit, Some(10.0));
    assert!(instances.ratio.unwrap() > 0.95);
    assert_eq!(stats.active_alerts, 1);
    assert_eq!(stats.critical_alerts, 1);

    let suggestions = manager.suggest_optimizations("t1").await;
    assert!(suggestions.iter().any(|s| s.starts_with("instances usage is at 96%")));
    assert!(suggestions.iter().any(|s| s.contains("critical alerts")));
    assert!(suggestions.iter().any(|s| s.contains("growing quickly")));

    assert!(bare_manager().suggest_optimizations("t1").await.is_empty());
}

#[tokio::test]
async fn test_cleanup_tenant_data() {
    let manager = bare_manager();
    manager.set_quota("t1", requests_quota(10.0)).await;
    manager.record_usage("t1", ResourceType::Requests, 9.0, None).await;

    assert!(manager.cleanup_tenant_data("t1").await);
    assert!(!manager.cleanup_tenant_data("t1").await);
    assert!(manager.get_alerts("t1", None).await.is_empty());
    assert!(manager.get_usage("t1", None).await.is_empty());
    assert_eq!(manager.get_global_stats().await.monitored_tenants, 0);
}

#[tokio::test]
async fn test_sampler_start_and_shutdown() {
    let manager = TenantResourceManager::with_defaults(
        ResourceManagerConfig {
            monitoring_interval_secs: 1,
            ..ResourceManagerConfig::default()
        },
        HashMap::new(),
    );
    manager.start().await;

    let mut sampled = false;
    for _ in 0..100 {
        if manager.get_global_stats().await.last_monitoring.is_some() {
            sampled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(sampled);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_usage_loses_no_updates() {
    let manager = bare_manager();
    // 50 units lands between warning (48) and critical (57)
    assert!(manager.set_quota("t1", requests_quota(60.0)).await);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .record_usage("t1", ResourceType::Requests, 1.0, None)
                .await
                .len()
        }));
    }

    let mut raised = 0;
    for handle in handles {
        raised += handle.await.unwrap();
    }
    assert_eq!(raised, 1);

    let usage = manager.get_usage("t1", Some(ResourceType::Requests)).await;
    assert_eq!(usage[&ResourceType::Requests], 50.0);

    let alerts = manager.get_alerts("t1", None).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Warning);
    assert_eq!(manager.get_global_stats().await.total_resource_requests, 50);
}
