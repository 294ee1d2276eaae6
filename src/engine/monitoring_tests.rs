// Tests for the instance monitoring system
use crate::{
    config::MonitoringConfig,
    engine::monitoring::{CheckTarget, HealthChecker, InstanceMonitoringSystem, InstanceProbeChecker},
    models::{
        DiagnosticEvent, HealthCheckable, HealthStatus, ManagedInstance, MetricType,
        PerformanceSnapshot, Recoverable, SeverityLevel, SpanStatus,
    },
    Result, RuntimeError,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// Test helpers
fn quiet_config() -> MonitoringConfig {
    MonitoringConfig {
        monitoring_interval_ms: 0,
        health_check_interval_ms: 0,
        install_default_checkers: false,
        ..MonitoringConfig::default()
    }
}

fn system() -> InstanceMonitoringSystem {
    InstanceMonitoringSystem::new(quiet_config())
}

struct Plain;
impl ManagedInstance for Plain {}

struct Patient {
    recover_ok: bool,
    recoveries: AtomicUsize,
}

#[async_trait]
impl Recoverable for Patient {
    async fn recover(&self) -> Result<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        if self.recover_ok {
            Ok(())
        } else {
            Err(RuntimeError::Internal("still broken".into()))
        }
    }
}

impl ManagedInstance for Patient {
    fn as_recoverable(&self) -> Option<&dyn Recoverable> {
        Some(self)
    }
}

struct Probed {
    healthy: AtomicBool,
}

#[async_trait]
impl HealthCheckable for Probed {
    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

impl ManagedInstance for Probed {
    fn as_health_check(&self) -> Option<&dyn HealthCheckable> {
        Some(self)
    }
}

fn patient(recover_ok: bool) -> Arc<Patient> {
    Arc::new(Patient {
        recover_ok,
        recoveries: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_register_and_unregister() {
    let monitoring = system();
    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);

    assert!(monitoring.register_instance("i1", &instance).await);
    assert!(!monitoring.register_instance("i1", &instance).await);
    assert!(monitoring.is_monitored("i1").await);

    assert!(monitoring.unregister_instance("i1").await);
    assert!(!monitoring.unregister_instance("i1").await);
    assert!(monitoring.get_instance_health("i1").await.is_none());
}

#[tokio::test]
async fn test_no_checkers_leaves_health_unknown() {
    let monitoring = system();
    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;

    monitoring.run_monitoring_cycle().await;

    let report = monitoring.get_instance_health("i1").await.unwrap();
    assert_eq!(report.overall_health, HealthStatus::Unknown);
    assert!(report.health_checks.is_empty());
    assert!(report.last_check.is_some());
}

#[tokio::test]
async fn test_unhealthy_instance_is_recovered() {
    let monitoring = system();
    monitoring
        .register_health_checker_fn("always_down", |_id: &str| {
            (HealthStatus::Unhealthy, "down", 1.5)
        })
        .await;

    let healing = patient(true);
    let instance: Arc<dyn ManagedInstance> = healing.clone();
    monitoring.register_instance("i1", &instance).await;
    monitoring.run_monitoring_cycle().await;

    let report = monitoring.get_instance_health("i1").await.unwrap();
    assert_eq!(report.overall_health, HealthStatus::Unhealthy);
    assert_eq!(report.health_checks["always_down"].message, "down");
    assert_eq!(report.health_checks["always_down"].response_time_ms, 1.5);
    assert_eq!(healing.recoveries.load(Ordering::SeqCst), 1);

    let events = monitoring.get_diagnostic_events(Some("i1"), None, 10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "auto_recovery");
    assert_eq!(events[0].severity, SeverityLevel::Low);
}

#[tokio::test]
async fn test_failed_recovery_raises_high_event() {
    let monitoring = system();
    monitoring
        .register_health_checker_fn("always_down", |_id: &str| {
            (HealthStatus::Unhealthy, "down", 0.0)
        })
        .await;

    let stuck = patient(false);
    let instance: Arc<dyn ManagedInstance> = stuck.clone();
    monitoring.register_instance("i1", &instance).await;
    monitoring.run_monitoring_cycle().await;

    let events = monitoring
        .get_diagnostic_events(None, Some(SeverityLevel::High), 10)
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "auto_recovery_failed");
    assert!(events[0].message.contains("still broken"));
}

#[tokio::test]
async fn test_auto_recovery_can_be_disabled() {
    let monitoring = InstanceMonitoringSystem::new(MonitoringConfig {
        auto_recovery: false,
        ..quiet_config()
    });
    monitoring
        .register_health_checker_fn("always_down", |_id: &str| {
            (HealthStatus::Unhealthy, "down", 0.0)
        })
        .await;

    let healing = patient(true);
    let instance: Arc<dyn ManagedInstance> = healing.clone();
    monitoring.register_instance("i1", &instance).await;
    monitoring.run_monitoring_cycle().await;

    assert_eq!(healing.recoveries.load(Ordering::SeqCst), 0);
    assert!(monitoring.get_diagnostic_events(None, None, 10).await.is_empty());
}

#[tokio::test]
async fn test_worst_check_wins() {
    let monitoring = system();
    monitoring
        .register_health_checker_fn("fine", |_id: &str| (HealthStatus::Healthy, "ok", 0.0))
        .await;
    monitoring
        .register_health_checker_fn("slow", |_id: &str| (HealthStatus::Degraded, "slow", 0.0))
        .await;

    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;
    monitoring.run_monitoring_cycle().await;
    assert_eq!(
        monitoring.get_instance_health("i1").await.unwrap().overall_health,
        HealthStatus::Degraded
    );

    // a removed checker stops contributing on the next round
    assert!(monitoring.unregister_health_checker("slow").await);
    assert!(!monitoring.unregister_health_checker("slow").await);
    monitoring
        .register_health_checker_fn("slow", |_id: &str| (HealthStatus::Healthy, "recovered", 0.0))
        .await;
    monitoring.run_monitoring_cycle().await;
    assert_eq!(
        monitoring.get_instance_health("i1").await.unwrap().overall_health,
        HealthStatus::Healthy
    );
}

#[tokio::test]
async fn test_instance_checker_uses_health_check() {
    let performance = PerformanceSnapshot::default();
    let probed = Probed {
        healthy: AtomicBool::new(true),
    };
    let target = CheckTarget {
        instance_id: "i1",
        instance: &probed,
        performance: &performance,
    };

    let outcome = InstanceProbeChecker.check(&target).await.unwrap();
    assert_eq!(outcome.status, HealthStatus::Healthy);

    probed.healthy.store(false, Ordering::SeqCst);
    let outcome = InstanceProbeChecker.check(&target).await.unwrap();
    assert_eq!(outcome.status, HealthStatus::Unhealthy);

    // instances without a probe are skipped
    let plain = Plain;
    let target = CheckTarget {
        instance_id: "i2",
        instance: &plain,
        performance: &performance,
    };
    assert!(InstanceProbeChecker.check(&target).await.is_none());
}

#[tokio::test]
async fn test_diagnostic_rules_and_callbacks() {
    let monitoring = system();
    monitoring
        .add_diagnostic_rule(|snapshot| {
            if snapshot.metrics.contains_key("queue_depth") {
                vec![format!("{} has a backlog", snapshot.instance_id)]
            } else {
                Vec::new()
            }
        })
        .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    monitoring
        .add_alert_callback(move |event: &DiagnosticEvent| {
            assert_eq!(event.event_type, "diagnostic_rule");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;
    monitoring.run_monitoring_cycle().await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    assert!(monitoring.record_metric("i1", "queue_depth", 42.0, MetricType::Gauge).await);
    assert!(!monitoring.record_metric("missing", "queue_depth", 1.0, MetricType::Gauge).await);
    monitoring.run_monitoring_cycle().await;

    let events = monitoring.get_diagnostic_events(Some("i1"), None, 10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, SeverityLevel::Medium);
    assert_eq!(events[0].message, "i1 has a backlog");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_instance_is_unregistered() {
    let monitoring = system();
    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;

    drop(instance);
    monitoring.run_monitoring_cycle().await;

    assert!(!monitoring.is_monitored("i1").await);
    assert_eq!(monitoring.get_stats().await.total_instances, 0);
}

#[tokio::test]
async fn test_event_filters_and_limit() {
    let monitoring = InstanceMonitoringSystem::new(MonitoringConfig {
        diagnostic_capacity: 4,
        ..quiet_config()
    });

    for (id, severity) in [
        ("i1", SeverityLevel::Low),
        ("i1", SeverityLevel::Critical),
        ("i2", SeverityLevel::Medium),
        ("i1", SeverityLevel::High),
        ("i2", SeverityLevel::Low),
    ] {
        monitoring
            .record_event(DiagnosticEvent::new(id, "manual", severity, "note"))
            .await;
    }

    // the oldest event fell out of the ring
    assert_eq!(monitoring.get_diagnostic_events(None, None, 100).await.len(), 4);
    assert_eq!(monitoring.get_stats().await.total_diagnostic_events, 5);

    let serious = monitoring
        .get_diagnostic_events(Some("i1"), Some(SeverityLevel::High), 100)
        .await;
    assert_eq!(serious.len(), 2);
    assert_eq!(serious[0].severity, SeverityLevel::Critical);

    let latest = monitoring.get_diagnostic_events(None, None, 1).await;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].instance_id, "i2");
    assert_eq!(latest[0].severity, SeverityLevel::Low);
}

#[tokio::test]
async fn test_spans_form_a_trace() {
    let monitoring = system();

    let root = monitoring.create_span("handle_message", "a", None, None).await;
    let child = monitoring
        .create_span("load_memory", "b", Some(&root.trace_id), Some(&root.span_id))
        .await;
    let leaf = monitoring
        .create_span("query", "c", Some(&child.trace_id), Some(&child.span_id))
        .await;
    assert_eq!(child.trace_id, root.trace_id);
    assert_eq!(leaf.parent_span_id.as_deref(), Some(child.span_id.as_str()));

    assert!(monitoring.tag_span(&leaf.span_id, "table", "memories").await);
    monitoring
        .finish_span(&leaf.span_id, SpanStatus::Error, Some("timeout".into()))
        .await
        .unwrap();
    assert!(monitoring
        .finish_span(&leaf.span_id, SpanStatus::Ok, None)
        .await
        .is_none());

    let trace = monitoring.get_trace(&root.trace_id).await;
    let order: Vec<&str> = trace.iter().map(|s| s.operation_name.as_str()).collect();
    assert_eq!(order, vec!["handle_message", "load_memory", "query"]);

    let finished = monitoring.get_span(&leaf.span_id).await.unwrap();
    assert_eq!(finished.status, Some(SpanStatus::Error));
    assert_eq!(finished.error.as_deref(), Some("timeout"));
    assert_eq!(finished.tags["table"], "memories");
    assert!(finished.duration_ms.is_some());

    assert_eq!(monitoring.get_system_overview().await.active_spans, 2);
}

#[tokio::test]
async fn test_traced_records_call_duration() {
    let monitoring = system();
    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;

    let value = monitoring
        .traced("compute", "i1", None, async { Ok::<_, RuntimeError>(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);

    let failed = monitoring
        .traced("compute", "i1", None, async {
            Err::<i32, _>(RuntimeError::Internal("boom".into()))
        })
        .await;
    assert!(failed.is_err());

    let metrics = monitoring.get_instance_metrics("i1", 60).await.unwrap();
    assert_eq!(metrics["call_duration_ms"].count, 2);

    let stats = monitoring.get_stats().await;
    assert_eq!(stats.total_spans, 2);
    assert_eq!(monitoring.get_system_overview().await.active_spans, 0);
}

#[tokio::test]
async fn test_stats_and_overview() {
    let monitoring = system();
    monitoring
        .register_health_checker_fn("by_id", |id: &str| {
            if id == "sick" {
                (HealthStatus::Unhealthy, "bad", 0.0)
            } else {
                (HealthStatus::Healthy, "good", 0.0)
            }
        })
        .await;

    let well: Arc<dyn ManagedInstance> = Arc::new(Plain);
    let sick: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("well", &well).await;
    monitoring.register_instance("sick", &sick).await;
    monitoring.run_monitoring_cycle().await;

    let stats = monitoring.get_stats().await;
    assert_eq!(stats.total_instances, 2);
    assert_eq!(stats.healthy_instances, 1);
    assert_eq!(stats.unhealthy_instances, 1);
    assert_eq!(stats.total_health_checks, 2);
    assert_eq!(stats.unhealthy_rate(), 0.5);
    assert!(stats.last_cycle.is_some());

    let overview = monitoring.get_system_overview().await;
    assert_eq!(overview.instance_health["sick"], HealthStatus::Unhealthy);
    assert_eq!(overview.instance_health["well"], HealthStatus::Healthy);
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let monitoring = InstanceMonitoringSystem::new(MonitoringConfig {
        monitoring_interval_ms: 10,
        ..quiet_config()
    });
    let instance: Arc<dyn ManagedInstance> = Arc::new(Plain);
    monitoring.register_instance("i1", &instance).await;

    monitoring.start().await;
    monitoring.start().await;

    let mut cycled = false;
    for _ in 0..100 {
        if monitoring.get_stats().await.last_cycle.is_some() {
            cycled = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(cycled);

    monitoring.shutdown().await;
    assert!(!monitoring.is_monitored("i1").await);
}
