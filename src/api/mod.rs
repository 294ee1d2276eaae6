// Instance Manager API
// The facade composing the registry, cache, lifecycle, quota and monitoring
// components into one entry point

//! # Instance Manager API
//!
//! [`InstanceManagerApi`] is the composition root of the runtime. It owns
//! one handle to each engine component and sequences them:
//!
//! ```text
//!   get_instance ──▶ cache hit? ──yes──▶ touch lifecycle ──▶ instance
//!                        │
//!                        no
//!                        ▼
//!             INSTANCES quota check ──refused──▶ None
//!                        │
//!                        ▼
//!          factory via global manager ──▶ record +1 INSTANCES
//!                        │
//!                        ▼
//!          lifecycle register + activate ──▶ monitoring register
//! ```
//!
//! Every lifecycle cleanup, however it was triggered, runs an
//! `AfterCleanup` hook that drops the cache entry, stops monitoring and
//! gives the INSTANCES unit back, so the components never disagree about
//! which instances exist.

pub mod types;

#[cfg(test)]
mod manager_tests;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::engine::global_manager::{GlobalInstanceManager, InstanceFilter};
use crate::engine::lifecycle::{HookContext, InstanceLifecycleManager, LifecycleHook};
use crate::engine::monitoring::InstanceMonitoringSystem;
use crate::engine::registry::InstanceRegistry;
use crate::engine::resources::TenantResourceManager;
use crate::models::{
    downcast_instance, HealthStatus, InstanceState, IsolationContext, LifecycleEvent,
    ManagedInstance, ResourceType,
};
use crate::Result;

use types::{
    AvailabilityReport, BatchOperationResult, ComponentHealth, HealthCounts, HealthReport,
    InstanceOperationResult, InstanceRequest, QuotaSpec, SystemStats, TenantSummary,
};

/// Keeps the cache, monitoring and INSTANCES accounting in step with
/// lifecycle cleanups
struct ReleaseOnCleanup {
    global: GlobalInstanceManager,
    monitoring: InstanceMonitoringSystem,
    resources: TenantResourceManager,
}

#[async_trait]
impl LifecycleHook for ReleaseOnCleanup {
    async fn on_event(
        &self,
        _event: LifecycleEvent,
        instance_id: &str,
        context: &HookContext,
    ) -> Result<bool> {
        self.global.release(instance_id).await;
        self.monitoring.unregister_instance(instance_id).await;

        if let Some(tenant_id) = context.get("tenant_id").and_then(Value::as_str) {
            let metadata = HashMap::from([("instance_id".to_string(), json!(instance_id))]);
            self.resources
                .record_usage(tenant_id, ResourceType::Instances, -1.0, Some(metadata))
                .await;
        }
        debug!("Released bookkeeping of {}", instance_id);
        Ok(true)
    }
}

/// Single entry point for obtaining and managing isolated instances
#[derive(Clone)]
pub struct InstanceManagerApi {
    registry: InstanceRegistry,
    global: GlobalInstanceManager,
    lifecycle: InstanceLifecycleManager,
    resources: TenantResourceManager,
    monitoring: InstanceMonitoringSystem,
}

impl InstanceManagerApi {
    pub fn new(config: RuntimeConfig) -> Self {
        let registry = InstanceRegistry::new();
        let global = GlobalInstanceManager::new(config.global);
        let resources = TenantResourceManager::new(config.resources);
        let monitoring = InstanceMonitoringSystem::new(config.monitoring);

        let release: Arc<dyn LifecycleHook> = Arc::new(ReleaseOnCleanup {
            global: global.clone(),
            monitoring: monitoring.clone(),
            resources: resources.clone(),
        });
        let lifecycle = InstanceLifecycleManager::with_hooks(
            config.lifecycle,
            [(LifecycleEvent::AfterCleanup, release, i32::MAX)],
        );

        Self {
            registry,
            global,
            lifecycle,
            resources,
            monitoring,
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn global_manager(&self) -> &GlobalInstanceManager {
        &self.global
    }

    pub fn lifecycle_manager(&self) -> &InstanceLifecycleManager {
        &self.lifecycle
    }

    pub fn resource_manager(&self) -> &TenantResourceManager {
        &self.resources
    }

    pub fn monitoring(&self) -> &InstanceMonitoringSystem {
        &self.monitoring
    }

    pub fn create_isolation_context(
        &self,
        tenant_id: &str,
        agent_id: &str,
        platform: Option<&str>,
        chat_stream_id: Option<&str>,
    ) -> IsolationContext {
        self.global
            .create_isolation_context(tenant_id, agent_id, platform, chat_stream_id)
    }

    //===============================================================
    // Instances
    //===============================================================

    /// Get or create the agent-wide instance of `instance_type`
    pub async fn get_isolated_instance(
        &self,
        instance_type: &str,
        tenant_id: &str,
        agent_id: &str,
    ) -> Option<Arc<dyn ManagedInstance>> {
        self.get_instance(&InstanceRequest::new(instance_type, tenant_id, agent_id))
            .await
    }

    /// Typed variant of [`get_instance`](Self::get_instance)
    pub async fn get_typed_instance<T: ManagedInstance>(&self, request: &InstanceRequest) -> Option<Arc<T>> {
        let instance = self.get_instance(request).await?;
        let typed = downcast_instance::<T>(instance);
        if typed.is_none() {
            warn!("Instance {} is not of the requested type", request.instance_id());
        }
        typed
    }

    /// Get or create the instance described by `request`
    ///
    /// `None` when the tenant is out of INSTANCES quota, no factory is
    /// registered, the factory fails, or `auto_create` is off and nothing is
    /// cached.
    pub async fn get_instance(&self, request: &InstanceRequest) -> Option<Arc<dyn ManagedInstance>> {
        let context = request.context();
        let instance_id = context.instance_key(&request.instance_type);

        if let Some(instance) = self.global.get_cached(&instance_id).await {
            self.ensure_tracked(&instance_id, &instance, request).await;
            return Some(instance);
        }

        if !request.auto_create {
            debug!("No cached instance {} and auto-create is off", instance_id);
            return None;
        }

        // a record left behind by an instance its owner already dropped
        if self.lifecycle.get_instance_state(&instance_id).await.is_some() {
            debug!("Clearing stale lifecycle record for {}", instance_id);
            self.lifecycle.cleanup_instance(&instance_id, true).await;
        }

        let (available, remaining) = self
            .resources
            .check_availability(&request.tenant_id, ResourceType::Instances, 1.0)
            .await;
        if !available {
            warn!(
                "Instance quota exhausted for tenant {} (remaining {}), not creating {}",
                request.tenant_id, remaining, instance_id
            );
            return None;
        }

        let acquired = match self
            .global
            .acquire(&request.instance_type, &context, request.params.clone())
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("Failed to create {}: {}", instance_id, e);
                return None;
            }
        };

        if !acquired.created {
            self.ensure_tracked(&instance_id, &acquired.instance, request)
                .await;
            return Some(acquired.instance);
        }

        let metadata = HashMap::from([("instance_id".to_string(), json!(instance_id))]);
        self.resources
            .record_usage(&request.tenant_id, ResourceType::Instances, 1.0, Some(metadata))
            .await;
        self.track(&instance_id, &acquired.instance, request).await;
        Some(acquired.instance)
    }

    /// Register with lifecycle (and activate) and with monitoring
    async fn track(&self, instance_id: &str, instance: &Arc<dyn ManagedInstance>, request: &InstanceRequest) {
        if self
            .lifecycle
            .register_instance(instance_id, instance, None, hook_context(request))
            .await
        {
            if !self.lifecycle.activate(instance_id).await {
                warn!("Failed to activate lifecycle of {}", instance_id);
            }
        } else if !self.lifecycle.touch(instance_id).await {
            warn!("Failed to register lifecycle of {}", instance_id);
        }

        self.monitoring.register_instance(instance_id, instance).await;
    }

    async fn ensure_tracked(&self, instance_id: &str, instance: &Arc<dyn ManagedInstance>, request: &InstanceRequest) {
        if self.lifecycle.touch(instance_id).await {
            return;
        }
        info!("Re-establishing lifecycle tracking for {}", instance_id);
        self.track(instance_id, instance, request).await;
    }

    /// Run `f` with an instance; chat-scoped instances are torn down after
    pub async fn with_temporary_instance<F, Fut, T>(&self, request: &InstanceRequest, f: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn ManagedInstance>) -> Fut,
        Fut: Future<Output = T>,
    {
        let instance = self.get_instance(request).await?;
        let output = f(instance).await;

        if request.chat_stream_id.is_some() {
            let instance_id = request.instance_id();
            self.lifecycle.cleanup_instance(&instance_id, true).await;
            self.global.release(&instance_id).await;
        }
        Some(output)
    }

    /// Tear down a tenant's instances, optionally only some types
    ///
    /// Without `force`, ACTIVE instances are deactivated first. Clearing
    /// every type also forgets the tenant's quotas, usage and alerts.
    pub async fn clear_tenant_instances(
        &self,
        tenant_id: &str,
        instance_types: Option<&[&str]>,
        force: bool,
    ) -> BatchOperationResult {
        let start = Utc::now();
        let wanted = |instance_type: &str| {
            instance_types.map_or(true, |types| types.iter().any(|t| *t == instance_type))
        };

        let mut targets: Vec<String> = self
            .global
            .get_instance_info(&InstanceFilter::default().tenant(tenant_id))
            .await
            .into_iter()
            .filter(|info| wanted(info.instance_type.as_str()))
            .map(|info| info.instance_id)
            .collect();
        for record in self.lifecycle.list_instances(None).await {
            let tenant = record.context.get("tenant_id").and_then(Value::as_str);
            let instance_type = record.context.get("instance_type").and_then(Value::as_str);
            if tenant == Some(tenant_id) && instance_type.map_or(false, wanted) {
                targets.push(record.instance_id);
            }
        }
        let mut seen = HashSet::new();
        targets.retain(|id| seen.insert(id.clone()));

        let mut results = Vec::with_capacity(targets.len());
        for instance_id in &targets {
            if !force && self.lifecycle.get_instance_state(instance_id).await == Some(InstanceState::Active) {
                self.lifecycle.deactivate(instance_id).await;
            }

            let result = if self.lifecycle.cleanup_instance(instance_id, force).await {
                InstanceOperationResult::succeeded(format!("Cleared instance {}", instance_id))
            } else {
                InstanceOperationResult::failed(format!("Failed to clear instance {}", instance_id))
            };
            results.push(result.with_instance(instance_id));
        }

        let dropped = match instance_types {
            Some(types) => {
                let mut dropped = 0;
                for instance_type in types {
                    dropped += self
                        .global
                        .clear_tenant_instances(tenant_id, Some(instance_type))
                        .await;
                }
                dropped
            }
            None => {
                let dropped = self.global.clear_tenant_instances(tenant_id, None).await;
                self.resources.cleanup_tenant_data(tenant_id).await;
                dropped
            }
        };
        if dropped > 0 {
            debug!("Dropped {} leftover cache entries for {}", dropped, tenant_id);
        }

        let batch = BatchOperationResult::from_results(results, start);
        info!(
            "Cleared tenant {}: {}/{} instances",
            tenant_id, batch.success_count, batch.total_count
        );
        batch
    }

    //===============================================================
    // Batch operations
    //===============================================================

    pub async fn batch_create_instances(&self, requests: &[InstanceRequest]) -> BatchOperationResult {
        let start = Utc::now();
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            let instance_id = request.instance_id();
            let data = serde_json::to_value(request).unwrap_or(Value::Null);
            let result = match self.get_instance(request).await {
                Some(_) => InstanceOperationResult::succeeded("Instance ready"),
                None => InstanceOperationResult::failed("Failed to create instance"),
            };
            results.push(result.with_instance(&instance_id).with_data(data));
        }

        BatchOperationResult::from_results(results, start)
    }

    /// Report monitoring health of cached instances; `None` tenant means all
    pub async fn batch_health_check(
        &self,
        tenant_id: Option<&str>,
        instance_types: Option<&[&str]>,
    ) -> BatchOperationResult {
        let start = Utc::now();
        let mut filter = InstanceFilter::default();
        if let Some(tenant_id) = tenant_id {
            filter = filter.tenant(tenant_id);
        }

        let mut results = Vec::new();
        for info in self.global.get_instance_info(&filter).await {
            if !instance_types.map_or(true, |types| types.iter().any(|t| *t == info.instance_type)) {
                continue;
            }

            let result = match self.monitoring.get_instance_health(&info.instance_id).await {
                Some(report) => {
                    let status = report.overall_health;
                    let result = if status == HealthStatus::Healthy {
                        InstanceOperationResult::succeeded(format!("Health status: {}", status))
                    } else {
                        InstanceOperationResult::failed(format!("Health status: {}", status))
                    };
                    result.with_data(serde_json::to_value(&report).unwrap_or(Value::Null))
                }
                None => InstanceOperationResult::failed("Health status: unknown")
                    .with_error("instance is not monitored"),
            };
            results.push(result.with_instance(&info.instance_id));
        }

        BatchOperationResult::from_results(results, start)
    }

    //===============================================================
    // Resources
    //===============================================================

    /// Apply quotas keyed by resource name; false if any entry was rejected
    pub async fn setup_tenant_quotas(&self, tenant_id: &str, quotas: HashMap<String, QuotaSpec>) -> bool {
        let mut all_applied = true;
        for (resource_name, spec) in quotas {
            match resource_name.parse::<ResourceType>() {
                Ok(resource_type) => {
                    if !self
                        .resources
                        .set_quota(tenant_id, spec.into_quota(resource_type))
                        .await
                    {
                        all_applied = false;
                    }
                }
                Err(e) => {
                    error!("Failed to set quota for {}: {}", resource_name, e);
                    all_applied = false;
                }
            }
        }
        all_applied
    }

    pub async fn check_resource_availability(
        &self,
        tenant_id: &str,
        resource_type: &str,
        required: f64,
    ) -> AvailabilityReport {
        match resource_type.parse::<ResourceType>() {
            Ok(parsed) => {
                let (available, remaining) = self
                    .resources
                    .check_availability(tenant_id, parsed, required)
                    .await;
                AvailabilityReport {
                    tenant_id: tenant_id.to_string(),
                    resource_type: resource_type.to_string(),
                    available,
                    remaining: remaining.is_finite().then_some(remaining),
                    required,
                    sufficient: remaining >= required,
                    error: None,
                }
            }
            Err(e) => AvailabilityReport {
                tenant_id: tenant_id.to_string(),
                resource_type: resource_type.to_string(),
                available: false,
                remaining: None,
                required,
                sufficient: false,
                error: Some(e.to_string()),
            },
        }
    }

    //===============================================================
    // Reporting
    //===============================================================

    pub async fn get_tenant_summary(&self, tenant_id: &str) -> TenantSummary {
        let instances = self.global.get_tenant_instances(tenant_id).await;
        let instance_counts: BTreeMap<String, usize> = instances
            .iter()
            .map(|(instance_type, infos)| (instance_type.clone(), infos.len()))
            .collect();

        let mut health_status = HealthCounts::default();
        for info in instances.values().flatten() {
            let status = self
                .monitoring
                .get_instance_health(&info.instance_id)
                .await
                .map_or(HealthStatus::Unknown, |report| report.overall_health);
            health_status.add(status);
        }

        let resource_stats = self.resources.get_tenant_stats(tenant_id).await;

        TenantSummary {
            tenant_id: tenant_id.to_string(),
            timestamp: Utc::now(),
            total_instances: instance_counts.values().sum(),
            instance_counts,
            resources: resource_stats.resources,
            health_status,
            active_alerts: resource_stats.active_alerts,
        }
    }

    pub async fn get_system_stats(&self) -> SystemStats {
        SystemStats {
            timestamp: Utc::now(),
            global_manager: self.global.get_stats().await,
            lifecycle_manager: self.lifecycle.get_stats().await,
            registry: self.registry.get_stats().await,
            resource_manager: self.resources.get_global_stats().await,
            monitoring: self.monitoring.get_system_overview().await,
        }
    }

    /// Component health rollup
    pub async fn health_check(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        let global = self.global.get_stats().await;
        components.insert(
            "global_manager".to_string(),
            component(HealthStatus::Healthy, None, &global),
        );

        let lifecycle = self.lifecycle.get_stats().await;
        let error_rate = lifecycle.error_rate();
        components.insert(
            "lifecycle_manager".to_string(),
            component(graded(error_rate, 0.1, 0.3), Some(error_rate), &lifecycle),
        );

        let registry = self.registry.get_stats().await;
        components.insert(
            "registry".to_string(),
            component(HealthStatus::Healthy, None, &registry),
        );

        let resources = self.resources.get_global_stats().await;
        let alerts = resources.active_alerts as f64;
        components.insert(
            "resource_manager".to_string(),
            component(graded(alerts, 10.0, 50.0), Some(alerts), &resources),
        );

        let monitoring = self.monitoring.get_stats().await;
        let unhealthy_rate = monitoring.unhealthy_rate();
        components.insert(
            "monitoring".to_string(),
            component(graded(unhealthy_rate, 0.1, 0.3), Some(unhealthy_rate), &monitoring),
        );

        let overall_status = components
            .values()
            .map(|c| c.status)
            .max_by_key(|s| severity(*s))
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            overall_status,
            timestamp: Utc::now(),
            components,
        }
    }

    //===============================================================
    // Background tasks
    //===============================================================

    /// Start every component's background loop
    pub async fn start(&self) {
        self.global.start().await;
        self.lifecycle.start().await;
        self.resources.start().await;
        self.monitoring.start().await;
        info!("Instance runtime started");
    }

    /// Stop background loops in reverse start order and clean everything up
    pub async fn shutdown(&self) {
        self.monitoring.shutdown().await;
        self.resources.shutdown().await;
        self.lifecycle.shutdown().await;
        self.global.shutdown().await;
        self.registry.shutdown().await;
        info!("Instance runtime shut down");
    }
}

impl Default for InstanceManagerApi {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

fn hook_context(request: &InstanceRequest) -> HookContext {
    let mut context = HookContext::new();
    context.insert("tenant_id".to_string(), json!(request.tenant_id));
    context.insert("agent_id".to_string(), json!(request.agent_id));
    context.insert("instance_type".to_string(), json!(request.instance_type));
    if let Some(chat) = &request.chat_stream_id {
        context.insert("chat_stream_id".to_string(), json!(chat));
    }
    if let Some(platform) = &request.platform {
        context.insert("platform".to_string(), json!(platform));
    }
    context
}

/// Healthy up to `degraded`, degraded up to `unhealthy`, unhealthy above
fn graded(value: f64, degraded: f64, unhealthy: f64) -> HealthStatus {
    if value > unhealthy {
        HealthStatus::Unhealthy
    } else if value > degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Unknown => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Unhealthy => 3,
    }
}

fn component<S: serde::Serialize>(status: HealthStatus, indicator: Option<f64>, stats: &S) -> ComponentHealth {
    ComponentHealth {
        status,
        indicator,
        stats: serde_json::to_value(stats).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graded_thresholds() {
        assert_eq!(graded(0.1, 0.1, 0.3), HealthStatus::Healthy);
        assert_eq!(graded(0.2, 0.1, 0.3), HealthStatus::Degraded);
        assert_eq!(graded(0.31, 0.1, 0.3), HealthStatus::Unhealthy);
        assert_eq!(graded(11.0, 10.0, 50.0), HealthStatus::Degraded);
    }

    #[test]
    fn test_hook_context_fields() {
        let request = InstanceRequest::new("echo", "t1", "a1").chat_stream("c1");
        let context = hook_context(&request);
        assert_eq!(context["tenant_id"], json!("t1"));
        assert_eq!(context["chat_stream_id"], json!("c1"));
        assert!(!context.contains_key("platform"));
    }

    #[test]
    fn test_release_hook_returns_instance_unit() {
        let resources = TenantResourceManager::default();
        let hook = ReleaseOnCleanup {
            global: GlobalInstanceManager::default(),
            monitoring: InstanceMonitoringSystem::default(),
            resources: resources.clone(),
        };

        tokio_test::block_on(async {
            resources
                .record_usage("t1", ResourceType::Instances, 2.0, None)
                .await;
            let context = hook_context(&InstanceRequest::new("echo", "t1", "a1"));
            let proceed = hook
                .on_event(LifecycleEvent::AfterCleanup, "echo:t1:a1", &context)
                .await
                .unwrap();
            assert!(proceed);

            let usage = resources
                .get_usage("t1", Some(ResourceType::Instances))
                .await;
            assert_eq!(usage[&ResourceType::Instances], 1.0);
        });
    }
}
