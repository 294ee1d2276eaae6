// Tenant Resource Manager
// Per-tenant usage counters, quotas, threshold alerts and usage history

//! # Tenant Resource Manager
//!
//! Tracks how much of each [`ResourceType`] a tenant has consumed and compares
//! it with the tenant's [`ResourceQuota`], falling back to the process-wide
//! defaults from [`default_quotas`].
//!
//! Admission and accounting are separate calls: [`check_availability`] only
//! reads, and callers record consumption with [`record_usage`] once the
//! guarded operation succeeded.
//!
//! Reset state lives next to the counter of each (tenant, resource) pair, so
//! a default quota shared by many tenants is never written to.
//!
//! [`check_availability`]: TenantResourceManager::check_availability
//! [`record_usage`]: TenantResourceManager::record_usage

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ResourceManagerConfig;
use crate::engine::metrics::ProcessSampler;
use crate::models::{
    default_quotas, AlertLevel, ResourceAlert, ResourceGlobalStats, ResourceQuota, ResourceType,
    ResourceUsage, ResourceUsageSummary, TenantQuotaExport, TenantResourceStats,
};
use crate::{Result, RuntimeError};

/// Called for every newly raised alert
pub type AlertCallback = Arc<dyn Fn(&ResourceAlert) + Send + Sync>;

const GROWTH_WINDOW: usize = 10;

#[derive(Debug, Clone)]
struct UsageCounter {
    value: f64,
    last_reset: DateTime<Utc>,
}

impl UsageCounter {
    fn new() -> Self {
        Self {
            value: 0.0,
            last_reset: Utc::now(),
        }
    }

    fn reset_due(&self, quota: Option<&ResourceQuota>, now: DateTime<Utc>) -> bool {
        let Some(interval) = quota.and_then(|q| q.reset_interval) else {
            return false;
        };
        (now - self.last_reset)
            .to_std()
            .map_or(false, |elapsed| elapsed >= interval)
    }

    /// Usage as seen at `now`, counting an elapsed reset as zero
    fn effective(&self, quota: Option<&ResourceQuota>, now: DateTime<Utc>) -> f64 {
        if self.reset_due(quota, now) {
            0.0
        } else {
            self.value
        }
    }
}

#[derive(Default)]
struct ResourceState {
    quotas: HashMap<String, HashMap<ResourceType, ResourceQuota>>,
    counters: HashMap<String, HashMap<ResourceType, UsageCounter>>,
    history: HashMap<String, VecDeque<ResourceUsage>>,
    alerts: HashMap<String, Vec<ResourceAlert>>,
    quota_violations: u64,
    total_resource_requests: u64,
    last_monitoring: Option<DateTime<Utc>>,
    process_cpu_percent: Option<f64>,
    process_memory_mb: Option<f64>,
}

impl ResourceState {
    fn quota<'a>(
        &'a self,
        defaults: &'a HashMap<ResourceType, ResourceQuota>,
        tenant_id: &str,
        resource_type: ResourceType,
    ) -> Option<&'a ResourceQuota> {
        self.quotas
            .get(tenant_id)
            .and_then(|q| q.get(&resource_type))
            .or_else(|| defaults.get(&resource_type))
    }

    fn usage(
        &self,
        defaults: &HashMap<ResourceType, ResourceQuota>,
        tenant_id: &str,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> f64 {
        self.counters
            .get(tenant_id)
            .and_then(|c| c.get(&resource_type))
            .map_or(0.0, |counter| {
                counter.effective(self.quota(defaults, tenant_id, resource_type), now)
            })
    }
}

/// Per-tenant quota accounting
#[derive(Clone)]
pub struct TenantResourceManager {
    config: ResourceManagerConfig,
    defaults: Arc<HashMap<ResourceType, ResourceQuota>>,
    state: Arc<RwLock<ResourceState>>,
    callbacks: Arc<RwLock<Vec<AlertCallback>>>,
    cancel: CancellationToken,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TenantResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self::with_defaults(config, default_quotas())
    }

    /// Manager with a custom set of process-wide default quotas
    pub fn with_defaults(
        config: ResourceManagerConfig,
        defaults: HashMap<ResourceType, ResourceQuota>,
    ) -> Self {
        Self {
            config,
            defaults: Arc::new(defaults),
            state: Arc::new(RwLock::new(ResourceState::default())),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
            monitor_task: Arc::new(Mutex::new(None)),
        }
    }

    //===============================================================
    // Quotas
    //===============================================================

    /// Set a tenant-specific quota; invalid limits or thresholds are rejected
    pub async fn set_quota(&self, tenant_id: &str, quota: ResourceQuota) -> bool {
        if let Err(e) = validate_quota(&quota) {
            warn!("Rejected quota for tenant {}: {}", tenant_id, e);
            return false;
        }

        let resource_type = quota.resource_type;
        let limit = quota.limit_value;
        self.state
            .write()
            .await
            .quotas
            .entry(tenant_id.to_string())
            .or_default()
            .insert(resource_type, quota);

        info!(
            "Set {} quota for tenant {} to {}",
            resource_type, tenant_id, limit
        );
        true
    }

    /// Effective quota for a tenant with `current_usage` filled in
    pub async fn get_quota(&self, tenant_id: &str, resource_type: ResourceType) -> Option<ResourceQuota> {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut quota = state.quota(&self.defaults, tenant_id, resource_type)?.clone();
        quota.current_usage = state.usage(&self.defaults, tenant_id, resource_type, now);
        Some(quota)
    }

    //===============================================================
    // Usage
    //===============================================================

    /// Add `amount` (negative to release) to the tenant's counter
    ///
    /// The counter never goes below zero. Returns the alerts raised by this
    /// sample; registered callbacks see them after the lock is released.
    pub async fn record_usage(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        amount: f64,
        metadata: Option<HashMap<String, Value>>,
    ) -> Vec<ResourceAlert> {
        let now = Utc::now();
        let raised = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.total_resource_requests += 1;

            let quota = state
                .quota(&self.defaults, tenant_id, resource_type)
                .cloned();

            let counter = state
                .counters
                .entry(tenant_id.to_string())
                .or_default()
                .entry(resource_type)
                .or_insert_with(UsageCounter::new);

            if counter.reset_due(quota.as_ref(), now) {
                debug!(
                    "Reset interval elapsed for {} of tenant {}, usage zeroed",
                    resource_type, tenant_id
                );
                counter.value = 0.0;
                counter.last_reset = now;
            }
            counter.value = (counter.value + amount).max(0.0);
            let usage = counter.value;

            let history = state.history.entry(tenant_id.to_string()).or_default();
            if history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(ResourceUsage {
                tenant_id: tenant_id.to_string(),
                resource_type,
                amount,
                usage_value: usage,
                timestamp: now,
                metadata: metadata.unwrap_or_default(),
            });

            let mut raised = Vec::new();
            if let Some(level) = quota.as_ref().and_then(|q| q.level_for(usage)) {
                let alerts = state.alerts.entry(tenant_id.to_string()).or_default();
                let duplicate = alerts
                    .iter()
                    .any(|a| !a.resolved && a.resource_type == resource_type && a.level == level);
                if !duplicate {
                    if let Some(quota) = &quota {
                        let alert = ResourceAlert::new(tenant_id, quota, level, usage);
                        warn!("Tenant {}: {}", tenant_id, alert.message);
                        alerts.push(alert.clone());
                        raised.push(alert);
                        state.quota_violations += 1;
                    }
                }
            }
            raised
        };

        if !raised.is_empty() {
            let callbacks = self.callbacks.read().await.clone();
            for alert in &raised {
                for callback in &callbacks {
                    callback(alert);
                }
            }
        }
        raised
    }

    /// Current usage, for one resource or for every resource with a counter
    pub async fn get_usage(
        &self,
        tenant_id: &str,
        resource_type: Option<ResourceType>,
    ) -> HashMap<ResourceType, f64> {
        let now = Utc::now();
        let state = self.state.read().await;
        match resource_type {
            Some(resource_type) => HashMap::from([(
                resource_type,
                state.usage(&self.defaults, tenant_id, resource_type, now),
            )]),
            None => state
                .counters
                .get(tenant_id)
                .map(|counters| {
                    counters
                        .keys()
                        .map(|r| (*r, state.usage(&self.defaults, tenant_id, *r, now)))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Whether `required` more units fit under the quota, and how many remain
    ///
    /// Resources without any quota are unbounded. Never changes usage.
    pub async fn check_availability(
        &self,
        tenant_id: &str,
        resource_type: ResourceType,
        required: f64,
    ) -> (bool, f64) {
        let now = Utc::now();
        let state = self.state.read().await;
        let Some(quota) = state.quota(&self.defaults, tenant_id, resource_type) else {
            return (true, f64::INFINITY);
        };
        let usage = state.usage(&self.defaults, tenant_id, resource_type, now);
        (usage + required <= quota.limit_value, quota.remaining(usage))
    }

    /// Samples from the last `minutes`, oldest first
    pub async fn get_usage_history(
        &self,
        tenant_id: &str,
        resource_type: Option<ResourceType>,
        minutes: i64,
    ) -> Vec<ResourceUsage> {
        let since = Utc::now() - ChronoDuration::minutes(minutes);
        let state = self.state.read().await;
        state
            .history
            .get(tenant_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|u| u.timestamp >= since)
                    .filter(|u| resource_type.map_or(true, |r| u.resource_type == r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    //===============================================================
    // Alerts
    //===============================================================

    pub async fn add_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&ResourceAlert) + Send + Sync + 'static,
    {
        self.callbacks.write().await.push(Arc::new(callback));
    }

    /// Alerts for a tenant, optionally filtered by resolution state
    pub async fn get_alerts(&self, tenant_id: &str, resolved: Option<bool>) -> Vec<ResourceAlert> {
        let state = self.state.read().await;
        state
            .alerts
            .get(tenant_id)
            .map(|alerts| {
                alerts
                    .iter()
                    .filter(|a| resolved.map_or(true, |r| a.resolved == r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn resolve_alert(&self, tenant_id: &str, alert_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        let Some(alert) = state
            .alerts
            .get_mut(tenant_id)
            .and_then(|alerts| alerts.iter_mut().find(|a| a.alert_id == alert_id))
        else {
            return false;
        };
        if alert.resolved {
            return false;
        }
        alert.resolved = true;
        alert.resolved_at = Some(Utc::now());
        info!("Resolved {} alert {} for tenant {}", alert.level, alert_id, tenant_id);
        true
    }

    //===============================================================
    // Reporting
    //===============================================================

    pub async fn get_tenant_stats(&self, tenant_id: &str) -> TenantResourceStats {
        let now = Utc::now();
        let state = self.state.read().await;

        let mut types: Vec<ResourceType> = self.defaults.keys().copied().collect();
        if let Some(quotas) = state.quotas.get(tenant_id) {
            types.extend(quotas.keys().copied());
        }
        if let Some(counters) = state.counters.get(tenant_id) {
            types.extend(counters.keys().copied());
        }
        types.sort_by_key(|r| r.as_str());
        types.dedup();

        let resources = types
            .into_iter()
            .map(|resource_type| {
                let usage = state.usage(&self.defaults, tenant_id, resource_type, now);
                let quota = state.quota(&self.defaults, tenant_id, resource_type);
                (
                    resource_type,
                    ResourceUsageSummary {
                        usage,
                        limit: quota.map(|q| q.limit_value),
                        ratio: quota.map(|q| q.usage_ratio(usage)),
                        quota_type: quota.map(|q| q.quota_type),
                    },
                )
            })
            .collect();

        let alerts: &[ResourceAlert] = state
            .alerts
            .get(tenant_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let open: Vec<&ResourceAlert> = alerts.iter().filter(|a| !a.resolved).collect();

        TenantResourceStats {
            tenant_id: tenant_id.to_string(),
            resources,
            total_alerts: alerts.len(),
            active_alerts: open.len(),
            critical_alerts: open
                .iter()
                .filter(|a| a.level >= AlertLevel::Critical)
                .count(),
            last_updated: now,
        }
    }

    pub async fn get_global_stats(&self) -> ResourceGlobalStats {
        let state = self.state.read().await;
        let mut tenants: Vec<&String> = state
            .counters
            .keys()
            .chain(state.quotas.keys())
            .collect();
        tenants.sort();
        tenants.dedup();

        ResourceGlobalStats {
            monitored_tenants: tenants.len(),
            active_alerts: state
                .alerts
                .values()
                .flatten()
                .filter(|a| !a.resolved)
                .count(),
            quota_violations: state.quota_violations,
            total_resource_requests: state.total_resource_requests,
            total_quotas: state.quotas.values().map(HashMap::len).sum(),
            last_monitoring: state.last_monitoring,
            process_cpu_percent: state.process_cpu_percent,
            process_memory_mb: state.process_memory_mb,
        }
    }

    /// Human-readable hints about high usage, open critical alerts and growth
    pub async fn suggest_optimizations(&self, tenant_id: &str) -> Vec<String> {
        let stats = self.get_tenant_stats(tenant_id).await;
        let mut suggestions = Vec::new();

        for resource_type in [ResourceType::Memory, ResourceType::Cpu, ResourceType::Instances] {
            let Some(ratio) = stats.resources.get(&resource_type).and_then(|s| s.ratio) else {
                continue;
            };
            if ratio > 0.8 {
                let hint = match resource_type {
                    ResourceType::Memory => "consider releasing cached data or raising the memory quota",
                    ResourceType::Cpu => "consider spreading work over time or raising the cpu quota",
                    _ => "consider clearing idle instances or raising the instance quota",
                };
                suggestions.push(format!(
                    "{} usage is at {:.0}% of quota; {}",
                    resource_type,
                    ratio * 100.0,
                    hint
                ));
            }
        }

        let critical: Vec<ResourceAlert> = self
            .get_alerts(tenant_id, Some(false))
            .await
            .into_iter()
            .filter(|a| a.level >= AlertLevel::Critical)
            .collect();
        if !critical.is_empty() {
            suggestions.push(format!(
                "{} unresolved critical alerts need attention",
                critical.len()
            ));
        }

        let history: Vec<ResourceUsage> = self
            .state
            .read()
            .await
            .history
            .get(tenant_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        if history.len() >= GROWTH_WINDOW {
            let mean = |samples: &[ResourceUsage]| {
                samples.iter().map(|u| u.usage_value).sum::<f64>() / samples.len() as f64
            };
            let early = mean(&history[..GROWTH_WINDOW]);
            let recent = mean(&history[history.len() - GROWTH_WINDOW..]);
            if recent > early * 1.5 {
                suggestions.push(format!(
                    "usage is growing quickly (recent mean {:.1} vs earlier {:.1}); review capacity planning",
                    recent, early
                ));
            }
        }

        suggestions
    }

    //===============================================================
    // Tenant data
    //===============================================================

    /// Forget every quota, counter, sample and alert of a tenant
    pub async fn cleanup_tenant_data(&self, tenant_id: &str) -> bool {
        let mut state = self.state.write().await;
        let had_quotas = state.quotas.remove(tenant_id).is_some();
        let had_usage = state.counters.remove(tenant_id).is_some();
        let had_history = state.history.remove(tenant_id).is_some();
        let had_alerts = state.alerts.remove(tenant_id).is_some();

        let removed = had_quotas || had_usage || had_history || had_alerts;
        if removed {
            info!("Cleared resource data for tenant {}", tenant_id);
        }
        removed
    }

    /// Tenant-specific quotas as JSON
    pub async fn export_tenant_config(&self, tenant_id: &str) -> Result<String> {
        let state = self.state.read().await;
        let mut quotas: Vec<ResourceQuota> = state
            .quotas
            .get(tenant_id)
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default();
        quotas.sort_by_key(|q| q.resource_type.as_str());

        let export = TenantQuotaExport {
            tenant_id: tenant_id.to_string(),
            quotas,
            exported_at: Utc::now(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Apply quotas from an export; returns how many were accepted
    pub async fn import_tenant_config(&self, json: &str) -> Result<usize> {
        let export: TenantQuotaExport = serde_json::from_str(json)?;
        let mut applied = 0;
        for quota in export.quotas {
            if self.set_quota(&export.tenant_id, quota).await {
                applied += 1;
            }
        }
        info!(
            "Imported {} quotas for tenant {}",
            applied, export.tenant_id
        );
        Ok(applied)
    }

    //===============================================================
    // Background sampling
    //===============================================================

    /// Spawn the periodic process sampler
    pub async fn start(&self) {
        let mut task = self.monitor_task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let state = self.state.clone();
        let token = self.cancel.clone();
        let period = self.config.monitoring_interval();

        *task = Some(tokio::spawn(async move {
            let mut sampler = ProcessSampler::new();
            let mut ticker = time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = sampler.sample();
                        let mut state = state.write().await;
                        state.last_monitoring = Some(Utc::now());
                        match sample {
                            Some(snapshot) => {
                                state.process_cpu_percent = Some(snapshot.cpu_percent);
                                state.process_memory_mb = Some(snapshot.memory_mb);
                            }
                            None => error!("Could not sample process resources"),
                        }
                    }
                }
            }
            debug!("Resource monitoring stopped");
        }));
        info!("Resource monitoring started");
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.monitor_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Resource monitoring task ended abnormally: {}", e);
            }
        }
        info!("Tenant resource manager shut down");
    }
}

impl Default for TenantResourceManager {
    fn default() -> Self {
        Self::new(ResourceManagerConfig::default())
    }
}

fn validate_quota(quota: &ResourceQuota) -> Result<()> {
    if !quota.limit_value.is_finite() || quota.limit_value < 0.0 {
        return Err(RuntimeError::InvalidInput(format!(
            "limit must be a non-negative number, got {}",
            quota.limit_value
        )));
    }
    let (warning, critical) = (quota.warning_threshold, quota.critical_threshold);
    if !(0.0..=1.0).contains(&warning) || !(0.0..=1.0).contains(&critical) || warning > critical {
        return Err(RuntimeError::InvalidInput(format!(
            "thresholds must satisfy 0 <= warning ({}) <= critical ({}) <= 1",
            warning, critical
        )));
    }
    Ok(())
}
