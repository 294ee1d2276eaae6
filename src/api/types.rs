// Instance Manager API types
// Requests, quota specs and structured operation results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::engine::global_manager::GlobalManagerStats;
use crate::engine::registry::RegistryStats;
use crate::models::{
    HealthStatus, IsolationContext, LifecycleStats, QuotaType, ResourceGlobalStats, ResourceQuota,
    ResourceType, ResourceUsageSummary, SystemOverview,
};

/// Everything needed to look up or create one isolated instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub instance_type: String,
    pub tenant_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub chat_stream_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,

    /// When false only an already cached instance is returned
    #[serde(default = "default_true")]
    pub auto_create: bool,

    /// Passed through to the factory
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl InstanceRequest {
    pub fn new(instance_type: &str, tenant_id: &str, agent_id: &str) -> Self {
        Self {
            instance_type: instance_type.to_string(),
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            chat_stream_id: None,
            platform: None,
            auto_create: true,
            params: HashMap::new(),
        }
    }

    pub fn chat_stream(mut self, chat_stream_id: &str) -> Self {
        self.chat_stream_id = Some(chat_stream_id.to_string());
        self
    }

    pub fn platform(mut self, platform: &str) -> Self {
        self.platform = Some(platform.to_string());
        self
    }

    pub fn param<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Only consult the cache
    pub fn lookup_only(mut self) -> Self {
        self.auto_create = false;
        self
    }

    pub fn context(&self) -> IsolationContext {
        IsolationContext::from_parts(
            &self.tenant_id,
            &self.agent_id,
            self.platform.as_deref(),
            self.chat_stream_id.as_deref(),
        )
    }

    pub fn instance_id(&self) -> String {
        self.context().instance_key(&self.instance_type)
    }
}

/// Quota settings as supplied by tenant provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSpec {
    pub quota_type: QuotaType,
    pub limit_value: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub reset_interval_secs: Option<u64>,
}

impl Default for QuotaSpec {
    fn default() -> Self {
        Self {
            quota_type: QuotaType::SoftLimit,
            limit_value: 0.0,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            reset_interval_secs: None,
        }
    }
}

impl QuotaSpec {
    pub fn new(quota_type: QuotaType, limit_value: f64) -> Self {
        Self {
            quota_type,
            limit_value,
            ..Self::default()
        }
    }

    pub fn into_quota(self, resource_type: ResourceType) -> ResourceQuota {
        let mut quota = ResourceQuota::new(resource_type, self.quota_type, self.limit_value)
            .with_thresholds(self.warning_threshold, self.critical_threshold);
        if let Some(secs) = self.reset_interval_secs {
            quota = quota.with_reset_interval(std::time::Duration::from_secs(secs));
        }
        quota
    }
}

/// Outcome of one instance operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOperationResult {
    pub success: bool,
    pub message: String,
    pub instance_id: Option<String>,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InstanceOperationResult {
    pub fn succeeded<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            message: message.into(),
            instance_id: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            ..Self::succeeded(message)
        }
    }

    pub fn with_instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error<E: ToString>(mut self, error: E) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Outcome of a batch of instance operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperationResult {
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<InstanceOperationResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BatchOperationResult {
    /// Tally `results`, closing the batch now
    pub fn from_results(results: Vec<InstanceOperationResult>, start_time: DateTime<Utc>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total_count: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            results,
            start_time,
            end_time: Utc::now(),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_count as f64
    }

    /// At least as many successes as failures, and not empty
    pub fn success(&self) -> bool {
        self.success_count >= self.failure_count && self.total_count > 0
    }
}

/// Answer to "can this tenant take N more units"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub tenant_id: String,
    pub resource_type: String,
    pub available: bool,
    pub remaining: Option<f64>,
    pub required: f64,
    pub sufficient: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl HealthCounts {
    pub fn add(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
            HealthStatus::Unknown => self.unknown += 1,
        }
    }
}

/// Everything known about one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub instance_counts: BTreeMap<String, usize>,
    pub total_instances: usize,
    pub resources: HashMap<ResourceType, ResourceUsageSummary>,
    pub health_status: HealthCounts,
    pub active_alerts: usize,
}

/// Statistics of every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub timestamp: DateTime<Utc>,
    pub global_manager: GlobalManagerStats,
    pub lifecycle_manager: LifecycleStats,
    pub registry: RegistryStats,
    pub resource_manager: ResourceGlobalStats,
    pub monitoring: SystemOverview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,

    /// The ratio or count the status was derived from, if any
    pub indicator: Option<f64>,
    pub stats: Value,
}

/// System health rollup; the overall status is the worst component status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_success_rules() {
        let start = Utc::now();
        let empty = BatchOperationResult::from_results(Vec::new(), start);
        assert!(!empty.success());
        assert_eq!(empty.success_rate(), 0.0);

        let mixed = BatchOperationResult::from_results(
            vec![
                InstanceOperationResult::succeeded("ok"),
                InstanceOperationResult::failed("no").with_error("boom"),
            ],
            start,
        );
        assert_eq!(mixed.failure_count, 1);
        assert!(mixed.success());
        assert_eq!(mixed.success_rate(), 0.5);
        assert!(mixed.duration_seconds() >= 0.0);
    }

    #[test]
    fn test_request_key() {
        let request = InstanceRequest::new("echo", "t1", "a1").chat_stream("c1").platform("qq");
        assert_eq!(request.instance_id(), "echo:t1:a1:c1");
        assert!(request.auto_create);
        assert!(!request.lookup_only().auto_create);
    }

    #[test]
    fn test_quota_spec_defaults() {
        let spec: QuotaSpec = serde_json::from_value(serde_json::json!({ "limit_value": 50 })).unwrap();
        assert_eq!(spec.quota_type, QuotaType::SoftLimit);
        let quota = spec.into_quota(ResourceType::Requests);
        assert_eq!(quota.limit_value, 50.0);
        assert_eq!(quota.warning_threshold, 0.8);
    }
}
