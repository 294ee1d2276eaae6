// Resource quota domain types
// Resource kinds, quota definitions, usage samples and alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::RuntimeError;

/// Resource kinds a tenant can consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Network,
    Instances,
    Requests,
    Tokens,
    ApiCalls,
    Storage,
    Bandwidth,
}

impl ResourceType {
    pub const ALL: [ResourceType; 10] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Disk,
        ResourceType::Network,
        ResourceType::Instances,
        ResourceType::Requests,
        ResourceType::Tokens,
        ResourceType::ApiCalls,
        ResourceType::Storage,
        ResourceType::Bandwidth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Disk => "disk",
            ResourceType::Network => "network",
            ResourceType::Instances => "instances",
            ResourceType::Requests => "requests",
            ResourceType::Tokens => "tokens",
            ResourceType::ApiCalls => "api_calls",
            ResourceType::Storage => "storage",
            ResourceType::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| RuntimeError::InvalidInput(format!("unknown resource type '{}'", s)))
    }
}

/// Quota flavours
///
/// All flavours share the same linear threshold check; they differ only in
/// the `reset_interval` they are usually configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    HardLimit,
    SoftLimit,
    BurstLimit,
    DailyLimit,
    MonthlyLimit,
}

impl FromStr for QuotaType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard_limit" => Ok(QuotaType::HardLimit),
            "soft_limit" => Ok(QuotaType::SoftLimit),
            "burst_limit" | "burst" => Ok(QuotaType::BurstLimit),
            "daily_limit" | "daily" => Ok(QuotaType::DailyLimit),
            "monthly_limit" | "monthly" => Ok(QuotaType::MonthlyLimit),
            other => Err(RuntimeError::InvalidInput(format!(
                "unknown quota type '{}'",
                other
            ))),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// A configured ceiling on one resource for one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub resource_type: ResourceType,
    pub quota_type: QuotaType,
    pub limit_value: f64,

    /// Filled in from the tenant's counter when the quota is read back
    pub current_usage: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub time_window: Option<Duration>,

    /// Usage is zeroed once this much time has passed since `last_reset`
    pub reset_interval: Option<Duration>,
    pub last_reset: DateTime<Utc>,
}

impl ResourceQuota {
    pub fn new(resource_type: ResourceType, quota_type: QuotaType, limit_value: f64) -> Self {
        Self {
            resource_type,
            quota_type,
            limit_value,
            current_usage: 0.0,
            warning_threshold: 0.8,
            critical_threshold: 0.95,
            time_window: None,
            reset_interval: None,
            last_reset: Utc::now(),
        }
    }

    pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self
    }

    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = Some(interval);
        self
    }

    pub fn usage_ratio(&self, usage: f64) -> f64 {
        if self.limit_value <= 0.0 {
            return if usage > 0.0 { f64::INFINITY } else { 0.0 };
        }
        usage / self.limit_value
    }

    pub fn remaining(&self, usage: f64) -> f64 {
        (self.limit_value - usage).max(0.0)
    }

    /// Alert level warranted by `usage`, if any
    pub fn level_for(&self, usage: f64) -> Option<AlertLevel> {
        let ratio = self.usage_ratio(usage);
        if ratio >= self.critical_threshold {
            Some(AlertLevel::Critical)
        } else if ratio >= self.warning_threshold {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }
}

/// Quotas applied to tenants that have none of their own
pub fn default_quotas() -> HashMap<ResourceType, ResourceQuota> {
    let mut quotas = HashMap::new();
    for quota in [
        ResourceQuota::new(ResourceType::Cpu, QuotaType::SoftLimit, 80.0),
        ResourceQuota::new(ResourceType::Memory, QuotaType::SoftLimit, 1024.0),
        ResourceQuota::new(ResourceType::Instances, QuotaType::HardLimit, 100.0),
        ResourceQuota::new(ResourceType::Requests, QuotaType::DailyLimit, 10_000.0),
        ResourceQuota::new(ResourceType::Tokens, QuotaType::MonthlyLimit, 1_000_000.0),
    ] {
        quotas.insert(quota.resource_type, quota);
    }
    quotas
}

/// One recorded usage sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tenant_id: String,
    pub resource_type: ResourceType,

    /// Amount recorded by this call
    pub amount: f64,

    /// Running counter after this call
    pub usage_value: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// Threshold alert raised by usage recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub alert_id: Uuid,
    pub tenant_id: String,
    pub resource_type: ResourceType,
    pub level: AlertLevel,
    pub message: String,
    pub current_usage: f64,
    pub limit_value: f64,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ResourceAlert {
    pub fn new(tenant_id: &str, quota: &ResourceQuota, level: AlertLevel, usage: f64) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            resource_type: quota.resource_type,
            level,
            message: format!(
                "Resource {} usage ({}) exceeds {} threshold",
                quota.resource_type, usage, level
            ),
            current_usage: usage,
            limit_value: quota.limit_value,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
        }
    }
}

/// Usage against quota for one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsageSummary {
    pub usage: f64,
    pub limit: Option<f64>,
    pub ratio: Option<f64>,
    pub quota_type: Option<QuotaType>,
}

/// Per-tenant resource statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantResourceStats {
    pub tenant_id: String,
    pub resources: HashMap<ResourceType, ResourceUsageSummary>,
    pub total_alerts: usize,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    pub last_updated: DateTime<Utc>,
}

/// Process-wide resource manager statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGlobalStats {
    pub monitored_tenants: usize,
    pub active_alerts: usize,
    pub quota_violations: u64,
    pub total_resource_requests: u64,
    pub total_quotas: usize,
    pub last_monitoring: Option<DateTime<Utc>>,

    /// Latest host process sample taken by the monitoring loop
    pub process_cpu_percent: Option<f64>,
    pub process_memory_mb: Option<f64>,
}

/// Exportable tenant quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantQuotaExport {
    pub tenant_id: String,
    pub quotas: Vec<ResourceQuota>,
    pub exported_at: DateTime<Utc>,
}
