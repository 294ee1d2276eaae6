// Monitoring domain types
// Health verdicts, metric samples, diagnostic events and call spans

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Timer,
    Rate,
}

/// Health verdict for a single check or a whole instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Roll individual check verdicts up into one
    ///
    /// No checks yields `Unknown`; any unhealthy check wins over degraded.
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        let mut seen_any = false;
        let mut all_healthy = true;
        let mut any_unhealthy = false;

        for status in statuses {
            seen_any = true;
            match status {
                HealthStatus::Healthy => {}
                HealthStatus::Unhealthy => {
                    any_unhealthy = true;
                    all_healthy = false;
                }
                _ => all_healthy = false,
            }
        }

        if !seen_any {
            HealthStatus::Unknown
        } else if any_unhealthy {
            HealthStatus::Unhealthy
        } else if all_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// A single metric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub metric_type: MetricType,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

/// Summary over a window of samples for one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricAggregate {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
}

/// Result of one health checker run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check_name: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    pub details: HashMap<String, Value>,
}

/// What a health checker reports
#[derive(Debug, Clone)]
pub struct HealthCheckOutcome {
    pub status: HealthStatus,
    pub message: String,
    pub response_time_ms: f64,
}

impl HealthCheckOutcome {
    pub fn new<S: Into<String>>(status: HealthStatus, message: S, response_time_ms: f64) -> Self {
        Self {
            status,
            message: message.into(),
            response_time_ms,
        }
    }
}

impl<S: Into<String>> From<(HealthStatus, S, f64)> for HealthCheckOutcome {
    fn from((status, message, latency): (HealthStatus, S, f64)) -> Self {
        Self::new(status, message, latency)
    }
}

/// Recorded diagnostic finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub event_id: Uuid,
    pub instance_id: String,
    pub event_type: String,
    pub severity: SeverityLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, Value>,
    pub resolved: bool,
}

impl DiagnosticEvent {
    pub fn new<T: Into<String>, M: Into<String>>(
        instance_id: &str,
        event_type: T,
        severity: SeverityLevel,
        message: M,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            instance_id: instance_id.to_string(),
            event_type: event_type.into(),
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            details: HashMap::new(),
            resolved: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// A timed unit of work within a call trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpan {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub instance_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,

    /// Set when the span finishes
    pub duration_ms: Option<f64>,
    pub status: Option<SpanStatus>,
    pub error: Option<String>,
    pub tags: HashMap<String, String>,

    /// Creation order, breaks ties between equal start times
    pub sequence: u64,
}

impl CallSpan {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Latest sampled process figures for one monitored instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub thread_count: usize,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Health report for one monitored instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHealthReport {
    pub instance_id: String,
    pub overall_health: HealthStatus,
    pub health_checks: HashMap<String, HealthCheckResult>,
    pub performance: PerformanceSnapshot,
    pub recent_events: Vec<DiagnosticEvent>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Monitoring system counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_health_checks: u64,
    pub total_diagnostic_events: u64,
    pub total_spans: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

impl MonitoringStats {
    pub fn unhealthy_rate(&self) -> f64 {
        if self.total_instances == 0 {
            return 0.0;
        }
        self.unhealthy_instances as f64 / self.total_instances as f64
    }
}

/// System-wide monitoring overview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemOverview {
    pub stats: MonitoringStats,
    pub instance_health: HashMap<String, HealthStatus>,
    pub recent_events: usize,
    pub active_spans: usize,
    pub timestamp: DateTime<Utc>,
}
