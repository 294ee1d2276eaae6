// Lifecycle domain types
// State machine, lifecycle events, per-instance policy and metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a tracked instance
///
/// ```text
///   Creating ──▶ Active ⇄ Inactive
///      │          │  ▲ ⇅
///      │          │  │ Paused
///      │          ▼  │
///      │         Error
///      ▼          ▼
///   Terminating ──▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Active,
    Inactive,
    Paused,
    Error,
    Terminating,
    Terminated,
}

impl InstanceState {
    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Creating, Error)
                | (Creating, Terminating)
                | (Active, Inactive)
                | (Active, Paused)
                | (Active, Error)
                | (Active, Terminating)
                | (Inactive, Active)
                | (Inactive, Error)
                | (Inactive, Terminating)
                | (Paused, Active)
                | (Paused, Error)
                | (Paused, Terminating)
                | (Error, Active)
                | (Error, Terminating)
                | (Terminating, Terminated)
        )
    }

    /// States that count as "running" for error transitions
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Active | InstanceState::Inactive | InstanceState::Paused
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminating | InstanceState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Creating => "creating",
            InstanceState::Active => "active",
            InstanceState::Inactive => "inactive",
            InstanceState::Paused => "paused",
            InstanceState::Error => "error",
            InstanceState::Terminating => "terminating",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points in the lifecycle where hooks can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    BeforeCreate,
    AfterCreate,
    BeforeActivate,
    AfterActivate,
    BeforeDeactivate,
    AfterDeactivate,
    BeforeCleanup,
    AfterCleanup,
    OnError,
    OnHealthCheck,
}

/// Per-instance lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Idle time after which the sweep reclaims the instance
    pub max_inactive_minutes: u64,

    /// Health-check loop period; zero disables the loop
    pub health_check_interval_ms: u64,

    pub max_error_count: u32,
    pub auto_cleanup: bool,
    pub retry_on_error: bool,
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub enable_metrics: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_inactive_minutes: 30,
            health_check_interval_ms: 60_000,
            max_error_count: 3,
            auto_cleanup: true,
            retry_on_error: true,
            max_retry_attempts: 3,
            retry_delay_ms: 1000,
            enable_metrics: true,
        }
    }
}

impl LifecycleConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_inactive(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_inactive_minutes as i64)
    }
}

/// Metrics tracked for one lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetrics {
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub health_check_count: u64,

    /// Accumulated time spent ACTIVE, in seconds
    pub active_duration_secs: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

impl InstanceMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            activated_at: None,
            last_active_at: now,
            last_health_check: None,
            error_count: 0,
            health_check_count: 0,
            active_duration_secs: 0.0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
        }
    }

    /// Fold the time since activation into the active-duration total
    pub fn close_active_period(&mut self) {
        if let Some(activated_at) = self.activated_at.take() {
            let elapsed = Utc::now() - activated_at;
            self.active_duration_secs += elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

impl Default for InstanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate lifecycle manager statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub total_instances: usize,
    pub active_instances: usize,
    pub error_instances: usize,
    pub cleaned_instances: u64,
    pub health_checks_performed: u64,
    pub errors_detected: u64,
    pub auto_cleanups_performed: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl LifecycleStats {
    /// Share of tracked instances currently in ERROR
    pub fn error_rate(&self) -> f64 {
        if self.total_instances == 0 {
            return 0.0;
        }
        self.error_instances as f64 / self.total_instances as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_edges() {
        use InstanceState::*;
        assert!(Creating.can_transition_to(Active));
        assert!(Active.can_transition_to(Inactive));
        assert!(Inactive.can_transition_to(Active));
        assert!(Error.can_transition_to(Active));
        assert!(Terminating.can_transition_to(Terminated));

        assert!(!Terminated.can_transition_to(Active));
        assert!(!Active.can_transition_to(Creating));
        assert!(!Inactive.can_transition_to(Creating));
        assert!(!Terminating.can_transition_to(Active));
        assert!(!Error.can_transition_to(Inactive));
    }

    #[test]
    fn test_active_duration_accumulates() {
        let mut metrics = InstanceMetrics::new();
        metrics.activated_at = Some(Utc::now() - chrono::Duration::seconds(2));
        metrics.close_active_period();
        assert!(metrics.active_duration_secs >= 2.0);
        assert!(metrics.activated_at.is_none());

        // closing twice adds nothing
        let before = metrics.active_duration_secs;
        metrics.close_active_period();
        assert_eq!(metrics.active_duration_secs, before);
    }
}
