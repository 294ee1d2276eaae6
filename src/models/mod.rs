// Core domain models for the instance runtime
// Plain data types shared by every engine component

//! # Domain Models Module
//!
//! This module holds the data the runtime passes around: isolation scopes,
//! the managed-instance trait and its capabilities, lifecycle states, quota
//! definitions and monitoring records. Nothing in here owns a lock or spawns
//! a task; the engine components in [`crate::engine`] do that.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects and Capabilities
//! [`ManagedInstance`] is used as `Arc<dyn ManagedInstance>`. Optional
//! behaviour is exposed through accessor methods that return
//! `Option<&dyn Capability>`, so callers detect support with a plain
//! `if let Some(..)` instead of probing attributes at runtime.

// Isolation scopes and instance key derivation
pub mod context;

// ManagedInstance trait, capability traits, InstanceInfo
pub mod instance;

// Lifecycle state machine, events, policy and metrics
pub mod lifecycle;

// Resource kinds, quotas, usage samples and alerts
pub mod quota;

// Health verdicts, metrics, diagnostic events and spans
pub mod monitoring;

pub use context::{instance_key, IsolationContext, IsolationLevel, IsolationScope, GLOBAL_CHAT_SCOPE};
pub use instance::{
    downcast_instance, downcast_ref, AsAny, Cleanup, FactoryRequest, HealthCheckable,
    InstanceInfo, ManagedInstance, Recoverable,
};
pub use lifecycle::{InstanceMetrics, InstanceState, LifecycleConfig, LifecycleEvent, LifecycleStats};
pub use monitoring::{
    CallSpan, DiagnosticEvent, HealthCheckOutcome, HealthCheckResult, HealthStatus,
    InstanceHealthReport, MetricAggregate, MetricSample, MetricType, MonitoringStats,
    PerformanceSnapshot, SeverityLevel, SpanStatus, SystemOverview,
};
pub use quota::{
    default_quotas, AlertLevel, QuotaType, ResourceAlert, ResourceGlobalStats, ResourceQuota,
    ResourceType, ResourceUsage, ResourceUsageSummary, TenantQuotaExport, TenantResourceStats,
};
