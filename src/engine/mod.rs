// Instance Runtime Engine
// The stateful components that create, track, meter and watch instances

//! # Instance Runtime Engine Module
//!
//! This module contains the components that own runtime state. The data
//! they pass around lives in [`crate::models`]; the facade that wires them
//! together lives in [`crate::api`].
//!
//! ## Engine Components
//!
//! ### Instance Registry (`registry` module)
//! - Named instance definitions with scopes and dependencies
//! - Dependency injection with cycle detection
//! - At-most-one construction per scope key under concurrency
//!
//! ### Global Instance Manager (`global_manager` module)
//! - Per-type factories
//! - Weak cache of isolated instances keyed by isolation scope
//! - Background expiry of idle entries
//!
//! ### Lifecycle Manager (`lifecycle` module)
//! - State machine from CREATING to TERMINATED
//! - Prioritized hooks around every transition
//! - Per-instance health loop, error retry and an inactivity sweep
//!
//! ### Tenant Resource Manager (`resources` module)
//! - Quotas with warning and critical thresholds
//! - Usage accounting with periodic resets and bounded history
//! - Alerts with callbacks and optimization suggestions
//!
//! ### Monitoring (`monitoring`, `metrics`, `spans` modules)
//! - Pluggable health checkers and diagnostic rules
//! - Bounded metric series with windowed aggregates
//! - Causal call spans grouped into traces
//!
//! ## Rust Learning Notes:
//!
//! ### Cloneable Handles
//! Every component is a cheap `Clone` handle over `Arc<RwLock<..>>` state.
//! Cloning one into a spawned task or a hook shares the same state, which
//! is how the facade lets a lifecycle hook reach the cache and the quota
//! manager without reference cycles.
//!
//! ### Background Tasks
//! Loops started by `start()` select on a `CancellationToken` and an
//! interval tick; `shutdown()` cancels the token and awaits the handle.

/// Instance definitions and dependency injection
///
/// Contains:
/// - InstanceRegistry with scoped caching
/// - InstanceDefinition builder and the Injectable trait
/// - Cycle detection over the dependency graph
pub mod registry;

/// Process-wide cache of isolated instances
pub mod global_manager;

/// Lifecycle state machine, hooks, health loop and sweep
pub mod lifecycle;

/// Tenant quotas, usage accounting and alerts
pub mod resources;

/// Health checkers, diagnostics and the monitoring loop
pub mod monitoring;

// Metric series and process sampling
pub mod metrics;

// Call span bookkeeping
pub mod spans;


#[cfg(test)]
mod global_manager_tests;


#[cfg(test)]
mod resources_tests;

#[cfg(test)]
mod monitoring_tests;

// Re-export main engine types for clean API access

pub use global_manager::{
    AcquiredInstance, GlobalInstanceManager, GlobalManagerStats, InstanceFactory, InstanceFilter,
};
pub use lifecycle::{HookContext, InstanceLifecycleInfo, InstanceLifecycleManager, LifecycleHook};
pub use metrics::{MetricsCollector, ProcessSampler};
pub use monitoring::{
    CheckTarget, HealthChecker, InstanceMonitoringSystem, InstanceProbeChecker, MonitorSnapshot,
    ProcessCpuChecker,
};
pub use registry::{
    DependencyType, Injectable, InjectionContext, InstanceDefinition, InstanceRegistry,
    InstanceScope, RegistryStats, ResolutionContext,
};
pub use resources::TenantResourceManager;
pub use spans::TracingManager;
