// Instance Runtime - Rust Edition
// Multi-tenant instance and resource coordination for chat-agent platforms

//! # Instance Runtime Library
//!
//! Every tenant/agent pair that needs a stateful service object (a config
//! manager, a chat manager, a connection) obtains it through this runtime
//! instead of constructing it directly. The runtime guarantees that each
//! (tenant, agent, optional chat stream) tuple maps to at most one live
//! instance of a given type, tracks that instance's lifecycle and health,
//! and enforces per-tenant resource quotas.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`IsolationContext`]: the (tenant, agent, platform, chat stream) scope key
//! - [`ManagedInstance`]: trait implemented by every runtime-held object, with
//!   optional [`HealthCheckable`], [`Cleanup`] and [`Recoverable`] capabilities
//! - [`InstanceState`]: lifecycle state machine
//!
//! ### Engine
//! - [`InstanceRegistry`]: dependency-injection container with scoped caching
//!   and cycle rejection
//! - [`GlobalInstanceManager`]: weak-reference instance cache backed by
//!   per-type factories
//! - [`InstanceLifecycleManager`]: per-instance state machine, health loop,
//!   retry policy and expiry sweep
//! - [`TenantResourceManager`]: usage counters, quotas and threshold alerts
//! - [`InstanceMonitoringSystem`]: metrics, health checkers, diagnostic rules,
//!   call tracing and auto-recovery
//!
//! ### Facade
//! [`InstanceManagerApi`] composes all of the above and is the only type the
//! rest of an application should need.
//!
//! **Usage Example:**
//! ```rust,no_run
//! use std::sync::Arc;
//! use instance_runtime::{FactoryRequest, InstanceManagerApi, ManagedInstance, RuntimeConfig};
//!
//! struct ChatManager;
//! impl ManagedInstance for ChatManager {}
//!
//! # async fn demo() -> instance_runtime::Result<()> {
//! let api = InstanceManagerApi::new(RuntimeConfig::default());
//! api.global_manager()
//!     .register_typed_factory("chat_manager", |_req: FactoryRequest| async { Ok(ChatManager) })
//!     .await;
//!
//! let chat = api.get_isolated_instance("chat_manager", "tenant-1", "agent-1").await;
//! assert!(chat.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Ownership Instead of Garbage Collection
//! The instance cache stores `Weak<dyn ManagedInstance>`. Whoever receives the
//! `Arc` from a lookup owns the instance; once every `Arc` is dropped the cache
//! entry goes stale and the next lookup creates a fresh instance.
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure.

// Core domain models
pub mod models;

// Engine components (registry, caches, lifecycle, quotas, monitoring)
pub mod engine;

// Facade API composing the engine components
pub mod api;

// Layered runtime configuration
pub mod config;

// Re-export core domain types for easy access
pub use models::{
    downcast_instance, instance_key, AlertLevel, CallSpan, Cleanup, DiagnosticEvent,
    FactoryRequest, HealthCheckOutcome, HealthCheckable, HealthStatus, InstanceInfo,
    InstanceState, IsolationContext, IsolationLevel, LifecycleConfig, LifecycleEvent,
    ManagedInstance, QuotaType, Recoverable, ResourceAlert, ResourceQuota, ResourceType,
    SeverityLevel, SpanStatus,
};

// Re-export engine types for convenience
pub use engine::{
    global_manager::{GlobalInstanceManager, InstanceFactory, InstanceFilter},
    lifecycle::{InstanceLifecycleManager, LifecycleHook},
    monitoring::{HealthChecker, InstanceMonitoringSystem},
    registry::{
        DependencyType, InjectionContext, Injectable, InstanceDefinition, InstanceRegistry,
        InstanceScope, ResolutionContext,
    },
    resources::TenantResourceManager,
};

pub use api::{
    types::{BatchOperationResult, InstanceOperationResult, InstanceRequest, QuotaSpec},
    InstanceManagerApi,
};

pub use config::RuntimeConfig;

// Core error types
use thiserror::Error;

/// Errors produced inside the runtime
///
/// Public contracts that promise a boolean or `Option` convert these into
/// `false`/`None` after logging; internal code propagates them with `?`.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No factory registered for an instance type
    #[error("No factory registered for instance type: {0}")]
    FactoryNotFound(String),

    /// A registry definition does not exist
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),

    /// A registry definition exists but is disabled
    #[error("Definition disabled: {0}")]
    DefinitionDisabled(String),

    /// A declared dependency could not be resolved
    #[error("Dependency '{dependency}' of '{name}' not found")]
    DependencyNotFound { name: String, dependency: String },

    /// The dependency graph contains a cycle through this definition
    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// A lifecycle transition not permitted by the state machine
    #[error("Invalid state transition for {instance_id} from {from} to {to}")]
    InvalidTransition {
        instance_id: String,
        from: String,
        to: String,
    },

    /// The instance is not tracked by the component that was asked
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// The tracked object was dropped by its owner while still tracked
    #[error("Instance collected while still tracked: {0}")]
    InstanceCollected(String),

    /// An instance reported itself unhealthy
    #[error("Health check failed for {0}")]
    HealthCheckFailed(String),

    /// Admission refused because of a quota
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Error when invalid input is provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A factory or constructor failed
    #[error("Factory error: {0}")]
    Factory(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Errors bubbling up from host-supplied code
    #[error("External error: {0}")]
    External(#[from] anyhow::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, RuntimeError>;
