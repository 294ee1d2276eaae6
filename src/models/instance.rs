// Managed instance model
// The trait every runtime-held object implements, its optional capabilities,
// and the bookkeeping record kept per cached instance

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::context::IsolationContext;
use crate::Result;

/// Type-erasure helper implemented for every `'static` type
///
/// Lets a `dyn ManagedInstance` be turned back into its concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// An object whose lifetime is coordinated by the runtime
///
/// Capabilities are opt-in: an implementation overrides the accessor for each
/// capability it supports and returns `Some(self)`.
///
/// ```rust
/// use async_trait::async_trait;
/// use instance_runtime::{HealthCheckable, ManagedInstance, Result};
///
/// struct Connection;
///
/// #[async_trait]
/// impl HealthCheckable for Connection {
///     async fn health_check(&self) -> Result<bool> {
///         Ok(true)
///     }
/// }
///
/// impl ManagedInstance for Connection {
///     fn as_health_check(&self) -> Option<&dyn HealthCheckable> {
///         Some(self)
///     }
/// }
/// ```
pub trait ManagedInstance: AsAny {
    /// Short type label used in logs and `find_by_type` lookups
    fn type_label(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_health_check(&self) -> Option<&dyn HealthCheckable> {
        None
    }

    fn as_cleanup(&self) -> Option<&dyn Cleanup> {
        None
    }

    fn as_recoverable(&self) -> Option<&dyn Recoverable> {
        None
    }
}

/// Instance-side health probe
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// `Ok(false)` and `Err(_)` both count as a failed check
    async fn health_check(&self) -> Result<bool>;
}

/// Instance-side teardown hook, called only by the lifecycle manager and the
/// registry when a definition is removed
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self) -> Result<()>;
}

/// Instance-side self-repair hook used by auto-recovery
#[async_trait]
pub trait Recoverable: Send + Sync {
    async fn recover(&self) -> Result<()>;
}

/// Downcast a shared instance to its concrete type
pub fn downcast_instance<T: ManagedInstance>(instance: Arc<dyn ManagedInstance>) -> Option<Arc<T>> {
    instance.into_any_arc().downcast::<T>().ok()
}

/// Borrowing variant of [`downcast_instance`]
pub fn downcast_ref<T: ManagedInstance>(instance: &dyn ManagedInstance) -> Option<&T> {
    instance.as_any().downcast_ref::<T>()
}

/// Arguments handed to an instance factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryRequest {
    pub instance_type: String,
    pub context: IsolationContext,

    /// Free-form creation parameters supplied by the caller
    pub params: HashMap<String, Value>,
}

impl FactoryRequest {
    pub fn new<S: Into<String>>(instance_type: S, context: IsolationContext) -> Self {
        Self {
            instance_type: instance_type.into(),
            context,
            params: HashMap::new(),
        }
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Typed parameter lookup; `None` when absent or of the wrong shape
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Bookkeeping record for one cached instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Derived key `type:tenant:agent[:chat_stream|:platform]`
    pub instance_id: String,
    pub instance_type: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub chat_stream_id: Option<String>,
    pub platform: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,

    /// Cleared by an explicit release; a released entry is never served again
    pub is_active: bool,
    pub metadata: HashMap<String, Value>,
}

impl InstanceInfo {
    /// Fresh record for a just-created instance; creation counts as one access
    pub fn new(instance_type: &str, context: &IsolationContext) -> Self {
        let now = Utc::now();
        Self {
            instance_id: context.instance_key(instance_type),
            instance_type: instance_type.to_string(),
            tenant_id: context.tenant_id.clone(),
            agent_id: context.agent_id.clone(),
            chat_stream_id: context.chat_stream_id.clone(),
            platform: context.platform.clone(),
            created_at: now,
            last_accessed: now,
            access_count: 1,
            is_active: true,
            metadata: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    pub fn is_expired(&self, max_inactive: ChronoDuration) -> bool {
        if !self.is_active {
            return true;
        }
        Utc::now() - self.last_accessed > max_inactive
    }

    pub fn context(&self) -> IsolationContext {
        IsolationContext {
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            platform: self.platform.clone(),
            chat_stream_id: self.chat_stream_id.clone(),
        }
    }
}
