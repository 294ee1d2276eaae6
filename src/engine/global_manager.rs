// Global Instance Manager
// Weak-reference instance cache keyed by (type, tenant, agent, chat scope)

//! # Global Instance Manager
//!
//! The manager is purely an index: it stores a `Weak` handle to every instance
//! it has handed out, so the caller that receives the `Arc` owns the instance.
//! Once every owner drops its `Arc`, the entry goes stale and the next lookup
//! creates a fresh instance through the registered factory.
//!
//! ```text
//!   tenant ──▶ agent ──▶ chat scope ("global" or chat id) ──▶ instance key ──▶ Weak
//! ```
//!
//! ## Concurrency
//!
//! Cache reads and writes go through one `RwLock`, never held across a factory
//! call. Creation of a given key is serialized by a per-key gate so two
//! concurrent misses for the same key invoke the factory once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GlobalManagerConfig;
use crate::models::{
    downcast_instance, FactoryRequest, InstanceInfo, IsolationContext, ManagedInstance,
};
use crate::{Result, RuntimeError};

/// Creates instances of one logical type
///
/// Implemented automatically for async closures of the shape
/// `Fn(FactoryRequest) -> impl Future<Output = Result<Arc<dyn ManagedInstance>>>`.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    async fn create(&self, request: FactoryRequest) -> Result<Arc<dyn ManagedInstance>>;
}

#[async_trait]
impl<F, Fut> InstanceFactory for F
where
    F: Fn(FactoryRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn ManagedInstance>>> + Send,
{
    async fn create(&self, request: FactoryRequest) -> Result<Arc<dyn ManagedInstance>> {
        (self)(request).await
    }
}

/// Optional filters for [`GlobalInstanceManager::get_instance_info`]
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub tenant_id: Option<String>,
    pub agent_id: Option<String>,
    pub instance_type: Option<String>,
    pub chat_stream_id: Option<String>,
}

impl InstanceFilter {
    pub fn tenant<S: Into<String>>(mut self, tenant_id: S) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn agent<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn instance_type<S: Into<String>>(mut self, instance_type: S) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }

    pub fn chat_stream<S: Into<String>>(mut self, chat_stream_id: S) -> Self {
        self.chat_stream_id = Some(chat_stream_id.into());
        self
    }

    fn matches(&self, info: &InstanceInfo) -> bool {
        self.tenant_id.as_ref().map_or(true, |t| *t == info.tenant_id)
            && self.agent_id.as_ref().map_or(true, |a| *a == info.agent_id)
            && self
                .instance_type
                .as_ref()
                .map_or(true, |t| *t == info.instance_type)
            && self
                .chat_stream_id
                .as_ref()
                .map_or(true, |c| info.chat_stream_id.as_deref() == Some(c.as_str()))
    }
}

/// Global manager statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalManagerStats {
    pub total_instances: usize,
    pub active_instances: usize,
    pub tenants_count: usize,
    pub agents_count: usize,
    pub chats_count: usize,
    pub cleanup_runs: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub factory_invocations: u64,
}

/// Result of an acquire: the instance plus whether this call created it
pub struct AcquiredInstance {
    pub instance_id: String,
    pub instance: Arc<dyn ManagedInstance>,
    pub created: bool,
}

type ChatMap = HashMap<String, HashMap<String, Weak<dyn ManagedInstance>>>;
type AgentMap = HashMap<String, ChatMap>;

#[derive(Default)]
struct CacheState {
    // tenant -> agent -> chat scope -> instance key -> handle
    instances: HashMap<String, AgentMap>,
    info: HashMap<String, InstanceInfo>,
    cleanup_runs: u64,
    last_cleanup: Option<DateTime<Utc>>,
    factory_invocations: u64,
}

impl CacheState {
    fn handle(&self, info: &InstanceInfo) -> Option<&Weak<dyn ManagedInstance>> {
        self.instances
            .get(&info.tenant_id)?
            .get(&info.agent_id)?
            .get(chat_scope(info))?
            .get(&info.instance_id)
    }

    fn insert(&mut self, info: InstanceInfo, handle: Weak<dyn ManagedInstance>) {
        self.instances
            .entry(info.tenant_id.clone())
            .or_default()
            .entry(info.agent_id.clone())
            .or_default()
            .entry(chat_scope(&info).to_string())
            .or_default()
            .insert(info.instance_id.clone(), handle);
        self.info.insert(info.instance_id.clone(), info);
    }

    /// Remove one entry and prune any intermediate map left empty
    fn remove(&mut self, instance_id: &str) -> Option<InstanceInfo> {
        let info = self.info.remove(instance_id)?;

        if let Some(agents) = self.instances.get_mut(&info.tenant_id) {
            if let Some(chats) = agents.get_mut(&info.agent_id) {
                if let Some(entries) = chats.get_mut(chat_scope(&info)) {
                    entries.remove(instance_id);
                    if entries.is_empty() {
                        chats.remove(chat_scope(&info));
                    }
                }
                if chats.is_empty() {
                    agents.remove(&info.agent_id);
                }
            }
            if agents.is_empty() {
                self.instances.remove(&info.tenant_id);
            }
        }

        Some(info)
    }

    fn is_live(&self, info: &InstanceInfo) -> bool {
        info.is_active
            && self
                .handle(info)
                .map_or(false, |handle| handle.strong_count() > 0)
    }

    /// Drop every entry whose owner has released the instance
    fn purge_dead(&mut self) -> usize {
        let dead: Vec<String> = self
            .info
            .values()
            .filter(|info| !self.is_live(info))
            .map(|info| info.instance_id.clone())
            .collect();

        for id in &dead {
            self.remove(id);
        }
        dead.len()
    }
}

fn chat_scope(info: &InstanceInfo) -> &str {
    info.chat_stream_id
        .as_deref()
        .unwrap_or(crate::models::GLOBAL_CHAT_SCOPE)
}

/// Weak-reference cache of isolated instances
#[derive(Clone)]
pub struct GlobalInstanceManager {
    config: GlobalManagerConfig,
    factories: Arc<RwLock<HashMap<String, Arc<dyn InstanceFactory>>>>,
    state: Arc<RwLock<CacheState>>,
    creation_gates: Arc<DashMap<String, Arc<Mutex<()>>>>,
    cancel: CancellationToken,
    cleanup_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl GlobalInstanceManager {
    pub fn new(config: GlobalManagerConfig) -> Self {
        Self {
            config,
            factories: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(CacheState::default())),
            creation_gates: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            cleanup_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register (or replace) the factory for an instance type
    pub async fn register_factory<F>(&self, instance_type: &str, factory: F)
    where
        F: InstanceFactory + 'static,
    {
        let mut factories = self.factories.write().await;
        if factories
            .insert(instance_type.to_string(), Arc::new(factory))
            .is_some()
        {
            warn!("Replacing factory for instance type '{}'", instance_type);
        } else {
            info!("Registered factory for instance type '{}'", instance_type);
        }
    }

    /// Register a factory producing a concrete instance type
    pub async fn register_typed_factory<T, F, Fut>(&self, instance_type: &str, factory: F)
    where
        T: ManagedInstance,
        F: Fn(FactoryRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let erased = move |request: FactoryRequest| {
            let pending = factory(request);
            async move {
                let instance: Arc<dyn ManagedInstance> = Arc::new(pending.await?);
                Ok::<_, RuntimeError>(instance)
            }
        };
        self.register_factory(instance_type, erased).await;
    }

    pub async fn has_factory(&self, instance_type: &str) -> bool {
        self.factories.read().await.contains_key(instance_type)
    }

    pub async fn unregister_factory(&self, instance_type: &str) -> bool {
        self.factories.write().await.remove(instance_type).is_some()
    }

    pub fn create_isolation_context(
        &self,
        tenant_id: &str,
        agent_id: &str,
        platform: Option<&str>,
        chat_stream_id: Option<&str>,
    ) -> IsolationContext {
        IsolationContext::from_parts(tenant_id, agent_id, platform, chat_stream_id)
    }

    /// Get or create the instance of `instance_type` for `context`
    ///
    /// Returns `None` when no factory is registered or the factory fails;
    /// the cause is logged.
    pub async fn get_isolated_instance(
        &self,
        instance_type: &str,
        context: &IsolationContext,
        params: HashMap<String, Value>,
    ) -> Option<Arc<dyn ManagedInstance>> {
        match self.acquire(instance_type, context, params).await {
            Ok(acquired) => Some(acquired.instance),
            Err(e) => {
                error!(
                    "Failed to get instance '{}' for {}: {}",
                    instance_type, context, e
                );
                None
            }
        }
    }

    /// Typed variant of [`get_isolated_instance`](Self::get_isolated_instance)
    pub async fn get_typed_instance<T: ManagedInstance>(
        &self,
        instance_type: &str,
        context: &IsolationContext,
    ) -> Option<Arc<T>> {
        let instance = self
            .get_isolated_instance(instance_type, context, HashMap::new())
            .await?;
        let typed = downcast_instance::<T>(instance);
        if typed.is_none() {
            warn!(
                "Instance '{}' for {} is not of the requested type",
                instance_type, context
            );
        }
        typed
    }

    /// Get or create, reporting whether a new instance was created
    pub async fn acquire(
        &self,
        instance_type: &str,
        context: &IsolationContext,
        params: HashMap<String, Value>,
    ) -> Result<AcquiredInstance> {
        let instance_id = context.instance_key(instance_type);

        if let Some(instance) = self.get_cached(&instance_id).await {
            return Ok(AcquiredInstance {
                instance_id,
                instance,
                created: false,
            });
        }

        let gate = self
            .creation_gates
            .entry(instance_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _creating = gate.lock().await;

        // another caller may have finished creating while we waited
        if let Some(instance) = self.get_cached(&instance_id).await {
            return Ok(AcquiredInstance {
                instance_id,
                instance,
                created: false,
            });
        }

        let instance = match self.create_uncached(instance_type, context, params).await {
            Ok(instance) => instance,
            Err(e) => {
                // a failed key never gets an InstanceInfo, so nothing else would reclaim its gate
                self.creation_gates
                    .remove_if(&instance_id, |_, current| Arc::ptr_eq(current, &gate));
                return Err(e);
            }
        };

        let info = InstanceInfo::new(instance_type, context);
        {
            let mut state = self.state.write().await;
            state.factory_invocations += 1;
            state.insert(info, Arc::downgrade(&instance));
        }

        info!("Created instance {}", instance_id);
        Ok(AcquiredInstance {
            instance_id,
            instance,
            created: true,
        })
    }

    async fn create_uncached(
        &self,
        instance_type: &str,
        context: &IsolationContext,
        params: HashMap<String, Value>,
    ) -> Result<Arc<dyn ManagedInstance>> {
        let factory = self
            .factories
            .read()
            .await
            .get(instance_type)
            .cloned()
            .ok_or_else(|| RuntimeError::FactoryNotFound(instance_type.to_string()))?;

        let request = FactoryRequest::new(instance_type, context.clone()).with_params(params);
        factory.create(request).await
    }

    /// Number of per-key creation gates currently held
    pub(crate) fn creation_gate_count(&self) -> usize {
        self.creation_gates.len()
    }

    /// Resolve a cached entry, bumping its access info; stale entries are dropped
    pub async fn get_cached(&self, instance_id: &str) -> Option<Arc<dyn ManagedInstance>> {
        let mut state = self.state.write().await;
        let info = state.info.get(instance_id)?.clone();

        let instance = if info.is_active {
            state.handle(&info).and_then(|handle| handle.upgrade())
        } else {
            None
        };

        match instance {
            Some(instance) => {
                if let Some(info) = state.info.get_mut(instance_id) {
                    info.touch();
                }
                debug!("Cache hit for {}", instance_id);
                Some(instance)
            }
            None => {
                warn!("Dropping stale cache entry {}", instance_id);
                state.remove(instance_id);
                None
            }
        }
    }

    /// Whether a live instance is cached for this key, without touching it
    pub async fn contains_live(&self, instance_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .info
            .get(instance_id)
            .map_or(false, |info| state.is_live(info))
    }

    /// Mark an entry dead so the next lookup creates a fresh instance
    ///
    /// Returns the final record with `is_active` cleared.
    pub async fn release(&self, instance_id: &str) -> Option<InstanceInfo> {
        let released = self.state.write().await.remove(instance_id);
        self.creation_gates.remove(instance_id);

        released.map(|mut info| {
            info.is_active = false;
            debug!("Released instance {}", instance_id);
            info
        })
    }

    pub async fn get_instance_info(&self, filter: &InstanceFilter) -> Vec<InstanceInfo> {
        let state = self.state.read().await;
        let mut infos: Vec<InstanceInfo> = state
            .info
            .values()
            .filter(|info| filter.matches(info))
            .cloned()
            .collect();
        infos.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        infos
    }

    pub async fn get_info(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.state.read().await.info.get(instance_id).cloned()
    }

    /// Instances of one tenant grouped by type
    pub async fn get_tenant_instances(&self, tenant_id: &str) -> HashMap<String, Vec<InstanceInfo>> {
        let mut grouped: HashMap<String, Vec<InstanceInfo>> = HashMap::new();
        for info in self
            .get_instance_info(&InstanceFilter::default().tenant(tenant_id))
            .await
        {
            grouped
                .entry(info.instance_type.clone())
                .or_default()
                .push(info);
        }
        grouped
    }

    pub async fn tenant_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut tenants: Vec<String> = state.instances.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Drop a tenant's entries, optionally only those of one type
    pub async fn clear_tenant_instances(&self, tenant_id: &str, instance_type: Option<&str>) -> usize {
        let removed: Vec<String> = {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state
                .info
                .values()
                .filter(|info| {
                    info.tenant_id == tenant_id
                        && instance_type.map_or(true, |t| t == info.instance_type)
                })
                .map(|info| info.instance_id.clone())
                .collect();

            for id in &ids {
                state.remove(id);
            }
            let purged = state.purge_dead();
            if purged > 0 {
                debug!("Purged {} dead entries while clearing {}", purged, tenant_id);
            }
            ids
        };

        for id in &removed {
            self.creation_gates.remove(id);
        }

        info!(
            "Cleared {} instances for tenant {} (type: {})",
            removed.len(),
            tenant_id,
            instance_type.unwrap_or("all")
        );
        removed.len()
    }

    /// Remove expired and dead entries; safe to call at any time
    pub async fn clear_expired_instances(&self, max_inactive: Option<chrono::Duration>) -> usize {
        let max_inactive = max_inactive.unwrap_or_else(|| self.config.max_inactive());

        let removed: Vec<String> = {
            let mut state = self.state.write().await;
            let ids: Vec<String> = state
                .info
                .values()
                .filter(|info| info.is_expired(max_inactive) || !state.is_live(info))
                .map(|info| info.instance_id.clone())
                .collect();

            for id in &ids {
                state.remove(id);
            }
            state.cleanup_runs += 1;
            state.last_cleanup = Some(Utc::now());
            ids
        };

        for id in &removed {
            self.creation_gates.remove(id);
        }

        if !removed.is_empty() {
            info!("Expired {} cached instances", removed.len());
        }
        removed.len()
    }

    pub async fn get_stats(&self) -> GlobalManagerStats {
        let state = self.state.read().await;

        let agents_count = state.instances.values().map(|agents| agents.len()).sum();
        let chats_count = state
            .instances
            .values()
            .flat_map(|agents| agents.values())
            .map(|chats| chats.len())
            .sum();

        GlobalManagerStats {
            total_instances: state.info.len(),
            active_instances: state.info.values().filter(|i| state.is_live(i)).count(),
            tenants_count: state.instances.len(),
            agents_count,
            chats_count,
            cleanup_runs: state.cleanup_runs,
            last_cleanup: state.last_cleanup,
            factory_invocations: state.factory_invocations,
        }
    }

    /// Spawn the periodic expiry task; calling it again is a no-op
    pub async fn start(&self) {
        let mut task = self.cleanup_task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let manager = self.clone();
        let token = self.cancel.clone();
        let period = self.config.cleanup_interval();

        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.clear_expired_instances(None).await;
                        debug!("Expiry task removed {} instances", removed);
                    }
                }
            }
            debug!("Global manager expiry task stopped");
        }));
    }

    /// Stop the expiry task and drop every cached entry
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Expiry task ended abnormally: {}", e);
            }
        }

        let mut state = self.state.write().await;
        let count = state.info.len();
        state.info.clear();
        state.instances.clear();
        self.creation_gates.clear();
        info!("Global instance manager shut down, dropped {} entries", count);
    }
}

impl Default for GlobalInstanceManager {
    fn default() -> Self {
        Self::new(GlobalManagerConfig::default())
    }
}
