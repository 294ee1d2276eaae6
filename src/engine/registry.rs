// Instance Registry
// Dependency-injection container with scoped caching and cycle rejection

//! # Instance Registry
//!
//! Holds [`InstanceDefinition`]s and materializes instances per scope.
//!
//! ## Scopes
//!
//! | scope       | cache key                 |
//! |-------------|---------------------------|
//! | `Singleton` | one entry per definition  |
//! | `Request`   | `request_id`              |
//! | `Session`   | `session_id`              |
//! | `Tenant`    | `tenant_id`               |
//! | `Agent`     | `tenant_id:agent_id`      |
//! | `Prototype` | never cached              |
//!
//! Missing context fields fall back to the key `default`.
//!
//! ## Resolution
//!
//! Each (definition, scope key) pair owns a `tokio::sync::OnceCell`, so
//! concurrent resolutions of the same key run the factory exactly once and a
//! failed creation leaves the cell empty. Declared dependencies are resolved
//! recursively before construction; a depth-first search over the dependency
//! graph, with visited sets local to the call, rejects cycles up front.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, error, info, warn};

use crate::models::{downcast_instance, IsolationContext, ManagedInstance};
use crate::{Result, RuntimeError};

const SINGLETON_KEY: &str = "singleton";
const DEFAULT_KEY: &str = "default";

/// Granularity at which a definition's instances are cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceScope {
    Singleton,
    Prototype,
    Request,
    Session,
    Tenant,
    Agent,
}

/// How a declared dependency is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Must resolve or the parent fails
    Required,
    /// Skipped when it fails to resolve
    Optional,
    /// Not resolved up front; see [`InjectionContext::lazy_dependency`]
    Lazy,
    /// Resolved only when its definition exists and is enabled
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub kind: DependencyType,
}

/// Context a resolution runs in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionContext {
    pub isolation: Option<IsolationContext>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub values: HashMap<String, Value>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_isolation(isolation: IsolationContext) -> Self {
        Self {
            isolation: Some(isolation),
            ..Self::default()
        }
    }

    pub fn with_request<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_session<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_value<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Cache key for `scope`; `None` for prototypes
    pub fn context_key(&self, scope: InstanceScope) -> Option<String> {
        let key = match scope {
            InstanceScope::Prototype => return None,
            InstanceScope::Singleton => SINGLETON_KEY.to_string(),
            InstanceScope::Request => self.request_id.clone().unwrap_or_else(default_key),
            InstanceScope::Session => self.session_id.clone().unwrap_or_else(default_key),
            InstanceScope::Tenant => self
                .isolation
                .as_ref()
                .map(|i| i.tenant_id.clone())
                .unwrap_or_else(default_key),
            InstanceScope::Agent => self
                .isolation
                .as_ref()
                .map(|i| format!("{}:{}", i.tenant_id, i.agent_id))
                .unwrap_or_else(default_key),
        };
        Some(key)
    }
}

fn default_key() -> String {
    DEFAULT_KEY.to_string()
}

/// Everything a constructor or factory gets to build an instance
pub struct InjectionContext {
    pub definition: String,
    pub resolution: ResolutionContext,
    config: HashMap<String, Value>,
    dependencies: HashMap<String, Arc<dyn ManagedInstance>>,
    lazy: HashMap<String, String>,
    registry: InstanceRegistry,
}

impl InjectionContext {
    /// Resolved dependency bound to constructor parameter `param`
    pub fn dependency<T: ManagedInstance>(&self, param: &str) -> Option<Arc<T>> {
        self.dependencies
            .get(param)
            .cloned()
            .and_then(downcast_instance::<T>)
    }

    pub fn dependency_instance(&self, param: &str) -> Option<Arc<dyn ManagedInstance>> {
        self.dependencies.get(param).cloned()
    }

    /// Resolve a `Lazy` dependency now
    pub async fn lazy_dependency<T: ManagedInstance>(&self, param: &str) -> Option<Arc<T>> {
        let name = self.lazy.get(param)?;
        self.registry
            .get_typed::<T>(name, &self.resolution)
            .await
    }

    /// Declared config value for `key`
    pub fn config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Config value with the constructor's own default as fallback
    pub fn config_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.config(key).unwrap_or(default)
    }

    pub fn isolation(&self) -> Option<&IsolationContext> {
        self.resolution.isolation.as_ref()
    }
}

/// Types the registry can build from their declared dependencies
#[async_trait]
pub trait Injectable: ManagedInstance + Sized {
    async fn construct(ctx: &InjectionContext) -> Result<Self>;
}

type Provider =
    Arc<dyn Fn(InjectionContext) -> BoxFuture<'static, Result<Arc<dyn ManagedInstance>>> + Send + Sync>;

/// Registration record for one named instance
#[derive(Clone)]
pub struct InstanceDefinition {
    pub name: String,
    pub instance_type: String,
    pub scope: InstanceScope,
    pub dependencies: BTreeMap<String, DependencySpec>,
    pub config: HashMap<String, Value>,
    pub enabled: bool,
    pub priority: i32,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    custom_factory: bool,
    provider: Provider,
}

impl InstanceDefinition {
    /// Definition built through `T::construct`
    pub fn injectable<T: Injectable>(name: &str) -> Self {
        let provider: Provider = Arc::new(|ctx: InjectionContext| {
            async move {
                let instance: Arc<dyn ManagedInstance> = Arc::new(T::construct(&ctx).await?);
                Ok(instance)
            }
            .boxed()
        });
        Self::with_provider(name, short_type_name::<T>(), provider, false)
    }

    /// Definition built by a custom factory closure
    pub fn with_factory<T, F, Fut>(name: &str, factory: F) -> Self
    where
        T: ManagedInstance,
        F: Fn(InjectionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let provider: Provider = Arc::new(move |ctx: InjectionContext| {
            let pending = factory(ctx);
            async move {
                let instance: Arc<dyn ManagedInstance> = Arc::new(pending.await?);
                Ok(instance)
            }
            .boxed()
        });
        Self::with_provider(name, short_type_name::<T>(), provider, true)
    }

    fn with_provider(name: &str, instance_type: String, provider: Provider, custom_factory: bool) -> Self {
        Self {
            name: name.to_string(),
            instance_type,
            scope: InstanceScope::Singleton,
            dependencies: BTreeMap::new(),
            config: HashMap::new(),
            enabled: true,
            priority: 0,
            tags: HashSet::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            custom_factory,
            provider,
        }
    }

    pub fn scope(mut self, scope: InstanceScope) -> Self {
        self.scope = scope;
        self
    }

    /// Bind constructor parameter `param` to definition `dependency`
    pub fn depends_on(self, param: &str, dependency: &str) -> Self {
        self.dependency(param, dependency, DependencyType::Required)
    }

    pub fn dependency(mut self, param: &str, dependency: &str, kind: DependencyType) -> Self {
        self.dependencies.insert(
            param.to_string(),
            DependencySpec {
                name: dependency.to_string(),
                kind,
            },
        );
        self
    }

    pub fn config_value<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn dependency_names(&self) -> HashSet<String> {
        self.dependencies.values().map(|d| d.name.clone()).collect()
    }

    pub fn summary(&self) -> DefinitionSummary {
        DefinitionSummary {
            name: self.name.clone(),
            instance_type: self.instance_type.clone(),
            scope: self.scope,
            dependencies: self.dependencies.clone(),
            config: self.config.clone(),
            enabled: self.enabled,
            priority: self.priority,
            tags: self.tags.iter().cloned().collect(),
            custom_factory: self.custom_factory,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for InstanceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceDefinition")
            .field("name", &self.name)
            .field("instance_type", &self.instance_type)
            .field("scope", &self.scope)
            .field("dependencies", &self.dependencies)
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

/// Serializable view of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSummary {
    pub name: String,
    pub instance_type: String,
    pub scope: InstanceScope,
    pub dependencies: BTreeMap<String, DependencySpec>,
    pub config: HashMap<String, Value>,
    pub enabled: bool,
    pub priority: i32,
    pub tags: Vec<String>,
    pub custom_factory: bool,
    pub created_at: DateTime<Utc>,
}

/// A materialized instance held by the registry
#[derive(Clone)]
pub struct InstanceReference {
    pub name: String,
    pub instance: Arc<dyn ManagedInstance>,
    pub scope: InstanceScope,
    pub context_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

struct ScopedInstance {
    instance: Arc<dyn ManagedInstance>,
    scope: InstanceScope,
    created_at: DateTime<Utc>,
    access_count: AtomicU64,
    last_accessed: std::sync::Mutex<DateTime<Utc>>,
}

impl ScopedInstance {
    fn new(instance: Arc<dyn ManagedInstance>, scope: InstanceScope) -> Self {
        let now = Utc::now();
        Self {
            instance,
            scope,
            created_at: now,
            access_count: AtomicU64::new(1),
            last_accessed: std::sync::Mutex::new(now),
        }
    }

    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_accessed.lock() {
            *last = Utc::now();
        }
    }
}

/// Registry counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub registered_definitions: usize,
    pub created_instances: u64,
    pub active_instances: usize,
    pub dependency_injections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Default)]
struct RegistryState {
    definitions: HashMap<String, InstanceDefinition>,
    // name -> names it depends on, and the reverse
    graph: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, HashSet<String>>,
    stats: RegistryStats,
}

impl RegistryState {
    fn rebuild_graphs(&mut self) {
        self.graph.clear();
        self.reverse.clear();
        for (name, definition) in &self.definitions {
            let deps = definition.dependency_names();
            for dep in &deps {
                self.reverse
                    .entry(dep.clone())
                    .or_default()
                    .insert(name.clone());
            }
            self.graph.insert(name.clone(), deps);
        }
        self.stats.registered_definitions = self.definitions.len();
    }
}

type SlotKey = (String, String);
type Slot = Arc<OnceCell<Arc<ScopedInstance>>>;

/// Dependency-injection container
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    state: Arc<RwLock<RegistryState>>,
    slots: Arc<DashMap<SlotKey, Slot>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a definition
    ///
    /// Rejected when the new edges would close a dependency cycle. Dependency
    /// names may refer to definitions registered later. Replacing a definition
    /// cleans up the instances built from the old one.
    pub async fn register(&self, definition: InstanceDefinition) -> bool {
        let name = definition.name.clone();

        let (replaced, stale) = {
            let mut state = self.state.write().await;

            let mut graph = state.graph.clone();
            graph.insert(name.clone(), definition.dependency_names());
            if let Some(cycle) = find_cycle(&graph, &name) {
                error!(
                    "Rejecting definition '{}': circular dependency {}",
                    name,
                    cycle.join(" -> ")
                );
                return false;
            }

            for dep in definition.dependency_names() {
                if !state.definitions.contains_key(&dep) {
                    debug!("Definition '{}' refers to '{}' before it is registered", name, dep);
                }
            }

            let stale = self.take_slots(|slot_name| slot_name == name);
            let replaced = state.definitions.insert(name.clone(), definition).is_some();
            state.rebuild_graphs();
            (replaced, stale)
        };

        if replaced {
            warn!("Definition '{}' was already registered, replaced it", name);
        }
        self.cleanup_references(stale).await;
        info!("Registered definition '{}'", name);
        true
    }

    /// Remove a definition and clean up its instances
    pub async fn unregister(&self, name: &str) -> bool {
        let stale = {
            let mut state = self.state.write().await;
            if state.definitions.remove(name).is_none() {
                return false;
            }
            state.rebuild_graphs();
            if let Some(dependents) = state.reverse.get(name).filter(|d| !d.is_empty()) {
                warn!(
                    "Unregistered '{}' while {} definitions still depend on it",
                    name,
                    dependents.len()
                );
            }
            self.take_slots(|slot_name| slot_name == name)
        };

        self.cleanup_references(stale).await;
        info!("Unregistered definition '{}'", name);
        true
    }

    /// Resolve an instance, logging and returning `None` on failure
    pub async fn get(&self, name: &str, context: &ResolutionContext) -> Option<Arc<dyn ManagedInstance>> {
        match self.try_get(name, context).await {
            Ok(instance) => Some(instance),
            Err(e) => {
                error!("Failed to resolve '{}': {}", name, e);
                None
            }
        }
    }

    pub async fn get_typed<T: ManagedInstance>(
        &self,
        name: &str,
        context: &ResolutionContext,
    ) -> Option<Arc<T>> {
        self.get(name, context).await.and_then(downcast_instance::<T>)
    }

    /// Resolve an instance, returning the failure cause
    pub async fn try_get(&self, name: &str, context: &ResolutionContext) -> Result<Arc<dyn ManagedInstance>> {
        let graph = self.state.read().await.graph.clone();
        if let Some(cycle) = find_cycle(&graph, name) {
            return Err(RuntimeError::CircularDependency { path: cycle });
        }
        self.resolve(name, context).await
    }

    fn resolve<'a>(
        &'a self,
        name: &'a str,
        context: &'a ResolutionContext,
    ) -> BoxFuture<'a, Result<Arc<dyn ManagedInstance>>> {
        async move {
            let definition = {
                let state = self.state.read().await;
                let definition = state
                    .definitions
                    .get(name)
                    .ok_or_else(|| RuntimeError::DefinitionNotFound(name.to_string()))?;
                if !definition.enabled {
                    return Err(RuntimeError::DefinitionDisabled(name.to_string()));
                }
                definition.clone()
            };

            let Some(key) = context.context_key(definition.scope) else {
                return self.create(&definition, context).await;
            };

            let slot = self
                .slots
                .entry((name.to_string(), key.clone()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            if let Some(existing) = slot.get() {
                existing.touch();
                self.state.write().await.stats.cache_hits += 1;
                return Ok(existing.instance.clone());
            }
            self.state.write().await.stats.cache_misses += 1;

            let scoped = slot
                .get_or_try_init(|| async {
                    let instance = self.create(&definition, context).await?;
                    Ok::<_, RuntimeError>(Arc::new(ScopedInstance::new(instance, definition.scope)))
                })
                .await?;
            Ok(scoped.instance.clone())
        }
        .boxed()
    }

    async fn create(
        &self,
        definition: &InstanceDefinition,
        context: &ResolutionContext,
    ) -> Result<Arc<dyn ManagedInstance>> {
        let mut resolved = HashMap::new();
        let mut lazy = HashMap::new();

        for (param, spec) in &definition.dependencies {
            match spec.kind {
                DependencyType::Lazy => {
                    lazy.insert(param.clone(), spec.name.clone());
                }
                DependencyType::Conditional if !self.is_enabled(&spec.name).await => {
                    debug!("Skipping conditional dependency '{}' of '{}'", spec.name, definition.name);
                }
                DependencyType::Optional => match self.resolve(&spec.name, context).await {
                    Ok(instance) => {
                        resolved.insert(param.clone(), instance);
                    }
                    Err(e) => debug!(
                        "Optional dependency '{}' of '{}' unavailable: {}",
                        spec.name, definition.name, e
                    ),
                },
                _ => {
                    let instance = self
                        .resolve(&spec.name, context)
                        .await
                        .map_err(|e| match e {
                            RuntimeError::DefinitionNotFound(_) => RuntimeError::DependencyNotFound {
                                name: definition.name.clone(),
                                dependency: spec.name.clone(),
                            },
                            other => other,
                        })?;
                    resolved.insert(param.clone(), instance);
                }
            }
        }

        let injected = resolved.len() as u64;
        let ctx = InjectionContext {
            definition: definition.name.clone(),
            resolution: context.clone(),
            config: definition.config.clone(),
            dependencies: resolved,
            lazy,
            registry: self.clone(),
        };

        let instance = (definition.provider)(ctx).await.map_err(|e| {
            error!("Creating '{}' failed: {}", definition.name, e);
            e
        })?;

        {
            let mut state = self.state.write().await;
            state.stats.created_instances += 1;
            state.stats.dependency_injections += injected;
        }
        debug!("Created instance of '{}'", definition.name);
        Ok(instance)
    }

    async fn is_enabled(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .definitions
            .get(name)
            .map_or(false, |d| d.enabled)
    }

    /// Remove every initialized slot whose definition name matches
    fn take_slots<F: Fn(&str) -> bool>(&self, matches: F) -> Vec<Arc<ScopedInstance>> {
        let keys: Vec<SlotKey> = self
            .slots
            .iter()
            .filter(|entry| matches(&entry.key().0))
            .map(|entry| entry.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }

    async fn cleanup_references(&self, references: Vec<Arc<ScopedInstance>>) {
        for reference in references {
            if let Some(hook) = reference.instance.as_cleanup() {
                if let Err(e) = hook.cleanup().await {
                    error!("Cleanup of registry instance failed: {}", e);
                }
            }
        }
    }

    /// Merge `patch` into a definition's config; cached instances are
    /// dropped so the next resolution sees the new values
    pub async fn update_config(&self, name: &str, patch: HashMap<String, Value>) -> bool {
        let stale = {
            let mut state = self.state.write().await;
            let Some(definition) = state.definitions.get_mut(name) else {
                return false;
            };
            definition.config.extend(patch);
            self.take_slots(|slot_name| slot_name == name)
        };
        self.cleanup_references(stale).await;
        true
    }

    pub async fn enable(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        match state.definitions.get_mut(name) {
            Some(definition) => {
                definition.enabled = true;
                true
            }
            None => false,
        }
    }

    /// Disable a definition and clean up its instances
    pub async fn disable(&self, name: &str) -> bool {
        let stale = {
            let mut state = self.state.write().await;
            let Some(definition) = state.definitions.get_mut(name) else {
                return false;
            };
            definition.enabled = false;
            self.take_slots(|slot_name| slot_name == name)
        };
        self.cleanup_references(stale).await;
        true
    }

    pub async fn find_by_tag(&self, tag: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .definitions
            .values()
            .filter(|d| d.tags.contains(tag))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn find_by_type(&self, instance_type: &str) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state
            .definitions
            .values()
            .filter(|d| d.instance_type == instance_type)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn get_definition(&self, name: &str) -> Option<DefinitionSummary> {
        self.state
            .read()
            .await
            .definitions
            .get(name)
            .map(InstanceDefinition::summary)
    }

    /// Definitions ordered by descending priority, then name
    pub async fn list_definitions(&self) -> Vec<DefinitionSummary> {
        let state = self.state.read().await;
        let mut summaries: Vec<DefinitionSummary> =
            state.definitions.values().map(InstanceDefinition::summary).collect();
        summaries.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        summaries
    }

    pub async fn get_instance_dependencies(&self, name: &str) -> Vec<String> {
        sorted(self.state.read().await.graph.get(name))
    }

    pub async fn get_instance_dependents(&self, name: &str) -> Vec<String> {
        sorted(self.state.read().await.reverse.get(name))
    }

    /// Materialized instances, optionally for one definition
    pub fn list_instances(&self, name: Option<&str>) -> Vec<InstanceReference> {
        let mut references: Vec<InstanceReference> = self
            .slots
            .iter()
            .filter(|entry| name.map_or(true, |n| entry.key().0 == n))
            .filter_map(|entry| {
                let (definition, key) = entry.key().clone();
                entry.value().get().map(|scoped| InstanceReference {
                    name: definition,
                    instance: scoped.instance.clone(),
                    scope: scoped.scope,
                    context_key: Some(key),
                    created_at: scoped.created_at,
                    access_count: scoped.access_count.load(Ordering::Relaxed),
                    last_accessed: scoped
                        .last_accessed
                        .lock()
                        .map(|t| *t)
                        .unwrap_or(scoped.created_at),
                })
            })
            .collect();
        references.sort_by(|a, b| (&a.name, &a.context_key).cmp(&(&b.name, &b.context_key)));
        references
    }

    /// Drop cached instances, optionally only those of one scope
    pub async fn clear_cache(&self, scope: Option<InstanceScope>) -> usize {
        let names: HashSet<String> = {
            let state = self.state.read().await;
            state
                .definitions
                .values()
                .filter(|d| scope.map_or(true, |s| d.scope == s))
                .map(|d| d.name.clone())
                .collect()
        };

        let stale = self.take_slots(|slot_name| scope.is_none() || names.contains(slot_name));
        let count = stale.len();
        self.cleanup_references(stale).await;
        debug!("Cleared {} cached registry instances", count);
        count
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let mut stats = self.state.read().await.stats.clone();
        stats.active_instances = self
            .slots
            .iter()
            .filter(|entry| entry.value().initialized())
            .count();
        stats
    }

    /// Clean up every cached instance and forget all definitions
    pub async fn shutdown(&self) {
        self.clear_cache(None).await;
        let mut state = self.state.write().await;
        state.definitions.clear();
        state.rebuild_graphs();
        info!("Instance registry shut down");
    }
}

fn sorted(names: Option<&HashSet<String>>) -> Vec<String> {
    let mut names: Vec<String> = names.map(|n| n.iter().cloned().collect()).unwrap_or_default();
    names.sort();
    names
}

/// Depth-first search for a cycle reachable from `start`
///
/// Iterative so deep graphs cannot overflow the stack. Returns the cycle as
/// a path ending at the repeated node.
pub(crate) fn find_cycle(graph: &HashMap<String, HashSet<String>>, start: &str) -> Option<Vec<String>> {
    let neighbours = |node: &str| -> Vec<String> {
        let mut next: Vec<String> = graph
            .get(node)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        // popped from the back, so reverse order gives alphabetical traversal
        next.sort_by(|a, b| b.cmp(a));
        next
    };

    let mut path = vec![start.to_string()];
    let mut on_path: HashSet<String> = HashSet::from([start.to_string()]);
    let mut finished: HashSet<String> = HashSet::new();
    let mut pending = vec![neighbours(start)];

    while let Some(frame) = pending.last_mut() {
        match frame.pop() {
            Some(next) => {
                if on_path.contains(&next) {
                    let from = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                if finished.contains(&next) {
                    continue;
                }
                on_path.insert(next.clone());
                pending.push(neighbours(&next));
                path.push(next);
            }
            None => {
                pending.pop();
                if let Some(done) = path.pop() {
                    on_path.remove(&done);
                    finished.insert(done);
                }
            }
        }
    }
    None
}
