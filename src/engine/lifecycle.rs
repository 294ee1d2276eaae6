// Instance Lifecycle Manager
// Per-instance state machine, health-check loops, retry policy and expiry sweep

//! # Instance Lifecycle Manager
//!
//! Every tracked instance gets a lifecycle record holding its
//! [`InstanceState`], policy and metrics. All state changes go through
//! [`InstanceState::can_transition_to`], and a record that is mid-transition
//! rejects a second transition on the same id, so two concurrent `activate`
//! calls can never start two health loops.
//!
//! ## Health loop
//!
//! ```text
//!   sleep(interval) ──▶ probe ──ok──▶ record check ──▶ sleep ...
//!                         │
//!                        err
//!                         ▼
//!                  ERROR, error_count += 1, OnError hooks
//!                         │
//!       retry budget left ├──▶ sleep(retry_delay) ──▶ ACTIVE ──▶ sleep ...
//!                         └──▶ force cleanup, loop ends
//! ```
//!
//! Loops are cancelled through a child of the manager's `CancellationToken`.
//! Hooks and instance capabilities are always called with no lock held.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LifecycleManagerConfig;
use crate::models::{
    InstanceMetrics, InstanceState, LifecycleConfig, LifecycleEvent, LifecycleStats,
    ManagedInstance,
};
use crate::{Result, RuntimeError};

/// Free-form context stored with a record and handed to hooks
pub type HookContext = HashMap<String, Value>;

/// Handler run at a lifecycle event
///
/// Returning `Ok(false)` or an error marks the hook as failed. A failing
/// `BeforeCreate` or `BeforeActivate` hook aborts that transition; failures
/// at other events are logged only.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_event(
        &self,
        event: LifecycleEvent,
        instance_id: &str,
        context: &HookContext,
    ) -> Result<bool>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> LifecycleHook for FnHook<F>
where
    F: Fn(LifecycleEvent, &str, &HookContext) -> bool + Send + Sync,
{
    async fn on_event(
        &self,
        event: LifecycleEvent,
        instance_id: &str,
        context: &HookContext,
    ) -> Result<bool> {
        Ok((self.0)(event, instance_id, context))
    }
}

#[derive(Clone)]
struct RegisteredHook {
    hook_id: String,
    priority: i32,
    hook: Arc<dyn LifecycleHook>,
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct LifecycleRecord {
    state: InstanceState,
    config: LifecycleConfig,
    metrics: InstanceMetrics,
    context: HookContext,
    instance: Weak<dyn ManagedInstance>,

    /// Set while a transition runs its hooks outside the lock
    in_transition: bool,
    health_task: Option<HealthTask>,
}

#[derive(Default)]
struct LifecycleState {
    records: HashMap<String, LifecycleRecord>,
    cleaned_instances: u64,
    health_checks_performed: u64,
    errors_detected: u64,
    auto_cleanups_performed: u64,
    last_cleanup: Option<chrono::DateTime<Utc>>,
}

/// Public view of one lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceLifecycleInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub config: LifecycleConfig,
    pub metrics: InstanceMetrics,
    pub context: HookContext,
}

enum ErrorDecision {
    Retry,
    Hold,
    Teardown,
}

/// Owns the lifecycle state machine of every tracked instance
#[derive(Clone)]
pub struct InstanceLifecycleManager {
    config: LifecycleManagerConfig,
    state: Arc<RwLock<LifecycleState>>,
    hooks: Arc<RwLock<HashMap<LifecycleEvent, Vec<RegisteredHook>>>>,
    cancel: CancellationToken,
    sweep_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl InstanceLifecycleManager {
    pub fn new(config: LifecycleManagerConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(LifecycleState::default())),
            hooks: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            sweep_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Manager with hooks installed before any instance is registered
    pub fn with_hooks<I>(config: LifecycleManagerConfig, hooks: I) -> Self
    where
        I: IntoIterator<Item = (LifecycleEvent, Arc<dyn LifecycleHook>, i32)>,
    {
        let mut table: HashMap<LifecycleEvent, Vec<RegisteredHook>> = HashMap::new();
        for (event, hook, priority) in hooks {
            table.entry(event).or_default().push(RegisteredHook {
                hook_id: Uuid::new_v4().to_string(),
                priority,
                hook,
            });
        }
        for entries in table.values_mut() {
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let manager = Self::new(config);
        Self {
            hooks: Arc::new(RwLock::new(table)),
            ..manager
        }
    }

    /// Policy applied to instances registered without one
    pub fn default_config(&self) -> &LifecycleConfig {
        &self.config.defaults
    }

    //===============================================================
    // Hooks
    //===============================================================

    /// Register a hook; higher priorities run first. Returns the hook id.
    pub async fn add_lifecycle_hook(
        &self,
        event: LifecycleEvent,
        hook: Arc<dyn LifecycleHook>,
        priority: i32,
    ) -> String {
        let hook_id = Uuid::new_v4().to_string();
        let mut hooks = self.hooks.write().await;
        let entries = hooks.entry(event).or_default();
        entries.push(RegisteredHook {
            hook_id: hook_id.clone(),
            priority,
            hook,
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        debug!("Added {:?} hook {} (priority {})", event, hook_id, priority);
        hook_id
    }

    /// Register a plain closure as a hook
    pub async fn add_hook_fn<F>(&self, event: LifecycleEvent, priority: i32, hook: F) -> String
    where
        F: Fn(LifecycleEvent, &str, &HookContext) -> bool + Send + Sync + 'static,
    {
        self.add_lifecycle_hook(event, Arc::new(FnHook(hook)), priority)
            .await
    }

    pub async fn remove_lifecycle_hook(&self, hook_id: &str) -> bool {
        let mut hooks = self.hooks.write().await;
        for entries in hooks.values_mut() {
            if let Some(pos) = entries.iter().position(|h| h.hook_id == hook_id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Run every hook for `event`; true when all of them succeeded
    async fn run_hooks(&self, event: LifecycleEvent, instance_id: &str, context: &HookContext) -> bool {
        let hooks: Vec<RegisteredHook> = {
            let hooks = self.hooks.read().await;
            hooks.get(&event).cloned().unwrap_or_default()
        };

        let mut all_ok = true;
        for registered in hooks {
            match registered.hook.on_event(event, instance_id, context).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "{:?} hook {} rejected instance {}",
                        event, registered.hook_id, instance_id
                    );
                    all_ok = false;
                }
                Err(e) => {
                    error!(
                        "{:?} hook {} failed for instance {}: {}",
                        event, registered.hook_id, instance_id, e
                    );
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    //===============================================================
    // Transitions
    //===============================================================

    /// Start tracking an instance in CREATING; duplicate ids are rejected
    pub async fn register_instance(
        &self,
        instance_id: &str,
        instance: &Arc<dyn ManagedInstance>,
        config: Option<LifecycleConfig>,
        context: HookContext,
    ) -> bool {
        {
            let mut state = self.state.write().await;
            if state.records.contains_key(instance_id) {
                warn!("Instance {} is already registered", instance_id);
                return false;
            }
            state.records.insert(
                instance_id.to_string(),
                LifecycleRecord {
                    state: InstanceState::Creating,
                    config: config.unwrap_or_else(|| self.config.defaults.clone()),
                    metrics: InstanceMetrics::new(),
                    context: context.clone(),
                    instance: Arc::downgrade(instance),
                    in_transition: true,
                    health_task: None,
                },
            );
        }

        if !self
            .run_hooks(LifecycleEvent::BeforeCreate, instance_id, &context)
            .await
        {
            self.state.write().await.records.remove(instance_id);
            warn!("Registration of {} aborted by BeforeCreate hook", instance_id);
            return false;
        }

        if let Some(record) = self.state.write().await.records.get_mut(instance_id) {
            record.in_transition = false;
        }

        self.run_hooks(LifecycleEvent::AfterCreate, instance_id, &context)
            .await;
        info!("Instance {} registered", instance_id);
        true
    }

    /// CREATING -> ACTIVE; starts the health loop when the interval is non-zero
    pub async fn activate(&self, instance_id: &str) -> bool {
        match self
            .enter_active(instance_id, &[InstanceState::Creating])
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Activation of {} refused: {}", instance_id, e);
                false
            }
        }
    }

    /// INACTIVE/PAUSED -> ACTIVE
    pub async fn resume(&self, instance_id: &str) -> bool {
        match self
            .enter_active(instance_id, &[InstanceState::Inactive, InstanceState::Paused])
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Resume of {} refused: {}", instance_id, e);
                false
            }
        }
    }

    async fn enter_active(&self, instance_id: &str, allowed_from: &[InstanceState]) -> Result<()> {
        let context = self
            .begin_transition(instance_id, allowed_from, InstanceState::Active)
            .await?;

        if !self
            .run_hooks(LifecycleEvent::BeforeActivate, instance_id, &context)
            .await
        {
            self.end_transition(instance_id).await;
            return Err(RuntimeError::InvalidInput(format!(
                "BeforeActivate hook aborted activation of {}",
                instance_id
            )));
        }

        {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(instance_id)
                .ok_or_else(|| RuntimeError::InstanceNotFound(instance_id.to_string()))?;
            if !allowed_from.contains(&record.state) {
                // a forced cleanup overtook this activation
                return Err(RuntimeError::InvalidTransition {
                    instance_id: instance_id.to_string(),
                    from: record.state.to_string(),
                    to: InstanceState::Active.to_string(),
                });
            }

            let now = Utc::now();
            record.state = InstanceState::Active;
            record.metrics.activated_at = Some(now);
            record.metrics.last_active_at = now;
            record.in_transition = false;

            let interval = record.config.health_check_interval();
            if !interval.is_zero() && record.health_task.is_none() {
                record.health_task = Some(self.spawn_health_loop(instance_id, interval));
            }
        }

        self.run_hooks(LifecycleEvent::AfterActivate, instance_id, &context)
            .await;
        info!("Instance {} activated", instance_id);
        Ok(())
    }

    /// ACTIVE -> INACTIVE; stops the health loop
    pub async fn deactivate(&self, instance_id: &str) -> bool {
        self.leave_active(instance_id, InstanceState::Inactive).await
    }

    /// ACTIVE -> PAUSED; stops the health loop
    pub async fn pause(&self, instance_id: &str) -> bool {
        self.leave_active(instance_id, InstanceState::Paused).await
    }

    async fn leave_active(&self, instance_id: &str, target: InstanceState) -> bool {
        let context = match self
            .begin_transition(instance_id, &[InstanceState::Active], target)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!("Cannot move {} to {}: {}", instance_id, target, e);
                return false;
            }
        };

        if !self
            .run_hooks(LifecycleEvent::BeforeDeactivate, instance_id, &context)
            .await
        {
            debug!("BeforeDeactivate hooks reported failures for {}", instance_id);
        }

        let task = {
            let mut state = self.state.write().await;
            match state.records.get_mut(instance_id) {
                Some(record) if record.state == InstanceState::Active => {
                    record.state = target;
                    record.metrics.close_active_period();
                    record.in_transition = false;
                    record.health_task.take()
                }
                _ => return false,
            }
        };
        if let Some(task) = task {
            task.token.cancel();
        }

        self.run_hooks(LifecycleEvent::AfterDeactivate, instance_id, &context)
            .await;
        info!("Instance {} is now {}", instance_id, target);
        true
    }

    /// Reserve a transition: checks the edge and marks the record busy
    async fn begin_transition(
        &self,
        instance_id: &str,
        allowed_from: &[InstanceState],
        target: InstanceState,
    ) -> Result<HookContext> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(instance_id)
            .ok_or_else(|| RuntimeError::InstanceNotFound(instance_id.to_string()))?;

        if record.in_transition
            || !allowed_from.contains(&record.state)
            || !record.state.can_transition_to(target)
        {
            return Err(RuntimeError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: if record.in_transition {
                    format!("{} (transition in flight)", record.state)
                } else {
                    record.state.to_string()
                },
                to: target.to_string(),
            });
        }

        record.in_transition = true;
        Ok(record.context.clone())
    }

    async fn end_transition(&self, instance_id: &str) {
        if let Some(record) = self.state.write().await.records.get_mut(instance_id) {
            record.in_transition = false;
        }
    }

    /// Tear an instance down and forget it
    ///
    /// Refuses an ACTIVE instance unless `force` is set. Unknown ids count as
    /// already cleaned.
    pub async fn cleanup_instance(&self, instance_id: &str, force: bool) -> bool {
        let (instance, context, task) = {
            let mut state = self.state.write().await;
            let record = match state.records.get_mut(instance_id) {
                Some(record) => record,
                None => {
                    debug!("Instance {} not tracked, nothing to clean up", instance_id);
                    return true;
                }
            };

            if !force && (record.state == InstanceState::Active || record.in_transition) {
                warn!(
                    "Refusing to clean up {} in state {} without force",
                    instance_id, record.state
                );
                return false;
            }
            if record.state.is_terminal() {
                debug!("Cleanup of {} already in progress", instance_id);
                return false;
            }

            record.state = InstanceState::Terminating;
            record.in_transition = true;
            record.metrics.close_active_period();
            (
                record.instance.clone(),
                record.context.clone(),
                record.health_task.take(),
            )
        };

        if let Some(task) = task {
            task.token.cancel();
        }

        self.run_hooks(LifecycleEvent::BeforeCleanup, instance_id, &context)
            .await;

        if let Some(instance) = instance.upgrade() {
            if let Some(hook) = instance.as_cleanup() {
                if let Err(e) = hook.cleanup().await {
                    error!("Cleanup hook of {} failed: {}", instance_id, e);
                }
            }
        }

        {
            let mut state = self.state.write().await;
            if let Some(record) = state.records.get_mut(instance_id) {
                if record.state.can_transition_to(InstanceState::Terminated) {
                    record.state = InstanceState::Terminated;
                }
            }
            state.records.remove(instance_id);
            state.cleaned_instances += 1;
            state.last_cleanup = Some(Utc::now());
        }

        self.run_hooks(LifecycleEvent::AfterCleanup, instance_id, &context)
            .await;
        info!("Instance {} cleaned up", instance_id);
        true
    }

    //===============================================================
    // Activity and errors
    //===============================================================

    /// Record activity, pushing back the expiry deadline
    pub async fn touch(&self, instance_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.records.get_mut(instance_id) {
            Some(record) => {
                record.metrics.last_active_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Count one request against the instance
    pub async fn record_request(&self, instance_id: &str, success: bool) -> bool {
        let mut state = self.state.write().await;
        let Some(record) = state.records.get_mut(instance_id) else {
            return false;
        };
        if !record.config.enable_metrics {
            return true;
        }

        record.metrics.total_requests += 1;
        if success {
            record.metrics.successful_requests += 1;
        } else {
            record.metrics.failed_requests += 1;
        }
        record.metrics.last_active_at = Utc::now();
        true
    }

    /// Report an error raised by the instance's own work
    ///
    /// Error handling (including any retry delay) runs in the background.
    pub fn report_error(&self, instance_id: &str, message: &str) {
        let manager = self.clone();
        let instance_id = instance_id.to_string();
        let error = RuntimeError::Internal(message.to_string());
        tokio::spawn(async move {
            let token = manager.cancel.child_token();
            manager.handle_error(&instance_id, error, &token).await;
        });
    }

    fn spawn_health_loop(&self, instance_id: &str, interval: std::time::Duration) -> HealthTask {
        let token = self.cancel.child_token();
        let manager = self.clone();
        let loop_token = token.clone();
        let instance_id = instance_id.to_string();

        let handle = tokio::spawn(async move {
            debug!("Health loop started for {}", instance_id);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = time::sleep(interval) => {}
                }

                match manager.perform_health_check(&instance_id).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        if loop_token.is_cancelled() {
                            break;
                        }
                        if !manager.handle_error(&instance_id, e, &loop_token).await {
                            break;
                        }
                    }
                }
            }
            debug!("Health loop stopped for {}", instance_id);
        });

        HealthTask { token, handle }
    }

    /// One health probe. `Ok(false)` means the record is gone and the loop
    /// should stop.
    async fn perform_health_check(&self, instance_id: &str) -> Result<bool> {
        let (instance, context) = {
            let state = self.state.read().await;
            match state.records.get(instance_id) {
                Some(record) if !record.state.is_terminal() => {
                    (record.instance.clone(), record.context.clone())
                }
                _ => return Ok(false),
            }
        };

        let instance = instance
            .upgrade()
            .ok_or_else(|| RuntimeError::InstanceCollected(instance_id.to_string()))?;

        if let Some(probe) = instance.as_health_check() {
            if !probe.health_check().await? {
                return Err(RuntimeError::HealthCheckFailed(instance_id.to_string()));
            }
        }
        drop(instance);

        {
            let mut state = self.state.write().await;
            state.health_checks_performed += 1;
            if let Some(record) = state.records.get_mut(instance_id) {
                record.metrics.last_health_check = Some(Utc::now());
                record.metrics.health_check_count += 1;
                if record.state == InstanceState::Error && !record.config.retry_on_error {
                    record.state = InstanceState::Active;
                    record.metrics.activated_at = Some(Utc::now());
                    info!("Instance {} passed a health check and is active again", instance_id);
                }
            }
        }

        let mut hook_context = context;
        hook_context.insert("healthy".to_string(), json!(true));
        self.run_hooks(LifecycleEvent::OnHealthCheck, instance_id, &hook_context)
            .await;
        Ok(true)
    }

    /// Move an instance into ERROR and apply its retry policy
    ///
    /// Returns whether the health loop should keep running.
    async fn handle_error(
        &self,
        instance_id: &str,
        error: RuntimeError,
        token: &CancellationToken,
    ) -> bool {
        let (decision, context, error_count, retry_delay, auto_cleanup) = {
            let mut state = self.state.write().await;
            let Some(record) = state.records.get_mut(instance_id) else {
                return false;
            };
            let eligible = record.state == InstanceState::Error || record.state.is_live();
            if !eligible || record.in_transition {
                // another transition owns the record right now
                return !record.state.is_terminal();
            }

            if record.state != InstanceState::Error {
                record.metrics.close_active_period();
                record.state = InstanceState::Error;
            }
            record.metrics.error_count += 1;

            let config = &record.config;
            let count = record.metrics.error_count;
            let decision = if config.retry_on_error {
                if count <= config.max_retry_attempts {
                    ErrorDecision::Retry
                } else {
                    ErrorDecision::Teardown
                }
            } else if count >= config.max_error_count {
                ErrorDecision::Teardown
            } else {
                ErrorDecision::Hold
            };

            let result = (
                decision,
                record.context.clone(),
                count,
                config.retry_delay(),
                config.auto_cleanup,
            );
            state.errors_detected += 1;
            result
        };

        warn!(
            "Instance {} entered ERROR ({} errors): {}",
            instance_id, error_count, error
        );

        let mut hook_context = context;
        hook_context.insert("error".to_string(), json!(error.to_string()));
        hook_context.insert("error_count".to_string(), json!(error_count));
        self.run_hooks(LifecycleEvent::OnError, instance_id, &hook_context)
            .await;

        match decision {
            ErrorDecision::Retry => {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = time::sleep(retry_delay) => {}
                }

                let mut state = self.state.write().await;
                match state.records.get_mut(instance_id) {
                    Some(record) if record.state == InstanceState::Error => {
                        record.state = InstanceState::Active;
                        record.metrics.activated_at = Some(Utc::now());
                        info!(
                            "Instance {} re-activated after error (attempt {})",
                            instance_id, error_count
                        );
                        true
                    }
                    _ => false,
                }
            }
            ErrorDecision::Hold => true,
            ErrorDecision::Teardown => {
                if auto_cleanup {
                    warn!("Retry budget exhausted for {}, cleaning up", instance_id);
                    if self.cleanup_instance(instance_id, true).await {
                        self.state.write().await.auto_cleanups_performed += 1;
                    }
                } else {
                    warn!(
                        "Retry budget exhausted for {}, leaving it in ERROR",
                        instance_id
                    );
                }
                false
            }
        }
    }

    //===============================================================
    // Sweep and queries
    //===============================================================

    /// Force-clean every instance idle for longer than `max_inactive`
    /// (or its own configured limit); running it twice removes nothing new
    pub async fn cleanup_expired_instances(&self, max_inactive: Option<chrono::Duration>) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = {
            let state = self.state.read().await;
            state
                .records
                .iter()
                .filter(|(_, record)| !record.state.is_terminal())
                .filter(|(_, record)| {
                    let limit = max_inactive.unwrap_or_else(|| record.config.max_inactive());
                    now - record.metrics.last_active_at > limit
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut cleaned = 0;
        for instance_id in &expired {
            if self.cleanup_instance(instance_id, true).await {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            self.state.write().await.auto_cleanups_performed += cleaned as u64;
            info!("Expiry sweep cleaned {} instances", cleaned);
        }
        cleaned
    }

    pub async fn get_instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.state
            .read()
            .await
            .records
            .get(instance_id)
            .map(|record| record.state)
    }

    pub async fn get_instance_metrics(&self, instance_id: &str) -> Option<InstanceMetrics> {
        self.state
            .read()
            .await
            .records
            .get(instance_id)
            .map(|record| record.metrics.clone())
    }

    pub async fn get_instance_info(&self, instance_id: &str) -> Option<InstanceLifecycleInfo> {
        let state = self.state.read().await;
        state
            .records
            .get(instance_id)
            .map(|record| to_info(instance_id, record))
    }

    pub async fn list_instances(&self, filter: Option<InstanceState>) -> Vec<InstanceLifecycleInfo> {
        let state = self.state.read().await;
        let mut infos: Vec<InstanceLifecycleInfo> = state
            .records
            .iter()
            .filter(|(_, record)| filter.map_or(true, |s| record.state == s))
            .map(|(id, record)| to_info(id, record))
            .collect();
        infos.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        infos
    }

    pub async fn get_stats(&self) -> LifecycleStats {
        let state = self.state.read().await;
        LifecycleStats {
            total_instances: state.records.len(),
            active_instances: state
                .records
                .values()
                .filter(|r| r.state == InstanceState::Active)
                .count(),
            error_instances: state
                .records
                .values()
                .filter(|r| r.state == InstanceState::Error)
                .count(),
            cleaned_instances: state.cleaned_instances,
            health_checks_performed: state.health_checks_performed,
            errors_detected: state.errors_detected,
            auto_cleanups_performed: state.auto_cleanups_performed,
            last_cleanup: state.last_cleanup,
        }
    }

    //===============================================================
    // Background tasks
    //===============================================================

    /// Spawn the expiry sweep if auto-cleanup is enabled
    pub async fn start(&self) {
        if !self.config.defaults.auto_cleanup {
            return;
        }
        let mut task = self.sweep_task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let manager = self.clone();
        let token = self.cancel.clone();
        let period = self.config.sweep_interval();

        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup_expired_instances(None).await;
                    }
                }
            }
            debug!("Lifecycle sweep stopped");
        }));
    }

    /// Stop every loop, wait for them, then force-clean all records
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handles.push(handle);
        }
        {
            let mut state = self.state.write().await;
            for record in state.records.values_mut() {
                if let Some(task) = record.health_task.take() {
                    task.token.cancel();
                    handles.push(task.handle);
                }
            }
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Lifecycle task ended abnormally: {}", e);
            }
        }

        let ids: Vec<String> = self.state.read().await.records.keys().cloned().collect();
        for instance_id in ids {
            self.cleanup_instance(&instance_id, true).await;
        }
        info!("Lifecycle manager shut down");
    }
}

impl Default for InstanceLifecycleManager {
    fn default() -> Self {
        Self::new(LifecycleManagerConfig::default())
    }
}

fn to_info(instance_id: &str, record: &LifecycleRecord) -> InstanceLifecycleInfo {
    InstanceLifecycleInfo {
        instance_id: instance_id.to_string(),
        state: record.state,
        config: record.config.clone(),
        metrics: record.metrics.clone(),
        context: record.context.clone(),
    }
}
